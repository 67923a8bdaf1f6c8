//! # Desync Core
//!
//! The adaptive desynchronization core of a circumvention proxy: a
//! per-connection state machine that rewrites the first outbound payload of
//! a TCP flow (and selected UDP datagrams) through a sequence of candidate
//! desync strategies until one succeeds, learning per destination which
//! strategy works and caching the result.
//!
//! ## Architecture
//!
//! The core is built from three layers:
//! - **App Layer**: the flow state machine, strategy selector, failure
//!   classifier, first-payload classifier, and the mangler seam
//! - **Service Layer**: the destination → strategy cache shared by all flows
//! - **System Layer**: raw socket controls (user timeout, linger, TTL) and
//!   the Linux fd handoff to a VPN protect helper
//!
//! ## Integration
//!
//! The owning proxy accepts clients and resolves destinations; each
//! accepted connection is handed to [`DesyncEngine::run_flow`], which
//! drives the flow to completion. The actual payload mangling lives behind
//! the [`PayloadMangler`] trait; [`DirectMangler`] is the passthrough
//! baseline.

pub mod app;
pub mod config;
pub mod service;
pub mod system;

pub use app::engine::{DesyncEngine, FlowAction};
pub use app::flow::{Flow, FlowState};
pub use app::mangle::{DirectMangler, PayloadMangler};
pub use app::udp::UdpFlow;
pub use config::{DesyncStrategy, Params};
pub use service::cache::{CacheOutcome, StrategyCache};
