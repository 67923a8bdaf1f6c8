//! # Configuration Module for the Desync Core
//!
//! This module provides the configuration structures for the desynchronization
//! engine. It defines the ordered strategy list, the failure-detection and
//! protocol bitmasks each strategy is matched with, and the process-wide
//! parameters (cache TTL, payload buffer cap, socket timeout, TTL override,
//! protect socket path).
//!
//! ## Configuration Categories
//!
//! - Failure-detection flags (`DETECT_*`): which observed failure a strategy
//!   is designed to counter. A strategy with no detect flags is an
//!   unconditional baseline and terminates every selection scan.
//! - Protocol flags (`PROTO_*`): which first-payload shapes a strategy
//!   applies to.
//! - `DesyncStrategy`: one position in the ordered strategy list, together
//!   with the opaque tamper parameters consumed by the payload mangler.
//! - `Params`: the process-wide read-only parameter block, passed to the
//!   engine as an explicit `Arc` handle.
//!
//! ## Usage
//!
//! Parameters deserialize from JSON via serde. `Params::from_json` parses and
//! validates in one step; `Params::validate` can be re-run after manual
//! construction.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;

/// Strategy counters a peer reset or connect timeout (TORST).
pub const DETECT_TORST: u8 = 1 << 0;
/// Strategy counters a broken TLS handshake.
pub const DETECT_TLS_ERR: u8 = 1 << 1;
/// Strategy counters an HTTP redirect to a block page.
pub const DETECT_HTTP_LOCAT: u8 = 1 << 2;

/// Matches any TCP first payload.
pub const PROTO_TCP: u8 = 1 << 0;
/// Matches a plain HTTP request first payload.
pub const PROTO_HTTP: u8 = 1 << 1;
/// Matches a TLS ClientHello first payload.
pub const PROTO_HTTPS: u8 = 1 << 2;
/// Matches UDP datagrams.
pub const PROTO_UDP: u8 = 1 << 3;

const ALL_DETECT: u8 = DETECT_TORST | DETECT_TLS_ERR | DETECT_HTTP_LOCAT;
const ALL_PROTO: u8 = PROTO_TCP | PROTO_HTTP | PROTO_HTTPS | PROTO_UDP;

fn default_cache_ttl() -> i64 {
    100800
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_bfsize() -> usize {
    16384
}

fn default_def_ttl() -> u8 {
    8
}

/// One position in the ordered strategy list.
///
/// A strategy matches a flow when every *present* precondition holds:
/// destination port inside `port_range` (inclusive), protocol mask
/// intersecting the observed first payload, and SNI/Host inside `hosts`.
/// Absent preconditions always hold.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DesyncStrategy {
    /// Failure conditions this strategy is designed to counter. Zero means
    /// the strategy is an unconditional baseline.
    #[serde(default)]
    pub detect: u8,

    /// Inclusive destination port range this strategy is restricted to.
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,

    /// Protocol mask (`PROTO_*`); zero means any protocol.
    #[serde(default)]
    pub proto: u8,

    /// Domain suffixes (TLS SNI or HTTP Host) this strategy is restricted to.
    #[serde(default)]
    pub hosts: Option<HashSet<String>>,

    /// Opaque payload-mangling parameters handed to the mangler as-is.
    #[serde(default)]
    pub tamper: serde_json::Value,
}

impl Default for DesyncStrategy {
    fn default() -> Self {
        Self {
            detect: 0,
            port_range: None,
            proto: 0,
            hosts: None,
            tamper: serde_json::Value::Null,
        }
    }
}

impl DesyncStrategy {
    /// Inclusive port range check; an absent range matches every port.
    pub fn matches_port(&self, port: u16) -> bool {
        match self.port_range {
            Some((lo, hi)) => port >= lo && port <= hi,
            None => true,
        }
    }
}

/// Process-wide read-only parameters for the desync engine.
///
/// Built once at startup and shared behind an `Arc`; nothing in the engine
/// mutates it afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Params {
    /// Ordered strategy list; index 0 is the do-nothing baseline.
    #[serde(default)]
    pub dp: Vec<DesyncStrategy>,

    /// Seconds a cached destination decision stays fresh.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: i64,

    /// Bound on the number of cached destinations.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Per-flow user-timeout in seconds for the desync payload delivery;
    /// zero disables it.
    #[serde(default)]
    pub timeout: u64,

    /// Zero disables adaptive retry on FIN/no-data; one or higher enables it.
    #[serde(default)]
    pub auto_level: u8,

    /// Maximum first-payload buffer size in bytes.
    #[serde(default = "default_bfsize")]
    pub bfsize: usize,

    /// Whether fresh upstream sockets get their IP TTL / hop limit overridden.
    #[serde(default)]
    pub custom_ttl: bool,

    /// TTL value applied when `custom_ttl` is set.
    #[serde(default = "default_def_ttl")]
    pub def_ttl: u8,

    /// Unix-socket path of the VPN protect helper; unset disables the handoff.
    #[serde(default)]
    pub protect_path: Option<String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            dp: vec![DesyncStrategy::default()],
            cache_ttl: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            timeout: 0,
            auto_level: 0,
            bfsize: default_bfsize(),
            custom_ttl: false,
            def_ttl: default_def_ttl(),
            protect_path: None,
        }
    }
}

impl Params {
    /// Parse and validate a parameter block from JSON.
    pub fn from_json(raw: &str) -> io::Result<Self> {
        let params: Params = serde_json::from_str(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        params.validate()?;
        Ok(params)
    }

    /// Validate the parameter block; logs and rejects malformed entries.
    pub fn validate(&self) -> io::Result<()> {
        if self.dp.is_empty() {
            log::error!("Strategy list is empty, at least the baseline is required");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty strategy list",
            ));
        }
        if self.bfsize == 0 {
            log::error!("First-payload buffer size must be positive");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bfsize is 0"));
        }
        if self.cache_capacity == 0 {
            log::error!("Cache capacity must be positive");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cache capacity is 0",
            ));
        }
        for (m, dp) in self.dp.iter().enumerate() {
            if dp.detect & !ALL_DETECT != 0 {
                log::error!("Strategy {}: unknown detect flags {:#04x}", m, dp.detect);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unknown detect flags",
                ));
            }
            if dp.proto & !ALL_PROTO != 0 {
                log::error!("Strategy {}: unknown proto flags {:#04x}", m, dp.proto);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unknown proto flags",
                ));
            }
            if let Some((lo, hi)) = dp.port_range {
                if lo > hi {
                    log::error!("Strategy {}: inverted port range {}-{}", m, lo, hi);
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "inverted port range",
                    ));
                }
            }
        }
        if self.custom_ttl && self.def_ttl == 0 {
            log::error!("TTL override enabled with TTL 0");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "TTL 0"));
        }
        Ok(())
    }
}
