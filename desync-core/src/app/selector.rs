//! Strategy selection scans.
//!
//! Two kinds of scan run over the ordered strategy list: the *selection*
//! scan picks the first unconditional strategy whose preconditions match a
//! fresh flow, and the *detect* scan looks for the next strategy designed
//! to counter an observed failure. Both stop at the lowest matching index.

use std::net::SocketAddr;

use crate::app::classifier;
use crate::config::{Params, PROTO_HTTP, PROTO_HTTPS, PROTO_TCP, PROTO_UDP};

/// Result of a scan over the strategy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The strategy at this index matched.
    Selected(usize),
    /// An unconditional (`detect == 0`) strategy ended the scan: fall back
    /// to the baseline and change nothing.
    CollapseToBaseline,
    /// The list ran out without a match.
    Exhausted,
}

/// Protocol precondition for a TCP first payload. An empty mask matches
/// everything; `PROTO_TCP` matches any TCP flow regardless of content.
fn check_proto_tcp(proto: u8, payload: &[u8]) -> bool {
    if proto & PROTO_TCP != 0 {
        return true;
    }
    if proto & PROTO_HTTP != 0 && classifier::is_http(payload) {
        return true;
    }
    if proto & PROTO_HTTPS != 0 && classifier::is_tls_chello(payload) {
        return true;
    }
    false
}

/// Pick the strategy for a fresh TCP flow from its first payload.
///
/// Only unconditional strategies are eligible here; conditional ones
/// (`detect != 0`) are reached through the failure classifier.
pub fn select_tcp(params: &Params, payload: &[u8], dst: &SocketAddr) -> ScanOutcome {
    for (m, dp) in params.dp.iter().enumerate() {
        if dp.detect != 0 {
            continue;
        }
        if !dp.matches_port(dst.port()) {
            continue;
        }
        if dp.proto != 0 && !check_proto_tcp(dp.proto, payload) {
            continue;
        }
        if let Some(hosts) = &dp.hosts {
            if !classifier::host_match(hosts, payload) {
                continue;
            }
        }
        return ScanOutcome::Selected(m);
    }
    ScanOutcome::Exhausted
}

/// Pick the strategy for a connectionless flow. Host and content checks do
/// not apply; the protocol mask must be empty or include UDP.
pub fn select_udp(params: &Params, dst: &SocketAddr) -> ScanOutcome {
    for (m, dp) in params.dp.iter().enumerate() {
        if dp.detect != 0 {
            continue;
        }
        if dp.proto != 0 && dp.proto & PROTO_UDP == 0 {
            continue;
        }
        if !dp.matches_port(dst.port()) {
            continue;
        }
        return ScanOutcome::Selected(m);
    }
    ScanOutcome::Exhausted
}

/// Failure-time scan: from `from` upward, find the first strategy whose
/// detect mask intersects `want`. An unconditional strategy found on the
/// way collapses the scan to the baseline.
pub fn scan_detect(params: &Params, from: usize, want: u8) -> ScanOutcome {
    for (m, dp) in params.dp.iter().enumerate().skip(from) {
        if dp.detect == 0 {
            return ScanOutcome::CollapseToBaseline;
        }
        if dp.detect & want != 0 {
            return ScanOutcome::Selected(m);
        }
    }
    ScanOutcome::Exhausted
}
