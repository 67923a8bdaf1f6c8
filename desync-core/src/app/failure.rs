//! Failure classification.
//!
//! Maps an observed upstream event (reset, early FIN, suspicious first
//! response) to what the flow should do about it: reconnect with a later
//! strategy, remember a later strategy for the *next* connection to this
//! destination, forget a cached strategy that failed too, or give up.
//!
//! These functions are pure; the state machine applies the verdicts (cache
//! writes, reconnects, linger-on-abort) at the call site.

use crate::app::classifier;
use crate::app::selector::{scan_detect, ScanOutcome};
use crate::config::{Params, DETECT_HTTP_LOCAT, DETECT_TLS_ERR, DETECT_TORST};

/// What the state machine should do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Tear down the upstream and redial with this strategy, replaying the
    /// buffered first payload.
    Reconnect(usize),
    /// Too late to replay; record this strategy so the next connection to
    /// the destination starts with it.
    CacheNext(usize),
    /// The cached strategy failed as well; drop the cache entry.
    DropEntry,
    /// Nothing else to try; destroy the flow and touch nothing.
    GiveUp,
}

fn verdict_for(scan: ScanOutcome, can_reconn: bool, strategies: usize) -> FailureVerdict {
    match scan {
        // An unconditional strategy ends the scan: plain teardown, and
        // deliberately no cache traffic.
        ScanOutcome::CollapseToBaseline => FailureVerdict::GiveUp,
        ScanOutcome::Selected(m) => {
            if can_reconn {
                FailureVerdict::Reconnect(m)
            } else {
                FailureVerdict::CacheNext(m)
            }
        }
        // Exhausted: with more than one strategy configured a cached entry
        // may be the thing that failed, so it gets dropped.
        ScanOutcome::Exhausted => {
            if strategies > 1 {
                FailureVerdict::DropEntry
            } else {
                FailureVerdict::GiveUp
            }
        }
    }
}

/// Upstream delivered a reset (or the connect itself was refused or timed
/// out) before anything useful arrived.
///
/// `can_reconn` means the first payload is still buffered and nothing has
/// been received from upstream, so the flow can be replayed in place.
pub fn on_torst(params: &Params, attempt: usize, can_reconn: bool) -> FailureVerdict {
    let m = attempt + 1;

    if !can_reconn && params.auto_level < 1 {
        return FailureVerdict::GiveUp;
    }
    verdict_for(
        scan_detect(params, m, DETECT_TORST),
        can_reconn,
        params.dp.len(),
    )
}

/// Upstream closed cleanly with no (or minimal) data.
///
/// Treated as a broken TLS handshake when the replayable first payload is a
/// ClientHello, or (for a flow that already tunneled) when it was marked as
/// TLS and died within its first round.
pub fn on_fin(
    params: &Params,
    attempt: usize,
    can_reconn: bool,
    first_payload: Option<&[u8]>,
    mark: bool,
    round_count: u32,
) -> FailureVerdict {
    let m = attempt + 1;

    if !can_reconn && params.auto_level < 1 {
        return FailureVerdict::GiveUp;
    }

    let ssl_err = if can_reconn {
        first_payload.map(classifier::is_tls_chello).unwrap_or(false)
    } else {
        mark && round_count <= 1
    };
    if !ssl_err {
        return FailureVerdict::GiveUp;
    }

    verdict_for(
        scan_detect(params, m, DETECT_TLS_ERR),
        can_reconn,
        params.dp.len(),
    )
}

/// Upstream sent bytes; decide whether they are a block-page response.
///
/// Returns the strategy index to reconnect with, or `None` when the
/// response looks legitimate and the tunnel should commit.
pub fn on_response(params: &Params, attempt: usize, req: &[u8], resp: &[u8]) -> Option<usize> {
    let from = attempt + 1;

    for (m, dp) in params.dp.iter().enumerate().skip(from) {
        if dp.detect == 0 {
            return None;
        }
        if dp.detect & DETECT_HTTP_LOCAT != 0 && classifier::is_http_redirect(req, resp) {
            return Some(m);
        }
        if dp.detect & DETECT_TLS_ERR != 0
            && ((classifier::is_tls_chello(req) && !classifier::is_tls_shello(resp))
                || classifier::neq_tls_sid(req, resp))
        {
            return Some(m);
        }
    }
    None
}
