//! Per-connection flow state.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static FLOW_SEQ: AtomicU64 = AtomicU64::new(1);

/// Short process-unique id used to correlate log lines of one flow.
pub fn next_flow_id() -> u64 {
    FLOW_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle states of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Upstream dial in progress.
    Conn,
    /// Accumulating the first payload and emitting its desynced form.
    Desync,
    /// Payload fully emitted; waiting for the first upstream bytes.
    PreTunnel,
    /// Committed; bytes relay opaquely in both directions.
    Tunnel,
    /// A replaced upstream socket is being discarded; its events are dropped.
    Ignore,
}

/// First-payload buffer with its partial-emission cursor.
#[derive(Debug)]
pub struct FirstPayload {
    pub data: BytesMut,
    /// Bytes of `data` already emitted by the mangler.
    pub offset: usize,
}

impl FirstPayload {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Mutable per-connection record driven by the state machine.
///
/// One `Flow` covers a client/upstream pair; the first-payload buffer lives
/// here until the tunnel commits, at which point it is released exactly
/// once.
#[derive(Debug)]
pub struct Flow {
    pub id: u64,
    /// Upstream destination; also the cache key.
    pub dst: SocketAddr,
    pub state: FlowState,
    /// Current strategy index; zero doubles as the not-yet-selected
    /// sentinel while accumulating.
    pub attempt: usize,
    /// Whether a committed tunnel should persist its strategy. Cleared when
    /// the attempt came out of the cache, so replays do not refresh the
    /// entry they were born from.
    pub cache: bool,
    /// First payload, held until the tunnel transition.
    pub buff: Option<FirstPayload>,
    /// Bytes received from the client before tunneling.
    pub client_recv: usize,
    /// Bytes received from upstream.
    pub upstream_recv: usize,
    /// Request/response rounds completed since the tunnel committed.
    pub round_count: u32,
    /// Round in which upstream last sent data.
    pub last_round: u32,
    /// The flow's first payload was a TLS ClientHello (recorded for the
    /// early-FIN heuristic in adaptive mode).
    pub mark: bool,
}

impl Flow {
    pub fn new(dst: SocketAddr, bfsize: usize) -> Self {
        Self {
            id: next_flow_id(),
            dst,
            state: FlowState::Conn,
            attempt: 0,
            cache: true,
            buff: Some(FirstPayload::with_capacity(std::cmp::min(bfsize, 4096))),
            client_recv: 0,
            upstream_recv: 0,
            round_count: 0,
            last_round: 0,
            mark: false,
        }
    }

    /// The first payload is still held and upstream has stayed silent, so
    /// the flow can be replayed on a fresh socket.
    pub fn can_reconnect(&self) -> bool {
        self.buff.is_some() && self.upstream_recv == 0
    }

    /// Release the first-payload buffer at the tunnel transition.
    pub fn release_buffer(&mut self) {
        self.buff = None;
        self.state = FlowState::Tunnel;
    }
}
