//! # Desync Engine Module
//!
//! The per-flow state machine of the circumvention core. A flow starts in
//! CONN while the upstream socket dials, accumulates the client's first
//! payload in DESYNC while the chosen strategy's mangled form is emitted,
//! waits for the first upstream reaction in PRE_TUNNEL, and relays opaquely
//! in TUNNEL once the reaction looks legitimate.
//!
//! ## Process flow
//!
//! 1. Dial upstream, seeding the attempt index from the destination cache
//! 2. Accumulate the first client bytes and pick a strategy
//! 3. Emit the mangled payload (possibly over several partial rounds)
//! 4. Classify the first upstream event: commit, reconnect with the next
//!    counter-strategy, or tear down
//! 5. Relay bidirectionally until either side closes
//!
//! Reconnects close the failing upstream socket, redial the same
//! destination, and replay the buffered payload under the new strategy.
//! Committed decisions (and classified failures that arrived too late to
//! replay) are persisted in the destination cache so later connections
//! start where this one ended.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::select;

use crate::app::classifier;
use crate::app::failure::{self, FailureVerdict};
use crate::app::flow::{Flow, FlowState};
use crate::app::mangle::PayloadMangler;
use crate::app::selector::{self, ScanOutcome};
use crate::config::Params;
use crate::service::cache::{CacheOutcome, StrategyCache};
use crate::system::socket;

// Constants for buffer and stream management
const DEFAULT_BUFFER_SIZE: usize = 16384;
const DIAL_TIMEOUT_SECS: u64 = 5;
const TUNNEL_IDLE_SECS: u64 = 120;

/// Buffer pool for reducing allocations in high-throughput scenarios.
/// Scratch buffers are reused across flows instead of constantly
/// allocated and deallocated.
struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    fn new(initial_capacity: usize) -> Self {
        let mut buffers = Vec::with_capacity(initial_capacity);
        for _ in 0..initial_capacity {
            buffers.push(BytesMut::with_capacity(DEFAULT_BUFFER_SIZE));
        }
        BufferPool {
            buffers: Mutex::new(buffers),
        }
    }

    fn get(&self) -> BytesMut {
        match self.buffers.lock().unwrap().pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        // Limit the number of stored buffers to prevent memory bloat
        if buffers.len() < 64 {
            buffers.push(buf);
        }
    }
}

lazy_static::lazy_static! {
    static ref BUFFER_POOL: BufferPool = BufferPool::new(16);
}

/// What an event handler decided about its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Keep driving the flow.
    Continue,
    /// Tear the flow down; sockets close when the caller drops them.
    Destroy,
    /// The flow was reshaped onto a fresh upstream socket; the caller must
    /// not touch the old one again this round.
    Reconnected,
}

/// # Duplex Communication Events
///
/// Events that can occur during bidirectional communication between client
/// and upstream once the tunnel has committed.
enum DuplexEvent {
    DownstreamRead(usize),
    UpstreamRead(usize),
}

/// The adaptive desynchronization engine: read-only parameters, the
/// destination cache, and the payload-mangling seam.
pub struct DesyncEngine {
    params: Arc<Params>,
    cache: StrategyCache,
    mangler: Arc<dyn PayloadMangler>,
}

impl DesyncEngine {
    pub fn new(params: Arc<Params>, mangler: Arc<dyn PayloadMangler>) -> Self {
        let cache = StrategyCache::new(params.cache_capacity, params.cache_ttl);
        Self {
            params,
            cache,
            mangler,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn cache(&self) -> &StrategyCache {
        &self.cache
    }

    pub(crate) fn mangler(&self) -> &dyn PayloadMangler {
        self.mangler.as_ref()
    }

    /// Dial the upstream for a fresh flow, seeding the attempt index from
    /// the destination cache.
    ///
    /// A flow replaying a cached decision does not re-persist it on
    /// success, so the entry's age keeps counting from the original win.
    pub async fn connect_hook(&self, flow: &mut Flow) -> io::Result<TcpStream> {
        match self.cache.lookup(&flow.dst) {
            CacheOutcome::Hit(m) if m > 0 => {
                log::info!(
                    "[FLW] |ID:{}, DST:{}| starting from cached strategy {}",
                    flow.id,
                    flow.dst,
                    m
                );
                flow.attempt = m;
                flow.cache = false;
            }
            _ => {
                flow.attempt = 0;
                flow.cache = true;
            }
        }
        self.dial(flow).await
    }

    /// Open and prepare one upstream socket to the flow's destination.
    async fn dial(&self, flow: &mut Flow) -> io::Result<TcpStream> {
        flow.state = FlowState::Conn;

        let connect_future = TcpStream::connect(flow.dst);
        let upstream =
            match tokio::time::timeout(Duration::from_secs(DIAL_TIMEOUT_SECS), connect_future)
                .await
            {
                Ok(Ok(upstream)) => upstream,
                Ok(Err(e)) => {
                    log::error!(
                        "[FLW] |ID:{}| failed to connect to upstream {}: {}",
                        flow.id,
                        flow.dst,
                        e
                    );
                    return Err(e);
                }
                Err(_) => {
                    log::error!("[FLW] |ID:{}| connection to {} timed out", flow.id, flow.dst);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            };

        socket::optimize_socket(&upstream);
        socket::socket_mod(&self.params, &upstream, &flow.dst)?;

        flow.state = FlowState::Desync;
        Ok(upstream)
    }

    /// Client-readable event while the flow accumulates its first payload.
    ///
    /// Appends up to `bfsize` bytes, picks a strategy once, and emits the
    /// payload's mangled form. A first payload that fills the whole buffer
    /// stops being interesting: it tunnels as-is without further mangling
    /// (and without a cache commit).
    pub async fn on_desync(
        &self,
        flow: &mut Flow,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
    ) -> io::Result<FlowAction> {
        let bfsize = self.params.bfsize;

        let buffered = match flow.buff.as_ref() {
            Some(buff) => buff.data.len(),
            None => {
                log::error!("[FLW] |ID:{}| first-payload buffer already released", flow.id);
                return Ok(FlowAction::Destroy);
            }
        };
        if buffered == bfsize {
            log::debug!(
                "[FLW] |ID:{}| first payload filled the buffer, tunneling as-is",
                flow.id
            );
            flow.release_buffer();
            return Ok(FlowAction::Continue);
        }

        let mut scratch = BUFFER_POOL.get();
        scratch.resize(bfsize - buffered, 0);
        let n = match client.read(&mut scratch[..]).await {
            Ok(0) => {
                log::debug!("[FLW] |ID:{}| client closed before the first payload", flow.id);
                BUFFER_POOL.put(scratch);
                return Ok(FlowAction::Destroy);
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("[FLW] |ID:{}| failed to read from client: {}", flow.id, e);
                BUFFER_POOL.put(scratch);
                return Ok(FlowAction::Destroy);
            }
        };

        if let Some(buff) = flow.buff.as_mut() {
            buff.data.extend_from_slice(&scratch[..n]);
        }
        BUFFER_POOL.put(scratch);
        flow.client_recv += n;
        flow.round_count = 1;

        // Zero doubles as the not-yet-selected sentinel; re-running the
        // selection on a grown buffer can only keep picking the baseline.
        if flow.attempt == 0 {
            let outcome = match flow.buff.as_ref() {
                Some(buff) => selector::select_tcp(&self.params, &buff.data, &flow.dst),
                None => ScanOutcome::Exhausted,
            };
            match outcome {
                ScanOutcome::Selected(m) => {
                    flow.attempt = m;
                }
                _ => {
                    log::error!(
                        "[FLW] |ID:{}, DST:{}| no strategy matches this flow",
                        flow.id,
                        flow.dst
                    );
                    return Ok(FlowAction::Destroy);
                }
            }
        }

        self.on_desync_again(flow, upstream).await
    }

    /// Emit (or keep emitting) the buffered payload's mangled form.
    ///
    /// The mangler may consume only part of the buffer; the flow then stays
    /// in its emission state and this handler runs again when the upstream
    /// socket is next writable.
    pub async fn on_desync_again(
        &self,
        flow: &mut Flow,
        upstream: &mut TcpStream,
    ) -> io::Result<FlowAction> {
        let m = flow.attempt;
        if m > 0 {
            log::info!("[FLW] |ID:{}| desync strategy index: {}", flow.id, m);
        } else {
            log::debug!("[FLW] |ID:{}| desync strategy index: {}", flow.id, m);
        }

        if self.params.timeout > 0
            && socket::set_timeout(upstream.as_raw_fd(), self.params.timeout as u32).is_err()
        {
            return Ok(FlowAction::Destroy);
        }

        let sn = {
            let Some(buff) = flow.buff.as_ref() else {
                log::error!("[FLW] |ID:{}| emission without a payload buffer", flow.id);
                return Ok(FlowAction::Destroy);
            };
            match self
                .mangler
                .desync(upstream, &buff.data, buff.offset, &flow.dst, m)
                .await
            {
                Ok(sn) => sn,
                Err(e) => {
                    log::error!("[FLW] |ID:{}| desync emission failed: {}", flow.id, e);
                    return Ok(FlowAction::Destroy);
                }
            }
        };

        let (offset, total) = match flow.buff.as_mut() {
            Some(buff) => {
                buff.offset += sn;
                (buff.offset, buff.data.len())
            }
            None => return Ok(FlowAction::Destroy),
        };

        if offset < total {
            if sn == 0 {
                log::error!("[FLW] |ID:{}| mangler made no progress", flow.id);
                return Ok(FlowAction::Destroy);
            }
            log::debug!(
                "[FLW] |ID:{}| partial emission, {} of {} bytes out",
                flow.id,
                offset,
                total
            );
            flow.state = FlowState::Desync;
            return Ok(FlowAction::Continue);
        }

        flow.state = FlowState::PreTunnel;
        Ok(FlowAction::Continue)
    }

    /// First upstream event after the payload went out: decide between
    /// committing the tunnel, retrying with a later strategy, and giving up.
    pub async fn on_tunnel_check(
        &self,
        flow: &mut Flow,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
    ) -> io::Result<FlowAction> {
        let mut scratch = BUFFER_POOL.get();
        scratch.resize(self.params.bfsize, 0);

        let n = match upstream.read(&mut scratch[..]).await {
            Ok(0) => {
                BUFFER_POOL.put(scratch);
                return self.handle_fin(flow, client, upstream).await;
            }
            Ok(n) => n,
            Err(e) => {
                BUFFER_POOL.put(scratch);
                return match e.kind() {
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut => self.handle_torst(flow, client, upstream).await,
                    _ => {
                        log::error!(
                            "[FLW] |ID:{}| failed to read from upstream: {}",
                            flow.id,
                            e
                        );
                        Ok(FlowAction::Destroy)
                    }
                };
            }
        };

        let reconnect_to = {
            let req = flow
                .buff
                .as_ref()
                .map(|buff| &buff.data[..])
                .unwrap_or(&[]);
            failure::on_response(&self.params, flow.attempt, req, &scratch[..n])
        };
        if let Some(m) = reconnect_to {
            log::info!(
                "[FLW] |ID:{}, DST:{}| response classified as blocked, retrying with strategy {}",
                flow.id,
                flow.dst,
                m
            );
            BUFFER_POOL.put(scratch);
            return self.reconnect(flow, upstream, m).await;
        }

        // The response passed inspection: commit the tunnel.
        if let Err(e) = client.write_all(&scratch[..n]).await {
            log::error!("[FLW] |ID:{}| failed to write to client: {}", flow.id, e);
            BUFFER_POOL.put(scratch);
            return Ok(FlowAction::Destroy);
        }
        BUFFER_POOL.put(scratch);

        flow.upstream_recv += n;
        flow.round_count = 1;
        flow.last_round = 1;

        if self.params.auto_level > 0 && self.params.dp.len() > 1 {
            flow.mark = flow
                .buff
                .as_ref()
                .map(|buff| classifier::is_tls_chello(&buff.data))
                .unwrap_or(false);
        }

        let m = flow.attempt;
        flow.release_buffer();

        if self.params.timeout > 0
            && self.params.auto_level < 1
            && socket::set_timeout(upstream.as_raw_fd(), 0).is_err()
        {
            return Ok(FlowAction::Destroy);
        }

        if let Err(e) = self.mangler.post_desync(upstream, m).await {
            log::error!("[FLW] |ID:{}| post-desync restore failed: {}", flow.id, e);
            return Ok(FlowAction::Destroy);
        }

        if flow.cache {
            self.cache.insert(&flow.dst, m);
        }
        log::info!(
            "[FLW] |ID:{}, DST:{}, STATUS:TUNNEL, SIZE:{}| strategy {} committed",
            flow.id,
            flow.dst,
            n,
            m
        );
        Ok(FlowAction::Continue)
    }

    /// Upstream reset (or refused/timed-out connect) before useful data.
    async fn handle_torst(
        &self,
        flow: &mut Flow,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
    ) -> io::Result<FlowAction> {
        log::info!(
            "[FLW] |ID:{}, DST:{}, STATUS:TORST| attempt {}",
            flow.id,
            flow.dst,
            flow.attempt
        );

        match failure::on_torst(&self.params, flow.attempt, flow.can_reconnect()) {
            FailureVerdict::Reconnect(m) => return self.reconnect(flow, upstream, m).await,
            FailureVerdict::CacheNext(m) => self.cache.insert(&flow.dst, m),
            FailureVerdict::DropEntry => self.cache.remove(&flow.dst),
            FailureVerdict::GiveUp => {}
        }

        // The client learns about the failure the same way we did.
        let _ = socket::set_linger_abort(client);
        Ok(FlowAction::Destroy)
    }

    /// Upstream closed cleanly before useful data.
    async fn handle_fin(
        &self,
        flow: &mut Flow,
        _client: &mut TcpStream,
        upstream: &mut TcpStream,
    ) -> io::Result<FlowAction> {
        log::info!(
            "[FLW] |ID:{}, DST:{}, STATUS:FIN| attempt {}",
            flow.id,
            flow.dst,
            flow.attempt
        );

        let verdict = {
            let first_payload = flow.buff.as_ref().map(|buff| &buff.data[..]);
            failure::on_fin(
                &self.params,
                flow.attempt,
                flow.can_reconnect(),
                first_payload,
                flow.mark,
                flow.round_count,
            )
        };
        match verdict {
            FailureVerdict::Reconnect(m) => self.reconnect(flow, upstream, m).await,
            FailureVerdict::CacheNext(m) => {
                self.cache.insert(&flow.dst, m);
                Ok(FlowAction::Destroy)
            }
            FailureVerdict::DropEntry => {
                self.cache.remove(&flow.dst);
                Ok(FlowAction::Destroy)
            }
            FailureVerdict::GiveUp => Ok(FlowAction::Destroy),
        }
    }

    /// Replace the failing upstream socket with a fresh one and replay the
    /// buffered first payload under strategy `m`.
    async fn reconnect(
        &self,
        flow: &mut Flow,
        upstream: &mut TcpStream,
        m: usize,
    ) -> io::Result<FlowAction> {
        log::info!(
            "[FLW] |ID:{}, DST:{}| reconnecting with strategy {}",
            flow.id,
            flow.dst,
            m
        );

        // Events of the old socket are dead from here on.
        flow.state = FlowState::Ignore;
        let fresh = match self.dial(flow).await {
            Ok(fresh) => fresh,
            Err(_) => return Ok(FlowAction::Destroy),
        };
        *upstream = fresh;

        flow.attempt = m;
        flow.cache = true;
        flow.upstream_recv = 0;
        match flow.buff.as_mut() {
            Some(buff) => buff.offset = 0,
            None => {
                log::error!("[FLW] |ID:{}| reconnect without a payload buffer", flow.id);
                return Ok(FlowAction::Destroy);
            }
        }
        flow.state = FlowState::Desync;

        loop {
            match self.on_desync_again(flow, upstream).await? {
                FlowAction::Continue => {
                    if flow.state == FlowState::PreTunnel {
                        return Ok(FlowAction::Reconnected);
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Upstream EOF after the tunnel committed. In adaptive mode a marked
    /// TLS flow dying within its first round still teaches the cache.
    fn tunnel_fin(&self, flow: &Flow) {
        if self.params.auto_level < 1 {
            return;
        }
        match failure::on_fin(
            &self.params,
            flow.attempt,
            false,
            None,
            flow.mark,
            flow.round_count,
        ) {
            FailureVerdict::CacheNext(m) => self.cache.insert(&flow.dst, m),
            FailureVerdict::DropEntry => self.cache.remove(&flow.dst),
            _ => {}
        }
    }

    /// Upstream error after the tunnel committed.
    fn tunnel_torst(&self, flow: &Flow, client: &TcpStream) {
        if self.params.auto_level >= 1 {
            match failure::on_torst(&self.params, flow.attempt, false) {
                FailureVerdict::CacheNext(m) => self.cache.insert(&flow.dst, m),
                FailureVerdict::DropEntry => self.cache.remove(&flow.dst),
                _ => {}
            }
        }
        let _ = socket::set_linger_abort(client);
    }

    /// # Handle bidirectional data transfer
    ///
    /// Relays opaquely between client and upstream after the tunnel
    /// committed, tracking request/response rounds for the adaptive
    /// early-FIN heuristic. Runs until either side closes, errors, or the
    /// idle timeout fires.
    async fn duplex(
        &self,
        flow: &mut Flow,
        client: &mut TcpStream,
        upstream: &mut TcpStream,
    ) -> io::Result<()> {
        let mut downstream_buf = BUFFER_POOL.get();
        let mut upstream_buf = BUFFER_POOL.get();
        let idle = Duration::from_secs(TUNNEL_IDLE_SECS);
        let mut last_from_upstream = false;
        let id = flow.id;

        loop {
            let downstream_read = tokio::time::timeout(idle, client.read_buf(&mut downstream_buf));
            let upstream_read = tokio::time::timeout(idle, upstream.read_buf(&mut upstream_buf));
            let event: DuplexEvent;

            select! {
                result = downstream_read => match result {
                    Ok(Ok(n)) => event = DuplexEvent::DownstreamRead(n),
                    Ok(Err(e)) => {
                        log::error!("[FLW] |ID:{}| failed to read from client: {}", id, e);
                        return Ok(());
                    },
                    Err(_) => {
                        log::info!("[FLW] |ID:{}, STATUS:00, SIZE:0| tunnel idle timeout", id);
                        return Ok(());
                    }
                },
                result = upstream_read => match result {
                    Ok(Ok(n)) => event = DuplexEvent::UpstreamRead(n),
                    Ok(Err(e)) => {
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                                | io::ErrorKind::TimedOut
                        ) {
                            log::info!("[FLW] |ID:{}, STATUS:TORST, SIZE:0| upstream reset in tunnel", id);
                            self.tunnel_torst(flow, client);
                        } else {
                            log::error!("[FLW] |ID:{}| failed to read from upstream: {}", id, e);
                        }
                        return Ok(());
                    },
                    Err(_) => {
                        log::info!("[FLW] |ID:{}, STATUS:10, SIZE:0| tunnel idle timeout", id);
                        return Ok(());
                    }
                },
            }

            match event {
                DuplexEvent::DownstreamRead(0) => {
                    log::debug!("[FLW] |ID:{}, STATUS:00, SIZE:0| downstream closing", id);
                    return Ok(());
                }
                DuplexEvent::UpstreamRead(0) => {
                    log::debug!("[FLW] |ID:{}, STATUS:10, SIZE:0| upstream closing", id);
                    self.tunnel_fin(flow);
                    return Ok(());
                }
                DuplexEvent::DownstreamRead(n) => {
                    // A client burst after an upstream burst starts a round.
                    if last_from_upstream {
                        flow.round_count += 1;
                        last_from_upstream = false;
                    }
                    let to_write = downstream_buf.split_to(downstream_buf.len());
                    debug_assert_eq!(to_write.len(), n);
                    if let Err(e) = upstream.write_all(&to_write[..]).await {
                        log::error!("[FLW] |ID:{}| failed to write to upstream: {}", id, e);
                        return Ok(());
                    }
                }
                DuplexEvent::UpstreamRead(n) => {
                    last_from_upstream = true;
                    flow.last_round = flow.round_count;
                    flow.upstream_recv += n;
                    let to_write = upstream_buf.split_to(upstream_buf.len());
                    if let Err(e) = client.write_all(&to_write[..]).await {
                        log::error!("[FLW] |ID:{}| failed to write to client: {}", id, e);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Drive one accepted client connection against its destination until
    /// the flow finishes, sequencing the event handlers the way the owning
    /// accept loop's poller would.
    pub async fn run_flow(&self, mut client: TcpStream, dst: SocketAddr) -> io::Result<()> {
        socket::optimize_socket(&client);
        let mut flow = Flow::new(dst, self.params.bfsize);
        log::debug!("[FLW] |ID:{}, DST:{}| incoming flow", flow.id, dst);

        let mut upstream = match self.connect_hook(&mut flow).await {
            Ok(upstream) => upstream,
            Err(e) => {
                // A refused or timed-out dial is itself a classifiable
                // failure; in adaptive mode it can seed the cache.
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::TimedOut
                ) {
                    match failure::on_torst(&self.params, flow.attempt, false) {
                        FailureVerdict::CacheNext(m) => self.cache.insert(&flow.dst, m),
                        FailureVerdict::DropEntry => self.cache.remove(&flow.dst),
                        _ => {}
                    }
                }
                let _ = socket::set_linger_abort(&client);
                return Err(e);
            }
        };

        loop {
            match flow.state {
                FlowState::Desync => {
                    let emitting = flow
                        .buff
                        .as_ref()
                        .map(|buff| buff.offset > 0 && buff.remaining() > 0)
                        .unwrap_or(false);
                    let action = if emitting {
                        // Partial emission resumes before new client bytes
                        // are considered.
                        self.on_desync_again(&mut flow, &mut upstream).await?
                    } else {
                        self.on_desync(&mut flow, &mut client, &mut upstream).await?
                    };
                    if action == FlowAction::Destroy {
                        return Ok(());
                    }
                }
                FlowState::PreTunnel => {
                    select! {
                        ready = client.ready(Interest::READABLE) => {
                            if ready.is_err() {
                                return Ok(());
                            }
                            // The client may still be streaming its first
                            // payload (multi-record hello, pipelining).
                            let action =
                                self.on_desync(&mut flow, &mut client, &mut upstream).await?;
                            if action == FlowAction::Destroy {
                                return Ok(());
                            }
                        }
                        ready = upstream.ready(Interest::READABLE) => {
                            if ready.is_err() {
                                return Ok(());
                            }
                            let action = self
                                .on_tunnel_check(&mut flow, &mut client, &mut upstream)
                                .await?;
                            if action == FlowAction::Destroy {
                                return Ok(());
                            }
                        }
                    }
                }
                FlowState::Tunnel => {
                    return self.duplex(&mut flow, &mut client, &mut upstream).await;
                }
                FlowState::Conn | FlowState::Ignore => {
                    // Transient states are resolved inside the handlers.
                    log::error!("[FLW] |ID:{}| stuck in state {:?}", flow.id, flow.state);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::classifier::fixtures::{client_hello, server_hello};
    use crate::app::mangle::testing::RecordingMangler;
    use crate::config::{DesyncStrategy, DETECT_HTTP_LOCAT, DETECT_TORST};
    use crate::service::cache::CacheOutcome;
    use tokio::net::TcpListener;

    fn strategy(detect: u8) -> DesyncStrategy {
        DesyncStrategy {
            detect,
            ..Default::default()
        }
    }

    fn engine(detects: &[u8], mangler: Arc<dyn PayloadMangler>) -> Arc<DesyncEngine> {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = Params {
            dp: detects.iter().map(|d| strategy(*d)).collect(),
            ..Default::default()
        };
        Arc::new(DesyncEngine::new(Arc::new(params), mangler))
    }

    /// Client connection as the engine sees it, plus our end of it.
    async fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = TcpStream::connect(addr).await.unwrap();
        let (theirs, _) = listener.accept().await.unwrap();
        (ours, theirs)
    }

    #[tokio::test]
    async fn test_happy_path_commits_and_caches_baseline() {
        let mangler = Arc::new(RecordingMangler::new(None));
        let engine = engine(&[0], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\nhello")
                .await
                .unwrap();
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));

        server.await.unwrap();
        engine_task.await.unwrap().unwrap();

        assert_eq!(engine.cache().lookup(&dst), CacheOutcome::Hit(0));
        assert_eq!(mangler.post_desync_calls.lock().unwrap().as_slice(), &[0]);
    }

    #[tokio::test]
    async fn test_rst_reconnects_with_next_strategy() {
        let mangler = Arc::new(RecordingMangler::new(None));
        let engine = engine(&[0, DETECT_TORST], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First attempt: swallow the payload, then abort so the client
            // side of the pair observes a reset.
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.set_linger(Some(Duration::from_secs(0))).unwrap();
            drop(conn);

            // Second attempt: behave.
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let n = conn.read(&mut buf).await.unwrap();
            assert!(n > 0);
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));

        server.await.unwrap();
        engine_task.await.unwrap().unwrap();

        // The retry won and was persisted.
        assert_eq!(engine.cache().lookup(&dst), CacheOutcome::Hit(1));
        let strategies: Vec<usize> =
            mangler.calls.lock().unwrap().iter().map(|c| c.2).collect();
        assert!(strategies.contains(&0));
        assert!(strategies.contains(&1));
    }

    #[tokio::test]
    async fn test_partial_emission_resumes_at_offset() {
        let mangler = Arc::new(RecordingMangler::new(Some(5)));
        let engine = engine(&[0], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let payload = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let expected = payload.len();

        let server = tokio::spawn(async move {
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut got = vec![0u8; expected];
            conn.read_exact(&mut got).await.unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            got
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(payload).await.unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));

        let got = server.await.unwrap();
        engine_task.await.unwrap().unwrap();

        // The upstream saw the payload reassembled in order.
        assert_eq!(&got, payload);
        // First call stopped short, the resume started at its offset.
        let calls = mangler.calls.lock().unwrap();
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, 5);
    }

    #[tokio::test]
    async fn test_block_page_redirect_triggers_reconnect() {
        let mangler = Arc::new(RecordingMangler::new(None));
        let engine = engine(&[0, DETECT_HTTP_LOCAT], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 302 Found\r\nLocation: http://block.isp.net/\r\n\r\n")
                .await
                .unwrap();
            drop(conn);

            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\nreal content")
                .await
                .unwrap();
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        // The block page never reached the client.
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));

        server.await.unwrap();
        engine_task.await.unwrap().unwrap();
        assert_eq!(engine.cache().lookup(&dst), CacheOutcome::Hit(1));
    }

    #[tokio::test]
    async fn test_tls_flow_commits_on_matching_server_hello() {
        let mangler = Arc::new(RecordingMangler::new(None));
        let engine = engine(&[0], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let shello = server_hello(&[0x11; 32]);
        let server = {
            let shello = shello.clone();
            tokio::spawn(async move {
                let (mut conn, _) = upstream_listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = conn.read(&mut buf).await.unwrap();
                conn.write_all(&shello).await.unwrap();
            })
        };

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(&client_hello("example.com")).await.unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        assert_eq!(resp, shello);

        server.await.unwrap();
        engine_task.await.unwrap().unwrap();
        assert_eq!(engine.cache().lookup(&dst), CacheOutcome::Hit(0));
    }

    #[tokio::test]
    async fn test_oversized_first_payload_tunnels_without_commit() {
        let mangler = Arc::new(RecordingMangler::new(None));
        let _ = env_logger::builder().is_test(true).try_init();
        let params = Params {
            dp: vec![strategy(0)],
            bfsize: 8,
            ..Default::default()
        };
        let engine = Arc::new(DesyncEngine::new(
            Arc::new(params),
            mangler.clone() as Arc<dyn PayloadMangler>,
        ));

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();

        let payload = b"GET /a-long-enough-path HTTP/1.1\r\n\r\n";
        let expected = payload.len();

        let server = tokio::spawn(async move {
            let (mut conn, _) = upstream_listener.accept().await.unwrap();
            let mut got = vec![0u8; expected];
            conn.read_exact(&mut got).await.unwrap();
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            got
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(payload).await.unwrap();
        let mut resp = Vec::new();
        ours.read_to_end(&mut resp).await.unwrap();
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));

        let got = server.await.unwrap();
        engine_task.await.unwrap().unwrap();

        // Everything reached upstream, but only the first bfsize bytes went
        // through the mangler; the saturated flow tunneled unverified and
        // left no cache entry behind.
        assert_eq!(&got, payload);
        assert_eq!(engine.cache().lookup(&dst), CacheOutcome::Miss);
        assert!(mangler.post_desync_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_selector_destroys_flow() {
        // Only conditional strategies: nothing is eligible for selection.
        let mangler = Arc::new(RecordingMangler::new(None));
        let engine = engine(&[DETECT_TORST], mangler.clone());

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = upstream_listener.accept().await;
        });

        let (mut ours, theirs) = client_pair().await;
        let engine_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_flow(theirs, dst).await })
        };

        ours.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        engine_task.await.unwrap().unwrap();
        assert!(mangler.calls.lock().unwrap().is_empty());
    }
}
