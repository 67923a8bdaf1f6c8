//! Connectionless desync.
//!
//! UDP flows get one shot: the first datagram picks a strategy and goes
//! out through the mangler, everything after it forwards unchanged. There
//! is no failure feedback to classify, so no retries and no cache traffic.

use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::app::engine::DesyncEngine;
use crate::app::flow::next_flow_id;
use crate::app::selector::{self, ScanOutcome};

/// Per-flow record for a connectionless exchange.
#[derive(Debug)]
pub struct UdpFlow {
    pub id: u64,
    /// Remote destination datagrams are sent to.
    pub dst: SocketAddr,
    /// Strategy chosen by the first datagram.
    pub attempt: usize,
    /// Bytes already pushed through this flow; non-zero means the desync
    /// round is over.
    pub recv_count: usize,
}

impl UdpFlow {
    pub fn new(dst: SocketAddr) -> Self {
        Self {
            id: next_flow_id(),
            dst,
            attempt: 0,
            recv_count: 0,
        }
    }
}

impl DesyncEngine {
    /// Forward one datagram of a flow, desyncing the first one.
    ///
    /// Returns the bytes handed to the socket; an exhausted selector drops
    /// the datagram with an error.
    pub async fn udp_hook(
        &self,
        flow: &mut UdpFlow,
        socket: &UdpSocket,
        datagram: &[u8],
    ) -> io::Result<usize> {
        if flow.recv_count > 0 {
            return socket.send_to(datagram, flow.dst).await;
        }

        if flow.attempt == 0 {
            match selector::select_udp(self.params(), &flow.dst) {
                ScanOutcome::Selected(m) => {
                    flow.attempt = m;
                    if m > 0 {
                        log::info!(
                            "[FLW] |ID:{}, DST:{}| udp desync strategy index: {}",
                            flow.id,
                            flow.dst,
                            m
                        );
                    }
                }
                _ => {
                    log::warn!(
                        "[FLW] |ID:{}, DST:{}| no strategy matches this udp flow, dropping",
                        flow.id,
                        flow.dst
                    );
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "no strategy for udp flow",
                    ));
                }
            }
        }

        let n = self
            .mangler()
            .desync_udp(socket, datagram, &flow.dst, flow.attempt)
            .await?;
        flow.recv_count += datagram.len();
        Ok(n)
    }
}
