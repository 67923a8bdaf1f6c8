//! Payload-mangling seam.
//!
//! The engine never touches the wire format of a desynced payload itself;
//! it hands the buffered payload and the chosen strategy index to a
//! `PayloadMangler` and trusts the returned byte count. `DirectMangler` is
//! the plain passthrough used for the baseline strategy and in tests;
//! real manglers (segmentation, fake packets, TTL tricks) plug in behind
//! the same trait.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

/// Applies a desync strategy to a socket and payload.
#[async_trait]
pub trait PayloadMangler: Send + Sync {
    /// Emit strategy `m`'s mangled form of `buf[offset..]` on `upstream`.
    ///
    /// Returns how many bytes of `buf` were consumed; a short count leaves
    /// the flow in its emission state and the engine calls again with an
    /// advanced offset.
    async fn desync(
        &self,
        upstream: &mut TcpStream,
        buf: &[u8],
        offset: usize,
        dst: &SocketAddr,
        m: usize,
    ) -> io::Result<usize>;

    /// Emit strategy `m`'s mangled form of one datagram.
    async fn desync_udp(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        dst: &SocketAddr,
        m: usize,
    ) -> io::Result<usize>;

    /// Restore normal socket state once the strategy committed (for
    /// example a TTL that was lowered for fake packets).
    async fn post_desync(&self, upstream: &mut TcpStream, m: usize) -> io::Result<()>;
}

/// Passthrough mangler: sends the payload unmodified.
#[derive(Debug, Default)]
pub struct DirectMangler;

#[async_trait]
impl PayloadMangler for DirectMangler {
    async fn desync(
        &self,
        upstream: &mut TcpStream,
        buf: &[u8],
        offset: usize,
        _dst: &SocketAddr,
        m: usize,
    ) -> io::Result<usize> {
        log::debug!("Plain emission of {} bytes (strategy {})", buf.len() - offset, m);
        upstream.write(&buf[offset..]).await
    }

    async fn desync_udp(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        dst: &SocketAddr,
        _m: usize,
    ) -> io::Result<usize> {
        socket.send_to(buf, dst).await
    }

    async fn post_desync(&self, _upstream: &mut TcpStream, _m: usize) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Test double that records every mangler call and can be told to emit
    /// the first chunk partially.
    pub struct RecordingMangler {
        pub first_chunk: Option<usize>,
        pub calls: Mutex<Vec<(usize, usize, usize)>>, // (offset, len, strategy)
        pub post_desync_calls: Mutex<Vec<usize>>,
    }

    impl RecordingMangler {
        pub fn new(first_chunk: Option<usize>) -> Self {
            Self {
                first_chunk,
                calls: Mutex::new(Vec::new()),
                post_desync_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PayloadMangler for RecordingMangler {
        async fn desync(
            &self,
            upstream: &mut TcpStream,
            buf: &[u8],
            offset: usize,
            _dst: &SocketAddr,
            m: usize,
        ) -> io::Result<usize> {
            self.calls.lock().unwrap().push((offset, buf.len(), m));
            let mut end = buf.len();
            if offset == 0 {
                if let Some(chunk) = self.first_chunk {
                    end = std::cmp::min(offset + chunk, buf.len());
                }
            }
            upstream.write_all(&buf[offset..end]).await?;
            Ok(end - offset)
        }

        async fn desync_udp(
            &self,
            socket: &UdpSocket,
            buf: &[u8],
            dst: &SocketAddr,
            m: usize,
        ) -> io::Result<usize> {
            self.calls.lock().unwrap().push((0, buf.len(), m));
            socket.send_to(buf, dst).await
        }

        async fn post_desync(&self, _upstream: &mut TcpStream, m: usize) -> io::Result<()> {
            self.post_desync_calls.lock().unwrap().push(m);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_mangler_is_passthrough() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dst = listener.local_addr().unwrap();

        let mut upstream = TcpStream::connect(dst).await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();

        let payload = b"first payload bytes";
        let mangler = DirectMangler;
        let sent = mangler
            .desync(&mut upstream, payload, 5, &dst, 0)
            .await
            .unwrap();
        assert!(sent > 0 && sent <= payload.len() - 5);

        let mut got = vec![0u8; sent];
        accepted.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, &payload[5..5 + sent]);
    }
}
