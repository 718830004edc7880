use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use transport_session::{InboundStream, OutboundStream};

/// Bidirectional channel made of one inbound and one outbound stream that
/// share a stream name.
pub struct VirtualSocket {
    name: String,
    inbound: InboundStream,
    outbound: OutboundStream,
}

impl VirtualSocket {
    pub fn new(inbound: InboundStream, outbound: OutboundStream) -> Self {
        Self {
            name: outbound.name().to_string(),
            inbound,
            outbound,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_split(self) -> (InboundStream, OutboundStream) {
        (self.inbound, self.outbound)
    }

    /// Shuts the outbound half down and drops the inbound half.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.outbound.shutdown().await;
        drop(self.inbound);
        result
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for VirtualSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inbound).poll_read(cx, buf)
    }
}

impl AsyncWrite for VirtualSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.outbound).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.outbound).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.outbound).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn crossed_pair(name: &str) -> (VirtualSocket, VirtualSocket) {
        let (a_out, b_in) = duplex(1024);
        let (b_out, a_in) = duplex(1024);
        (
            VirtualSocket::new(InboundStream::new(name, a_in), OutboundStream::new(name, a_out)),
            VirtualSocket::new(InboundStream::new(name, b_in), OutboundStream::new(name, b_out)),
        )
    }

    #[tokio::test]
    async fn writes_on_one_side_are_read_on_the_other() {
        let (mut left, mut right) = crossed_pair("pair");
        assert_eq!(left.name(), "pair");

        left.write_all(b"hello").await.expect("write");
        let mut buf = [0u8; 5];
        right.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hello");

        right.write_all(b"world").await.expect("write back");
        left.read_exact(&mut buf).await.expect("read back");
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn close_ends_the_remote_read_side() {
        let (left, mut right) = crossed_pair("pair");
        left.close().await.expect("close");
        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.expect("eof");
        assert!(buf.is_empty());
    }
}
