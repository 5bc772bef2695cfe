//! Length-prefixed packet framing over a byte stream
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// Maximum payload of a single frame; larger packets are continued
pub(crate) const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// The transport a connection runs over
pub(crate) enum NetStream {
    /// Plain TCP
    Tcp(TcpStream),
    /// TCP upgraded to TLS during the handshake
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            NetStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Reads and writes protocol packets over a byte stream
///
/// Keeps the sequence counter shared by both directions: every packet read or
/// written increments it, and it is reset to zero at the start of each client
/// command.
pub(crate) struct PacketStream<S> {
    /// The underlying stream
    stream: S,
    /// Buffer holding data read from the stream but not yet consumed
    buf: BytesMut,
    /// Sequence id expected on the next packet
    seq: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketStream<S> {
    /// Construct a new [PacketStream] with the sequence counter at zero
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8192),
            seq: 0,
        }
    }

    /// Reset the sequence counter at the start of a new command
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Tear the framing apart, keeping the sequence counter
    ///
    /// Used for the mid-handshake TLS upgrade: the packet exchanged so far
    /// must already be fully consumed.
    pub fn into_parts(self) -> (S, u8) {
        debug_assert!(self.buf.is_empty());
        (self.stream, self.seq)
    }

    /// Rebuild the framing around an upgraded stream
    pub fn from_parts(stream: S, seq: u8) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(8192),
            seq,
        }
    }

    /// True when no read data is waiting in the buffer
    pub fn buffer_is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read until at least `n` bytes are buffered
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(Error::Interface(
                    "connection lost: unexpected end of stream".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Read one frame and verify its sequence id
    async fn read_frame(&mut self) -> Result<(usize, Bytes)> {
        self.fill(4).await?;
        let header = u32::from_le_bytes(self.buf[..4].try_into().unwrap());
        let len = (header & 0xFF_FFFF) as usize;
        let seq = (header >> 24) as u8;
        if seq != self.seq {
            return Err(Error::protocol(format!(
                "packet sequence mismatch, expected {} got {seq}",
                self.seq
            )));
        }
        self.seq = self.seq.wrapping_add(1);
        self.fill(4 + len).await?;
        self.buf.advance(4);
        Ok((len, self.buf.split_to(len).freeze()))
    }

    /// Read one logical packet, joining continuation frames
    ///
    /// The returned future is cancel-safe.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let (len, payload) = self.read_frame().await?;
        if len < MAX_PAYLOAD {
            return Ok(payload);
        }
        let mut whole = BytesMut::from(payload.as_ref());
        loop {
            let (len, part) = self.read_frame().await?;
            whole.extend_from_slice(&part);
            if len < MAX_PAYLOAD {
                return Ok(whole.freeze());
            }
        }
    }

    /// Write one logical packet, splitting oversize payloads into frames
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut chunks = payload.chunks(MAX_PAYLOAD);
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let header = (chunk.len() as u32) | ((self.seq as u32) << 24);
            self.stream.write_all(&header.to_le_bytes()).await?;
            self.stream.write_all(chunk).await?;
            self.seq = self.seq.wrapping_add(1);
            if chunk.len() < MAX_PAYLOAD {
                break;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and shut the stream down
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = PacketStream::new(a);
        let mut server = PacketStream::new(b);

        client.write_packet(b"hello").await.unwrap();
        client.write_packet(b"").await.unwrap();
        let p = server.read_packet().await.unwrap();
        assert_eq!(&p[..], b"hello");
        let p = server.read_packet().await.unwrap();
        assert!(p.is_empty());
        assert!(server.buffer_is_empty());
    }

    #[tokio::test]
    async fn sequence_mismatch() {
        let (a, b) = tokio::io::duplex(64);
        let mut server = PacketStream::new(b);
        let mut a = a;
        // header with sequence id 5
        a.write_all(&[1, 0, 0, 5, b'x']).await.unwrap();
        let err = server.read_packet().await.unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
    }

    #[tokio::test]
    async fn eof_is_interface_error() {
        let (a, b) = tokio::io::duplex(64);
        let mut server = PacketStream::new(b);
        drop(a);
        let err = server.read_packet().await.unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
    }

    #[tokio::test]
    async fn continuation_frames() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut client = PacketStream::new(a);
        let mut server = PacketStream::new(b);

        let payload = vec![0x5Au8; MAX_PAYLOAD + 17];
        let expect = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_packet(&payload).await.unwrap();
            client
        });
        let got = server.read_packet().await.unwrap();
        assert_eq!(got.len(), expect.len());
        assert_eq!(&got[..], &expect[..]);
        // two frames consumed, counter advanced past both
        let mut client = writer.await.unwrap();
        client.write_packet(b"next").await.unwrap();
        assert_eq!(&server.read_packet().await.unwrap()[..], b"next");
    }

    #[tokio::test]
    async fn exact_boundary_needs_empty_frame() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut client = PacketStream::new(a);
        let mut server = PacketStream::new(b);

        let payload = vec![1u8; MAX_PAYLOAD];
        let writer = tokio::spawn(async move {
            client.write_packet(&payload).await.unwrap();
        });
        let got = server.read_packet().await.unwrap();
        assert_eq!(got.len(), MAX_PAYLOAD);
        writer.await.unwrap();
        // the trailing empty frame was consumed as part of the packet
        assert!(server.buffer_is_empty());
    }
}
