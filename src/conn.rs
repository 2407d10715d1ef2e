use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Anything a tunnel connection can ride on: a raw TCP stream, a logical
/// stream inside a multiplexed session, or an in-memory pipe in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The one connection type that flows through the server core.
///
/// `Conn` erases the underlying transport and can replay bytes that were
/// consumed while sniffing the protocol, so downstream consumers see the
/// stream from its first byte.
pub struct Conn {
	peer_addr: Option<SocketAddr>,
	rewind: Bytes,
	inner: Box<dyn AsyncStream>,
}

impl Conn {
	pub fn new(inner: Box<dyn AsyncStream>, peer_addr: Option<SocketAddr>) -> Self {
		Self {
			peer_addr,
			rewind: Bytes::new(),
			inner,
		}
	}

	pub fn from_tcp(stream: TcpStream) -> Self {
		let peer_addr = stream.peer_addr().ok();
		Self::new(Box::new(stream), peer_addr)
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer_addr
	}

	/// Queue already-consumed bytes to be served before the inner stream.
	pub fn rewind(&mut self, buf: Bytes) {
		debug_assert!(self.rewind.is_empty(), "rewind buffer set twice");
		self.rewind = buf;
	}
}

impl std::fmt::Debug for Conn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Conn")
			.field("peer_addr", &self.peer_addr)
			.field("rewind", &self.rewind.len())
			.finish()
	}
}

impl AsyncRead for Conn {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if !this.rewind.is_empty() {
			let n = std::cmp::min(this.rewind.len(), buf.remaining());
			buf.put_slice(&this.rewind[..n]);
			this.rewind.advance(n);
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for Conn {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn rewind_bytes_come_first() {
		let (client, server) = tokio::io::duplex(64);
		let mut conn = Conn::new(Box::new(server), None);
		conn.rewind(Bytes::from_static(b"hello "));

		let mut client = client;
		client.write_all(b"world").await.unwrap();
		drop(client);

		let mut out = Vec::new();
		conn.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"hello world");
	}

	#[tokio::test]
	async fn writes_pass_through() {
		let (mut client, server) = tokio::io::duplex(64);
		let mut conn = Conn::new(Box::new(server), None);
		conn.write_all(b"ping").await.unwrap();
		conn.flush().await.unwrap();

		let mut buf = [0u8; 4];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");
	}
}
