//! Stream multiplexing for the client transport. When enabled, one TCP
//! connection from a client carries the control channel and every work
//! connection as independent logical streams. The server is the passive
//! side: it accepts streams and feeds each one into the normal dispatch.

use crate::conn::Conn;
use futures::future::poll_fn;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub fn session_config() -> yamux::Config {
	yamux::Config::default()
}

/// Drive one server-side mux session. Every inbound logical stream is
/// handed to `on_stream` as a fresh connection; a stream closing does not
/// close the session. Returns when the session ends or `ct` fires.
pub async fn serve_session<F>(conn: Conn, ct: CancellationToken, mut on_stream: F)
where
	F: FnMut(Conn),
{
	let peer = conn.peer_addr();
	let mut session =
		yamux::Connection::new(conn.compat(), session_config(), yamux::Mode::Server);
	loop {
		tokio::select! {
			_ = ct.cancelled() => break,
			inbound = poll_fn(|cx| session.poll_next_inbound(cx)) => match inbound {
				Some(Ok(stream)) => on_stream(Conn::new(Box::new(stream.compat()), peer)),
				Some(Err(e)) => {
					debug!(peer = ?peer, "mux session error: {}", e);
					break;
				},
				None => break,
			},
		}
	}
	debug!(peer = ?peer, "mux session closed");
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	#[tokio::test]
	async fn inbound_streams_reach_the_handler() {
		let (client_io, server_io) = tokio::io::duplex(16 * 1024);
		let ct = CancellationToken::new();
		let (tx, mut rx) = mpsc::channel(4);
		tokio::spawn(serve_session(
			Conn::new(Box::new(server_io), None),
			ct.clone(),
			move |conn| {
				let _ = tx.try_send(conn);
			},
		));

		let mut client = yamux::Connection::new(
			client_io.compat(),
			yamux::Config::default(),
			yamux::Mode::Client,
		);
		let mut stream = poll_fn(|cx| client.poll_new_outbound(cx)).await.unwrap();
		// The client connection must be driven for stream I/O to progress.
		let driver = tokio::spawn(async move {
			while let Some(res) = poll_fn(|cx| client.poll_next_inbound(cx)).await {
				if res.is_err() {
					break;
				}
			}
		});

		use futures::{AsyncReadExt as _, AsyncWriteExt as _};
		stream.write_all(b"ping").await.unwrap();
		stream.flush().await.unwrap();

		let mut server_conn = rx.recv().await.unwrap();
		let mut buf = [0u8; 4];
		tokio::io::AsyncReadExt::read_exact(&mut server_conn, &mut buf)
			.await
			.unwrap();
		assert_eq!(&buf, b"ping");

		// Echo back through the mux to prove the stream is full-duplex.
		tokio::io::AsyncWriteExt::write_all(&mut server_conn, b"pong")
			.await
			.unwrap();
		tokio::io::AsyncWriteExt::flush(&mut server_conn).await.unwrap();
		let mut buf = [0u8; 4];
		stream.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"pong");

		ct.cancel();
		driver.abort();
	}
}
