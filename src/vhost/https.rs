//! HTTPS routing at L4. The TLS ClientHello is read under a deadline, the
//! SNI host is matched against the routing table, and the raw bytes are
//! spliced with a work connection from the owning control. TLS terminates
//! at the tunnel client, never here.

use crate::conn::Conn;
use crate::msg::{self, Message};
use crate::muxer::Acceptor;
use crate::vhost::VhostRouter;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const SNI_PEEK_TIMEOUT: Duration = Duration::from_secs(30);

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const MAX_RECORD_LEN: usize = 16 * 1024;

pub struct ClientHello {
	pub sni: String,
	/// Every byte consumed while sniffing, replayed to the tunnel client.
	pub captured: Bytes,
}

fn invalid(reason: &str) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

/// Read exactly one handshake record and extract the server name.
pub async fn read_client_hello(conn: &mut Conn) -> io::Result<ClientHello> {
	let mut header = [0u8; 5];
	conn.read_exact(&mut header).await?;
	if header[0] != TLS_HANDSHAKE_RECORD || header[1] != 0x03 {
		return Err(invalid("not a tls handshake record"));
	}
	let len = u16::from_be_bytes([header[3], header[4]]) as usize;
	if len == 0 || len > MAX_RECORD_LEN {
		return Err(invalid("implausible record length"));
	}
	let mut record = vec![0u8; len];
	conn.read_exact(&mut record).await?;
	let sni = parse_sni(&record).ok_or_else(|| invalid("no server name in client hello"))?;

	let mut captured = BytesMut::with_capacity(header.len() + record.len());
	captured.extend_from_slice(&header);
	captured.extend_from_slice(&record);
	Ok(ClientHello {
		sni,
		captured: captured.freeze(),
	})
}

fn be16(b: &[u8], i: usize) -> Option<usize> {
	Some(u16::from_be_bytes([*b.get(i)?, *b.get(i + 1)?]) as usize)
}

/// Walk the ClientHello body to the server_name extension (type 0,
/// name type 0). Anything malformed yields `None`.
fn parse_sni(hs: &[u8]) -> Option<String> {
	if *hs.first()? != 0x01 {
		return None;
	}
	// handshake header, client version, random
	let mut i = 4 + 2 + 32;
	let session_id_len = *hs.get(i)? as usize;
	i += 1 + session_id_len;
	let cipher_suites_len = be16(hs, i)?;
	i += 2 + cipher_suites_len;
	let compression_len = *hs.get(i)? as usize;
	i += 1 + compression_len;
	let extensions_len = be16(hs, i)?;
	i += 2;
	let end = std::cmp::min(i.checked_add(extensions_len)?, hs.len());

	while i + 4 <= end {
		let ext_type = be16(hs, i)?;
		let ext_len = be16(hs, i + 2)?;
		i += 4;
		if ext_type == 0 {
			let mut j = i;
			let _list_len = be16(hs, j)?;
			j += 2;
			let name_type = *hs.get(j)?;
			j += 1;
			let name_len = be16(hs, j)?;
			j += 2;
			if name_type != 0 {
				return None;
			}
			let name = hs.get(j..j + name_len)?;
			let host = std::str::from_utf8(name).ok()?;
			if host.is_empty() {
				return None;
			}
			return Some(host.to_ascii_lowercase());
		}
		i = i.checked_add(ext_len)?;
	}
	None
}

pub async fn serve(router: Arc<VhostRouter>, mut acceptor: Acceptor, ct: CancellationToken) {
	loop {
		tokio::select! {
			_ = ct.cancelled() => break,
			conn = acceptor.accept() => match conn {
				Some(conn) => {
					let router = router.clone();
					tokio::spawn(handle(router, conn));
				},
				None => break,
			},
		}
	}
}

async fn handle(router: Arc<VhostRouter>, mut conn: Conn) {
	let hello = match tokio::time::timeout(SNI_PEEK_TIMEOUT, read_client_hello(&mut conn)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(e)) => {
			debug!(peer = ?conn.peer_addr(), "client hello rejected: {}", e);
			return;
		},
		Err(_) => {
			debug!(peer = ?conn.peer_addr(), "timed out waiting for a client hello");
			return;
		},
	};
	let Some(route) = router.resolve(&hello.sni, "/") else {
		debug!(host = %hello.sni, "no https route");
		return;
	};
	let Some(ctl) = route.ctl.upgrade() else {
		return;
	};
	let mut work = match ctl.get_work_conn().await {
		Ok(w) => w,
		Err(e) => {
			warn!(host = %hello.sni, proxy = %route.proxy_name, "https session failed: {}", e);
			return;
		},
	};
	let start = Message::StartWorkConn(msg::StartWorkConn {
		proxy_name: route.proxy_name.clone(),
	});
	if msg::write_msg(&mut work, &start).await.is_err() {
		return;
	}
	conn.rewind(hello.captured);
	match tokio::io::copy_bidirectional(&mut conn, &mut work).await {
		Ok((rx, tx)) => debug!(host = %hello.sni, rx_bytes = rx, tx_bytes = tx, "https session finished"),
		Err(e) => debug!(host = %hello.sni, "https session ended: {}", e),
	}
}
