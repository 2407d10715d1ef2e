//! Control-channel wire format: one byte of type tag, an 8-byte big-endian
//! body length, then a JSON body. Tags and JSON key names are part of the
//! protocol contract and must not change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame body. Anything larger is a protocol
/// violation, not a big message.
pub const MAX_BODY_LEN: usize = 10 * 1024 * 1024;

pub const TYPE_LOGIN: u8 = b'o';
pub const TYPE_LOGIN_RESP: u8 = b'1';
pub const TYPE_NEW_PROXY: u8 = b'p';
pub const TYPE_NEW_PROXY_RESP: u8 = b'2';
pub const TYPE_CLOSE_PROXY: u8 = b'c';
pub const TYPE_NEW_WORK_CONN: u8 = b'w';
pub const TYPE_REQ_WORK_CONN: u8 = b'r';
pub const TYPE_START_WORK_CONN: u8 = b's';
pub const TYPE_NEW_VISITOR_CONN: u8 = b'v';
pub const TYPE_NEW_VISITOR_CONN_RESP: u8 = b'3';
pub const TYPE_PING: u8 = b'h';
pub const TYPE_PONG: u8 = b'4';
pub const TYPE_UDP_PACKET: u8 = b'u';

#[derive(thiserror::Error, Debug)]
pub enum MsgError {
	#[error("unknown message tag {0:#04x}")]
	UnknownTag(u8),
	#[error("frame body of {len} bytes exceeds the {max} byte limit")]
	FrameTooLarge { len: u64, max: usize },
	#[error("malformed message body: {0}")]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Login {
	pub version: String,
	pub hostname: String,
	pub os: String,
	pub arch: String,
	pub user: String,
	pub privilege_key: String,
	pub timestamp: i64,
	pub run_id: String,
	pub pool_count: usize,
	pub metas: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoginResp {
	pub version: String,
	pub run_id: String,
	pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewProxy {
	pub proxy_name: String,
	pub proxy_type: String,
	pub use_encryption: bool,
	pub use_compression: bool,
	pub remote_port: u16,
	pub custom_domains: Vec<String>,
	pub sub_domain: String,
	pub locations: Vec<String>,
	pub host_header_rewrite: String,
	pub sk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewProxyResp {
	pub proxy_name: String,
	pub remote_addr: String,
	pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct CloseProxy {
	pub proxy_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewWorkConn {
	pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReqWorkConn {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartWorkConn {
	pub proxy_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewVisitorConn {
	pub proxy_name: String,
	pub sign_key: String,
	pub timestamp: i64,
	pub use_encryption: bool,
	pub use_compression: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewVisitorConnResp {
	pub proxy_name: String,
	pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Ping {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct Pong {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct UdpPacket {
	pub content: String,
	pub local_addr: String,
	pub remote_addr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	Login(Login),
	LoginResp(LoginResp),
	NewProxy(NewProxy),
	NewProxyResp(NewProxyResp),
	CloseProxy(CloseProxy),
	NewWorkConn(NewWorkConn),
	ReqWorkConn(ReqWorkConn),
	StartWorkConn(StartWorkConn),
	NewVisitorConn(NewVisitorConn),
	NewVisitorConnResp(NewVisitorConnResp),
	Ping(Ping),
	Pong(Pong),
	UdpPacket(UdpPacket),
}

impl Message {
	pub fn tag(&self) -> u8 {
		match self {
			Message::Login(_) => TYPE_LOGIN,
			Message::LoginResp(_) => TYPE_LOGIN_RESP,
			Message::NewProxy(_) => TYPE_NEW_PROXY,
			Message::NewProxyResp(_) => TYPE_NEW_PROXY_RESP,
			Message::CloseProxy(_) => TYPE_CLOSE_PROXY,
			Message::NewWorkConn(_) => TYPE_NEW_WORK_CONN,
			Message::ReqWorkConn(_) => TYPE_REQ_WORK_CONN,
			Message::StartWorkConn(_) => TYPE_START_WORK_CONN,
			Message::NewVisitorConn(_) => TYPE_NEW_VISITOR_CONN,
			Message::NewVisitorConnResp(_) => TYPE_NEW_VISITOR_CONN_RESP,
			Message::Ping(_) => TYPE_PING,
			Message::Pong(_) => TYPE_PONG,
			Message::UdpPacket(_) => TYPE_UDP_PACKET,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Message::Login(_) => "Login",
			Message::LoginResp(_) => "LoginResp",
			Message::NewProxy(_) => "NewProxy",
			Message::NewProxyResp(_) => "NewProxyResp",
			Message::CloseProxy(_) => "CloseProxy",
			Message::NewWorkConn(_) => "NewWorkConn",
			Message::ReqWorkConn(_) => "ReqWorkConn",
			Message::StartWorkConn(_) => "StartWorkConn",
			Message::NewVisitorConn(_) => "NewVisitorConn",
			Message::NewVisitorConnResp(_) => "NewVisitorConnResp",
			Message::Ping(_) => "Ping",
			Message::Pong(_) => "Pong",
			Message::UdpPacket(_) => "UdpPacket",
		}
	}

	fn body(&self) -> Result<Vec<u8>, serde_json::Error> {
		match self {
			Message::Login(m) => serde_json::to_vec(m),
			Message::LoginResp(m) => serde_json::to_vec(m),
			Message::NewProxy(m) => serde_json::to_vec(m),
			Message::NewProxyResp(m) => serde_json::to_vec(m),
			Message::CloseProxy(m) => serde_json::to_vec(m),
			Message::NewWorkConn(m) => serde_json::to_vec(m),
			Message::ReqWorkConn(m) => serde_json::to_vec(m),
			Message::StartWorkConn(m) => serde_json::to_vec(m),
			Message::NewVisitorConn(m) => serde_json::to_vec(m),
			Message::NewVisitorConnResp(m) => serde_json::to_vec(m),
			Message::Ping(m) => serde_json::to_vec(m),
			Message::Pong(m) => serde_json::to_vec(m),
			Message::UdpPacket(m) => serde_json::to_vec(m),
		}
	}

	fn decode(tag: u8, body: &[u8]) -> Result<Message, MsgError> {
		let msg = match tag {
			TYPE_LOGIN => Message::Login(serde_json::from_slice(body)?),
			TYPE_LOGIN_RESP => Message::LoginResp(serde_json::from_slice(body)?),
			TYPE_NEW_PROXY => Message::NewProxy(serde_json::from_slice(body)?),
			TYPE_NEW_PROXY_RESP => Message::NewProxyResp(serde_json::from_slice(body)?),
			TYPE_CLOSE_PROXY => Message::CloseProxy(serde_json::from_slice(body)?),
			TYPE_NEW_WORK_CONN => Message::NewWorkConn(serde_json::from_slice(body)?),
			TYPE_REQ_WORK_CONN => Message::ReqWorkConn(serde_json::from_slice(body)?),
			TYPE_START_WORK_CONN => Message::StartWorkConn(serde_json::from_slice(body)?),
			TYPE_NEW_VISITOR_CONN => Message::NewVisitorConn(serde_json::from_slice(body)?),
			TYPE_NEW_VISITOR_CONN_RESP => {
				Message::NewVisitorConnResp(serde_json::from_slice(body)?)
			},
			TYPE_PING => Message::Ping(serde_json::from_slice(body)?),
			TYPE_PONG => Message::Pong(serde_json::from_slice(body)?),
			TYPE_UDP_PACKET => Message::UdpPacket(serde_json::from_slice(body)?),
			other => return Err(MsgError::UnknownTag(other)),
		};
		Ok(msg)
	}
}

/// Read exactly one framed message. The reader never consumes bytes past the
/// declared body length; deadlines are the caller's business (wrap the call
/// in `tokio::time::timeout`).
pub async fn read_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, MsgError> {
	read_msg_bounded(r, MAX_BODY_LEN).await
}

pub async fn read_msg_bounded<R: AsyncRead + Unpin>(
	r: &mut R,
	max_body: usize,
) -> Result<Message, MsgError> {
	let tag = r.read_u8().await?;
	let len = r.read_u64().await?;
	if len > max_body as u64 {
		return Err(MsgError::FrameTooLarge { len, max: max_body });
	}
	let mut body = vec![0u8; len as usize];
	r.read_exact(&mut body).await?;
	Message::decode(tag, &body)
}

pub async fn write_msg<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), MsgError> {
	let body = msg.body()?;
	w.write_u8(msg.tag()).await?;
	w.write_u64(body.len() as u64).await?;
	w.write_all(&body).await?;
	w.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn login_round_trip() {
		let msg = Message::Login(Login {
			version: "0.1.0".to_string(),
			hostname: "box".to_string(),
			os: "linux".to_string(),
			arch: "x86_64".to_string(),
			user: "u".to_string(),
			privilege_key: "abcd".to_string(),
			timestamp: 1700000000,
			run_id: "deadbeef".to_string(),
			pool_count: 2,
			metas: HashMap::from([("k".to_string(), "v".to_string())]),
		});
		let (mut a, mut b) = tokio::io::duplex(4096);
		write_msg(&mut a, &msg).await.unwrap();
		let got = read_msg(&mut b).await.unwrap();
		assert_eq!(got, msg);
	}

	#[tokio::test]
	async fn json_keys_are_part_of_the_contract() {
		let body = serde_json::to_value(Login {
			privilege_key: "k".to_string(),
			run_id: "r".to_string(),
			..Default::default()
		})
		.unwrap();
		let obj = body.as_object().unwrap();
		assert!(obj.contains_key("PrivilegeKey"));
		assert!(obj.contains_key("RunId"));
		assert!(obj.contains_key("Timestamp"));
		assert!(obj.contains_key("PoolCount"));
	}

	#[tokio::test]
	async fn unknown_tag_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		tokio::io::AsyncWriteExt::write_all(&mut a, &[b'z', 0, 0, 0, 0, 0, 0, 0, 2, b'{', b'}'])
			.await
			.unwrap();
		match read_msg(&mut b).await {
			Err(MsgError::UnknownTag(b'z')) => {},
			other => panic!("expected UnknownTag, got {:?}", other.map(|m| m.kind())),
		}
	}

	#[tokio::test]
	async fn oversized_frame_is_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);
		let mut header = vec![TYPE_PING];
		header.extend_from_slice(&(11u64 * 1024 * 1024).to_be_bytes());
		tokio::io::AsyncWriteExt::write_all(&mut a, &header)
			.await
			.unwrap();
		match read_msg(&mut b).await {
			Err(MsgError::FrameTooLarge { .. }) => {},
			other => panic!("expected FrameTooLarge, got {:?}", other.map(|m| m.kind())),
		}
	}

	#[tokio::test]
	async fn truncated_body_is_an_io_error() {
		let (mut a, mut b) = tokio::io::duplex(64);
		let mut frame = vec![TYPE_PING];
		frame.extend_from_slice(&4u64.to_be_bytes());
		frame.extend_from_slice(b"{}");
		tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
			.await
			.unwrap();
		drop(a);
		assert!(matches!(read_msg(&mut b).await, Err(MsgError::Io(_))));
	}

	#[tokio::test]
	async fn reader_does_not_consume_past_the_frame() {
		let (mut a, mut b) = tokio::io::duplex(4096);
		write_msg(&mut a, &Message::Ping(Ping {})).await.unwrap();
		write_msg(&mut a, &Message::Pong(Pong {})).await.unwrap();
		assert!(matches!(
			read_msg(&mut b).await.unwrap(),
			Message::Ping(_)
		));
		assert!(matches!(
			read_msg(&mut b).await.unwrap(),
			Message::Pong(_)
		));
	}
}
