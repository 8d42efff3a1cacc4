#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow, bail};
use bytes::BytesMut;
use potluck_domain::{RoomId, SecretString, SessionId, Username};
use potluck_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use potluck_protocol::pb;
use potluck_protocol::{try_decode_frame_from_buffer, version};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AuthMode, ServerConfig};
use crate::server::auth::verify_hmac_token;
use crate::server::broadcast::BroadcastEngine;
use crate::server::session::SessionItem;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub server_name: String,
	pub max_frame_size: usize,
	pub subscriber_queue_capacity: usize,
	pub auth: ConnectionAuth,
}

/// How the handshake resolves a session's username.
#[derive(Debug, Clone)]
pub enum ConnectionAuth {
	/// Trust the display name carried in `Hello`.
	Anonymous,
	/// Require a signed token; the username comes from its `sub` claim.
	Token { secret: SecretString },
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			server_name: "potluck".to_string(),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			subscriber_queue_capacity: 1024,
			auth: ConnectionAuth::Anonymous,
		}
	}
}

impl ConnectionSettings {
	pub fn from_config(cfg: &ServerConfig) -> anyhow::Result<Self> {
		let auth = match (cfg.auth.mode, cfg.auth.token_secret.clone()) {
			(AuthMode::Anonymous, _) => ConnectionAuth::Anonymous,
			(AuthMode::Token, Some(secret)) => ConnectionAuth::Token { secret },
			(AuthMode::Token, None) => bail!("auth mode is token but no token_secret configured"),
		};

		Ok(Self {
			server_name: cfg.server.server_name.clone(),
			max_frame_size: cfg.server.max_frame_size,
			subscriber_queue_capacity: cfg.server.subscriber_queue_capacity,
			auth,
		})
	}
}

pub async fn handle_connection(
	session_id: SessionId,
	connection: quinn::Connection,
	engine: BroadcastEngine,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("potluck_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("potluck_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept control bidirectional stream")?;

	let max_frame_size = settings.max_frame_size;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("potluck_server_bytes_in_total").increment(n as u64);
			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, max_frame_size) {
					Ok(Some(env)) => {
						metrics::counter!("potluck_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("potluck_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let username = match establish_session(&mut ctrl_rx, &mut send, max_frame_size, &settings).await? {
		Some(username) => username,
		None => {
			reader_task.abort();
			let _ = reader_task.await;
			return Ok(());
		}
	};

	let mut delivery_rx = engine
		.sessions()
		.register(session_id, username.clone(), settings.subscriber_queue_capacity)
		.await;

	info!(session = %session_id, username = %username, "session established");
	metrics::counter!("potluck_server_hello_total").increment(1);

	let welcome = pb::Welcome {
		session_id: session_id.0,
		server_name: settings.server_name.clone(),
		username: username.as_str().to_string(),
	};

	let loop_result = async {
		send_envelope(&mut send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::Welcome(welcome)))
			.await
			.context("send Welcome")?;

		loop {
			tokio::select! {
				env = ctrl_rx.recv() => {
					let Some(env) = env else { break };
					let Some(msg) = env.msg else { continue };

					match msg {
						pb::envelope::Msg::Ping(ping) => {
							let pong = pb::Pong { nonce: ping.nonce };
							send_envelope(&mut send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::Pong(pong))).await?;
						}

						pb::envelope::Msg::Join(join) => {
							handle_join(&engine, &mut send, max_frame_size, session_id, join).await?;
						}

						pb::envelope::Msg::Publish(publish) => {
							handle_publish(&engine, &mut send, max_frame_size, session_id, publish).await?;
						}

						pb::envelope::Msg::Hello(_) => {
							debug!(session = %session_id, "ignoring duplicate Hello");
						}

						other => {
							warn!(session = %session_id, "unhandled control message: {:?}", message_kind(&other));
						}
					}
				}

				item = delivery_rx.recv() => {
					let Some(item) = item else { break };

					match item {
						SessionItem::Message(event) => {
							metrics::counter!("potluck_server_events_out_total").increment(1);
							send_envelope(&mut send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::MessageEvent(*event))).await?;
						}
						SessionItem::Lagged { dropped } => {
							warn!(session = %session_id, dropped, "session fell behind; messages were dropped");
							let reply = pb::ErrorReply {
								code: pb::ErrorCode::DeliveryFailure as i32,
								message: format!("fell behind; {dropped} messages dropped"),
								room: String::new(),
								retryable: false,
							};
							send_envelope(&mut send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::ErrorReply(reply))).await?;
						}
					}
				}
			}
		}

		Ok::<(), anyhow::Error>(())
	}
	.await;

	let left = engine.disconnect(session_id).await;
	debug!(session = %session_id, rooms = left.len(), "connection closed, session removed");

	reader_task.abort();
	let _ = reader_task.await;

	loop_result
}

/// Run the handshake: the first frame must be `Hello`, and the username is
/// resolved per the configured auth mode. Returns `None` when the connection
/// was rejected (an error frame has already been sent).
async fn establish_session(
	ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>,
	send: &mut quinn::SendStream,
	max_frame_size: usize,
	settings: &ConnectionSettings,
) -> anyhow::Result<Option<Username>> {
	let Some(env) = ctrl_rx.recv().await else {
		return Err(anyhow!("connection closed before Hello"));
	};

	let hello = match env.msg {
		Some(pb::envelope::Msg::Hello(hello)) => hello,
		_ => {
			send_error(send, max_frame_size, pb::ErrorCode::Protocol, "expected Hello as first frame").await.ok();
			return Ok(None);
		}
	};

	if hello.protocol_version != 0 && (hello.protocol_version >> 16) != version::PROTOCOL_MAJOR {
		send_error(send, max_frame_size, pb::ErrorCode::Protocol, "unsupported protocol version").await.ok();
		return Ok(None);
	}

	let username = match &settings.auth {
		ConnectionAuth::Anonymous => match Username::new(hello.username) {
			Ok(username) => username,
			Err(_) => {
				send_error(send, max_frame_size, pb::ErrorCode::Protocol, "username required").await.ok();
				return Ok(None);
			}
		},
		ConnectionAuth::Token { secret } => match verify_hmac_token(hello.auth_token.trim(), secret.expose()) {
			Ok(claims) => match Username::new(claims.sub) {
				Ok(username) => username,
				Err(_) => {
					send_error(send, max_frame_size, pb::ErrorCode::Unauthorized, "token subject is empty").await.ok();
					return Ok(None);
				}
			},
			Err(e) => {
				warn!(error = %e, "auth token rejected");
				metrics::counter!("potluck_server_auth_failures_total").increment(1);
				send_error(send, max_frame_size, pb::ErrorCode::Unauthorized, "invalid auth token").await.ok();
				return Ok(None);
			}
		},
	};

	Ok(Some(username))
}

async fn handle_join(
	engine: &BroadcastEngine,
	send: &mut quinn::SendStream,
	max_frame_size: usize,
	session: SessionId,
	join: pb::Join,
) -> anyhow::Result<()> {
	metrics::counter!("potluck_server_join_requests_total").increment(1);

	let Ok(room) = RoomId::new(join.room) else {
		return send_error(send, max_frame_size, pb::ErrorCode::Protocol, "room name is empty").await;
	};

	let invite_code = if join.invite_code.is_empty() {
		None
	} else {
		Some(join.invite_code.as_str())
	};

	match engine.join(session, &room, invite_code).await {
		Ok(history) => {
			metrics::counter!("potluck_server_joins_total").increment(1);
			let ok = pb::JoinOk {
				room: room.as_str().to_string(),
				history,
			};
			send_envelope(send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::JoinOk(ok))).await
		}
		Err(err) => {
			metrics::counter!("potluck_server_join_failures_total").increment(1);
			warn!(session = %session, room = %room, error = %err, "join rejected");
			let reply = pb::ErrorReply::from_chat_error(&err, room.as_str());
			send_envelope(send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::ErrorReply(reply))).await
		}
	}
}

async fn handle_publish(
	engine: &BroadcastEngine,
	send: &mut quinn::SendStream,
	max_frame_size: usize,
	session: SessionId,
	publish: pb::Publish,
) -> anyhow::Result<()> {
	metrics::counter!("potluck_server_publish_requests_total").increment(1);

	let Ok(room) = RoomId::new(publish.room) else {
		return send_error(send, max_frame_size, pb::ErrorCode::Protocol, "room name is empty").await;
	};

	match engine.publish(session, &room, &publish.text).await {
		Ok((stored, report)) => {
			metrics::counter!("potluck_server_publishes_total").increment(1);
			metrics::counter!("potluck_server_broadcast_delivered_total").increment(report.delivered as u64);
			if report.dropped > 0 {
				metrics::counter!("potluck_server_broadcast_dropped_total").increment(report.dropped as u64);
			}

			let ack = pb::PublishAck {
				room: room.as_str().to_string(),
				message_id: stored.id,
			};
			send_envelope(send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::PublishAck(ack))).await
		}
		Err(err) => {
			metrics::counter!("potluck_server_publish_failures_total").increment(1);
			warn!(session = %session, room = %room, error = %err, "publish rejected");
			let reply = pb::ErrorReply::from_chat_error(&err, room.as_str());
			send_envelope(send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::ErrorReply(reply))).await
		}
	}
}

async fn send_envelope(send: &mut quinn::SendStream, max_frame_size: usize, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, max_frame_size)?;
	metrics::counter!("potluck_server_envelopes_out_total").increment(1);
	metrics::counter!("potluck_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

async fn send_error(send: &mut quinn::SendStream, max_frame_size: usize, code: pb::ErrorCode, message: &str) -> anyhow::Result<()> {
	let reply = pb::ErrorReply {
		code: code as i32,
		message: message.to_string(),
		room: String::new(),
		retryable: false,
	};
	send_envelope(send, max_frame_size, pb::Envelope::from_msg(pb::envelope::Msg::ErrorReply(reply))).await
}

fn message_kind(msg: &pb::envelope::Msg) -> &'static str {
	match msg {
		pb::envelope::Msg::Hello(_) => "Hello",
		pb::envelope::Msg::Welcome(_) => "Welcome",
		pb::envelope::Msg::Join(_) => "Join",
		pb::envelope::Msg::JoinOk(_) => "JoinOk",
		pb::envelope::Msg::Publish(_) => "Publish",
		pb::envelope::Msg::PublishAck(_) => "PublishAck",
		pb::envelope::Msg::MessageEvent(_) => "MessageEvent",
		pb::envelope::Msg::ErrorReply(_) => "ErrorReply",
		pb::envelope::Msg::Ping(_) => "Ping",
		pb::envelope::Msg::Pong(_) => "Pong",
	}
}
