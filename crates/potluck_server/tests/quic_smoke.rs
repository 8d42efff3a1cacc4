#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use bytes::BytesMut;
use potluck_domain::{InviteCode, RoomId, RoomVisibility, SessionId};
use potluck_protocol::pb;
use potluck_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer, version};
use potluck_server::quic::config::{ALPN_V1, QuicServerConfig};
use potluck_server::server::broadcast::{BroadcastEngine, EngineConfig};
use potluck_server::server::connection::{ConnectionSettings, handle_connection};
use potluck_server::server::registry::{RegistryConfig, RoomRegistry};
use potluck_server::server::session::SessionTable;
use potluck_server::server::store::StoreService;
use tokio::task::JoinHandle;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("POTLUCK_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn install_crypto_provider() {
	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
}

/// A real server endpoint running the production connection handler against an
/// in-memory store.
struct TestServer {
	addr: SocketAddr,
	cert_der: Vec<u8>,
	engine: BroadcastEngine,
	accept_task: JoinHandle<()>,
}

impl Drop for TestServer {
	fn drop(&mut self) {
		self.accept_task.abort();
	}
}

fn spawn_test_server(registry: RoomRegistry) -> anyhow::Result<TestServer> {
	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let (endpoint, cert_der) = QuicServerConfig::dev(bind_addr).bind_dev_endpoint()?;
	let addr = endpoint.local_addr().context("server local_addr")?;

	let engine = BroadcastEngine::new(registry, SessionTable::new(), StoreService::in_memory(), EngineConfig::default());

	let accept_engine = engine.clone();
	let accept_task = tokio::spawn(async move {
		let mut next_session_id: u64 = 1;
		while let Some(connecting) = endpoint.accept().await {
			let session_id = SessionId(next_session_id);
			next_session_id += 1;

			let engine = accept_engine.clone();
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_connection(session_id, connection, engine, ConnectionSettings::default()).await;
				}
			});
		}
	});

	Ok(TestServer {
		addr,
		cert_der,
		engine,
		accept_task,
	})
}

/// Raw QUIC client speaking the framed envelope protocol on a single control
/// stream.
struct TestClient {
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	_connection: quinn::Connection,
	_endpoint: quinn::Endpoint,
}

impl TestClient {
	async fn connect(addr: SocketAddr, cert_der: &[u8], username: &str) -> anyhow::Result<(Self, pb::Welcome)> {
		let mut roots = rustls::RootCertStore::empty();
		roots
			.add(rustls::pki_types::CertificateDer::from(cert_der.to_vec()))
			.context("trust dev cert")?;

		let mut tls = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
		tls.alpn_protocols = vec![ALPN_V1.to_vec()];

		let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).context("convert rustls client config")?;
		let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().context("parse client bind")?)?;
		endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_tls)));

		let connection = endpoint
			.connect(addr, "localhost")
			.context("start connect")?
			.await
			.context("quic connect")?;
		let (send, recv) = connection.open_bi().await.context("open control stream")?;

		let mut client = Self {
			send,
			recv,
			buf: BytesMut::new(),
			_connection: connection,
			_endpoint: endpoint,
		};

		client
			.send_msg(pb::envelope::Msg::Hello(pb::Hello {
				username: username.to_string(),
				auth_token: String::new(),
				protocol_version: version::PROTOCOL_VERSION_U32,
			}))
			.await?;

		let welcome = match client.recv_msg().await? {
			pb::envelope::Msg::Welcome(w) => w,
			other => bail!("expected Welcome, got: {other:?}"),
		};

		Ok((client, welcome))
	}

	async fn send_msg(&mut self, msg: pb::envelope::Msg) -> anyhow::Result<()> {
		let frame = encode_frame(&pb::Envelope::from_msg(msg), DEFAULT_MAX_FRAME_SIZE)?;
		self.send.write_all(&frame).await.context("write frame")?;
		Ok(())
	}

	async fn recv_msg(&mut self) -> anyhow::Result<pb::envelope::Msg> {
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				if let Some(env) = try_decode_frame_from_buffer::<pb::Envelope>(&mut self.buf, DEFAULT_MAX_FRAME_SIZE)? {
					return env.msg.ok_or_else(|| anyhow!("envelope without payload"));
				}

				let mut tmp = [0u8; 8192];
				match self.recv.read(&mut tmp).await.context("control read")? {
					Some(n) => self.buf.extend_from_slice(&tmp[..n]),
					None => bail!("control stream closed"),
				}
			}
		})
		.await
		.context("timed out waiting for an envelope")?
	}

	async fn join(&mut self, room: &str, invite_code: &str) -> anyhow::Result<pb::envelope::Msg> {
		self.send_msg(pb::envelope::Msg::Join(pb::Join {
			room: room.to_string(),
			invite_code: invite_code.to_string(),
		}))
		.await?;
		self.recv_msg().await
	}

	async fn publish(&mut self, room: &str, text: &str) -> anyhow::Result<()> {
		self.send_msg(pb::envelope::Msg::Publish(pb::Publish {
			room: room.to_string(),
			text: text.to_string(),
		}))
		.await
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_smoke_publish_echo_and_history() -> anyhow::Result<()> {
	init_test_logging();
	install_crypto_provider();

	let server = spawn_test_server(RoomRegistry::new(RegistryConfig::default()))?;

	let (mut alice, welcome) = TestClient::connect(server.addr, &server.cert_der, "alice").await?;
	assert_eq!(welcome.username, "alice");
	assert_eq!(welcome.server_name, "potluck");
	assert_ne!(welcome.session_id, 0);

	match alice.join("kitchen", "").await? {
		pb::envelope::Msg::JoinOk(ok) => {
			assert_eq!(ok.room, "kitchen");
			assert!(ok.history.is_empty());
		}
		other => panic!("expected JoinOk, got: {other:?}"),
	}

	alice.publish("kitchen", "dinner at eight").await?;

	let ack = match alice.recv_msg().await? {
		pb::envelope::Msg::PublishAck(ack) => ack,
		other => panic!("expected PublishAck, got: {other:?}"),
	};
	assert_eq!(ack.room, "kitchen");

	match alice.recv_msg().await? {
		pb::envelope::Msg::MessageEvent(event) => {
			assert_eq!(event.room, "kitchen");
			assert_eq!(event.username, "alice");
			assert_eq!(event.text, "dinner at eight");
			assert_eq!(event.message_id, ack.message_id);
			assert!(!event.created_at.is_empty());
		}
		other => panic!("expected the sender's own event, got: {other:?}"),
	}

	// A later joiner sees the message as history, then receives live events.
	let (mut bob, _welcome) = TestClient::connect(server.addr, &server.cert_der, "bob").await?;
	match bob.join("kitchen", "").await? {
		pb::envelope::Msg::JoinOk(ok) => {
			assert_eq!(ok.history.len(), 1);
			assert_eq!(ok.history[0].username, "alice");
			assert_eq!(ok.history[0].text, "dinner at eight");
		}
		other => panic!("expected JoinOk, got: {other:?}"),
	}

	alice.publish("kitchen", "bring snacks").await?;

	match bob.recv_msg().await? {
		pb::envelope::Msg::MessageEvent(event) => {
			assert_eq!(event.username, "alice");
			assert_eq!(event.text, "bring snacks");
		}
		other => panic!("expected a live event, got: {other:?}"),
	}

	let kitchen = RoomId::new("kitchen")?;
	assert_eq!(server.engine.registry().member_count(&kitchen).await, 2);

	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_smoke_private_room_rejects_wrong_code() -> anyhow::Result<()> {
	init_test_logging();
	install_crypto_provider();

	let registry = RoomRegistry::new(RegistryConfig { create_on_demand: false });
	registry
		.seed(
			RoomId::new("veggie-lovers")?,
			RoomVisibility::Private {
				invite_code: InviteCode::new("ABCD")?,
			},
		)
		.await;
	let server = spawn_test_server(registry)?;

	let (mut carol, _welcome) = TestClient::connect(server.addr, &server.cert_der, "carol").await?;

	match carol.join("veggie-lovers", "abcd").await? {
		pb::envelope::Msg::ErrorReply(err) => {
			assert_eq!(err.code, pb::ErrorCode::InvalidInviteCode as i32);
			assert_eq!(err.room, "veggie-lovers");
			assert!(!err.retryable);
		}
		other => panic!("expected an error reply, got: {other:?}"),
	}

	// The rejection leaves the session usable; the exact code still admits it.
	match carol.join("veggie-lovers", "ABCD").await? {
		pb::envelope::Msg::JoinOk(ok) => assert_eq!(ok.room, "veggie-lovers"),
		other => panic!("expected JoinOk, got: {other:?}"),
	}

	Ok(())
}
