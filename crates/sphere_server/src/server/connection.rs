#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use sphere_domain::{Identity, RoomId, SessionId};
use sphere_protocol::decode_event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::auth::ConnectContext;
use crate::server::registry::{ConnectionRegistry, OutboundFrame, SessionHandle};
use crate::server::router::RouteOutcome;
use crate::server::state::AppState;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub require_identity: bool,
	pub max_frame_bytes: usize,
	pub ping_interval: Duration,
	pub event_rate_limit_burst: u32,
	pub event_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			require_identity: false,
			max_frame_bytes: sphere_protocol::DEFAULT_MAX_FRAME_SIZE,
			ping_interval: Duration::from_secs(30),
			event_rate_limit_burst: 0,
			event_rate_limit_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		self.allow_at(Instant::now())
	}

	fn allow_at(&mut self, now: Instant) -> bool {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
	pub token: Option<String>,
}

enum Handshake {
	Admit(Option<Identity>),
	Reject(&'static str),
}

/// `GET /ws?token=...`
pub async fn ws_handler(ws: WebSocketUpgrade, Query(params): Query<ConnectParams>, State(state): State<AppState>) -> Response {
	let ctx = ConnectContext { token: params.token };

	let handshake = match state.resolver.resolve(&ctx) {
		Ok(Some(identity)) => Handshake::Admit(Some(identity)),
		Ok(None) if state.connection.require_identity => Handshake::Reject("identity required"),
		Ok(None) => Handshake::Admit(None),
		Err(e) => {
			warn!(error = %e, "connection: token rejected");
			Handshake::Reject("invalid token")
		}
	};

	ws.on_upgrade(move |socket| async move {
		match handshake {
			Handshake::Admit(identity) => run_session(socket, state, identity).await,
			Handshake::Reject(reason) => reject(socket, reason).await,
		}
	})
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
	metrics::counter!("sphere_server_connections_rejected_total").increment(1);
	let _ = socket
		.send(Message::Close(Some(CloseFrame {
			code: close_code::POLICY,
			reason: reason.into(),
		})))
		.await;
}

/// Evicts the session if the loop exits without doing so itself.
struct EvictGuard {
	registry: ConnectionRegistry,
	session: SessionId,
	armed: bool,
}

impl EvictGuard {
	async fn evict(mut self) {
		self.registry.evict(self.session).await;
		self.armed = false;
	}
}

impl Drop for EvictGuard {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		let registry = self.registry.clone();
		let session = self.session;
		if let Ok(rt) = tokio::runtime::Handle::try_current() {
			rt.spawn(async move {
				registry.evict(session).await;
			});
		}
	}
}

struct ConnectionGaugeGuard;

impl Drop for ConnectionGaugeGuard {
	fn drop(&mut self) {
		metrics::gauge!("sphere_server_active_connections").decrement(1.0);
	}
}

async fn memberships_for(state: &AppState, identity: Option<&Identity>) -> Vec<RoomId> {
	let Some(identity) = identity else {
		return Vec::new();
	};

	match state.router.directory().rooms_for(&identity.user_id).await {
		Ok(rooms) => rooms,
		Err(e) => {
			warn!(user_id = %identity.user_id, error = %e, "connection: room lookup failed; admitting with global room only");
			Vec::new()
		}
	}
}

async fn run_session(socket: WebSocket, state: AppState, identity: Option<Identity>) {
	metrics::gauge!("sphere_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let memberships = memberships_for(&state, identity.as_ref()).await;
	let registry = state.router.registry().clone();
	let (handle, outbound_rx) = registry.admit(identity, memberships).await;
	let guard = EvictGuard {
		registry,
		session: handle.id(),
		armed: true,
	};

	info!(
		conn_id = %handle.id(),
		user_id = ?handle.user_id().map(|u| u.as_str()),
		"connection opened"
	);
	metrics::counter!("sphere_server_connections_total").increment(1);

	let (ws_tx, ws_rx) = socket.split();
	let mut writer = tokio::spawn(write_loop(ws_tx, outbound_rx, state.connection.ping_interval, handle.id()));

	read_loop(ws_rx, &handle, &state, &mut writer).await;

	writer.abort();
	guard.evict().await;
	info!(conn_id = %handle.id(), "connection closed");
}

async fn read_loop(
	mut ws_rx: SplitStream<WebSocket>,
	handle: &SessionHandle,
	state: &AppState,
	writer: &mut JoinHandle<()>,
) {
	let mut limiter = TokenBucket::new(
		state.connection.event_rate_limit_burst,
		state.connection.event_rate_limit_per_minute,
	);

	loop {
		// eviction and writer exit are only observed between frames so an in-flight route completes
		let msg = tokio::select! {
			msg = ws_rx.next() => msg,
			_ = handle.evicted() => {
				debug!(conn_id = %handle.id(), "connection: evicted by server");
				break;
			}
			_ = &mut *writer => {
				debug!(conn_id = %handle.id(), "connection: writer exited");
				break;
			}
		};
		let Some(msg) = msg else {
			break;
		};

		let text = match msg {
			Ok(Message::Text(t)) => t.as_str().to_owned(),
			Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
				Ok(t) => t,
				Err(_) => {
					metrics::counter!("sphere_server_frames_dropped_total", "reason" => "binary").increment(1);
					continue;
				}
			},
			Ok(Message::Close(_)) => break,
			Ok(_) => continue,
			Err(e) => {
				debug!(conn_id = %handle.id(), error = %e, "connection: read failed");
				break;
			}
		};

		let event = match decode_event(&text, state.connection.max_frame_bytes) {
			Ok(ev) => ev,
			Err(e) => {
				metrics::counter!("sphere_server_frames_dropped_total", "reason" => "malformed").increment(1);
				debug!(conn_id = %handle.id(), error = %e, len = text.len(), "connection: dropping undecodable frame");
				continue;
			}
		};

		if let Some(bucket) = limiter.as_mut()
			&& !bucket.allow()
		{
			state.router.rate_limited(&event);
			debug!(conn_id = %handle.id(), event = event.name(), "connection: rate limited");
			continue;
		}

		if let RouteOutcome::Failed = state.router.route(handle, event).await {
			debug!(conn_id = %handle.id(), "connection: event failed; staying open");
		}
	}
}

async fn write_loop(
	mut ws_tx: SplitSink<WebSocket, Message>,
	mut outbound_rx: mpsc::Receiver<OutboundFrame>,
	ping_interval: Duration,
	conn_id: SessionId,
) {
	let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

	loop {
		tokio::select! {
			frame = outbound_rx.recv() => {
				let Some(frame) = frame else {
					break;
				};
				if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
					debug!(conn_id = %conn_id, "connection: send failed; client gone");
					return;
				}
			}
			_ = ping.tick() => {
				if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
					return;
				}
			}
		}
	}

	let _ = ws_tx.close().await;
}
