#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sphere_domain::{RoomId, UserId};
use sphere_protocol::OutboundEvent;
use tracing::warn;

use crate::config::SecretString;
use crate::server::auth::{ConnectContext, IdentityResolver, constant_time_eq};
use crate::server::connection::{ConnectionSettings, ws_handler};
use crate::server::health::{HealthState, healthz, readyz};
use crate::server::notify::NotifyOutcome;
use crate::server::router::{InviteError, RoomRouter};

/// Everything a request handler needs.
#[derive(Clone)]
pub struct AppState {
	pub router: RoomRouter,
	pub resolver: Arc<dyn IdentityResolver>,
	pub connection: ConnectionSettings,
	pub health: HealthState,
	/// Shared secret for `/internal/*`; those routes refuse every call when unset.
	pub auth_token: Option<SecretString>,
}

pub fn build_router(state: AppState) -> Router {
	Router::new()
		.route("/ws", get(ws_handler))
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.route("/internal/notify/{user_id}", post(internal_notify))
		.route("/rooms/{room_id}/invite", post(invite))
		.with_state(state)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(str::trim)
		.filter(|t| !t.is_empty())
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
	(status, Json(json!({ "error": message.into() }))).into_response()
}

#[derive(Debug, Serialize)]
struct NotifyResponse {
	outcome: &'static str,
}

async fn internal_notify(
	State(state): State<AppState>,
	Path(user_id): Path<String>,
	headers: HeaderMap,
	Json(event): Json<OutboundEvent>,
) -> Response {
	let authorized = match (state.auth_token.as_ref(), bearer(&headers)) {
		(Some(expected), Some(provided)) => constant_time_eq(expected.expose().as_bytes(), provided.as_bytes()),
		_ => false,
	};
	if !authorized {
		return error(StatusCode::UNAUTHORIZED, "invalid auth token");
	}

	let Ok(user) = UserId::new(user_id) else {
		return error(StatusCode::BAD_REQUEST, "invalid user id");
	};

	let outcome = match state.router.notifier().notify(&user, &event).await {
		NotifyOutcome::Delivered => "delivered",
		NotifyOutcome::Offline => "offline",
		NotifyOutcome::Failed => "failed",
	};
	Json(NotifyResponse { outcome }).into_response()
}

#[derive(Debug, Deserialize)]
struct InviteRequest {
	user_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InviteResponse {
	room_id: String,
	invited: Vec<String>,
	sessions_joined: usize,
	notified: usize,
}

async fn invite(
	State(state): State<AppState>,
	Path(room_id): Path<String>,
	headers: HeaderMap,
	Json(req): Json<InviteRequest>,
) -> Response {
	let ctx = ConnectContext {
		token: bearer(&headers).map(str::to_string),
	};
	let inviter = match state.resolver.resolve(&ctx) {
		Ok(Some(identity)) => identity,
		Ok(None) => return error(StatusCode::UNAUTHORIZED, "missing token"),
		Err(e) => return error(StatusCode::UNAUTHORIZED, e.to_string()),
	};

	let room = match RoomId::parse_lenient(&room_id) {
		Ok(room) => room,
		Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
	};

	let invitees = match req.user_ids.into_iter().map(UserId::new).collect::<Result<Vec<_>, _>>() {
		Ok(users) => users,
		Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
	};

	match state.router.invite(&inviter, &room, &invitees).await {
		Ok(receipt) => Json(InviteResponse {
			room_id: receipt.room.to_string(),
			invited: receipt.invited.into_iter().map(UserId::into_string).collect(),
			sessions_joined: receipt.sessions_joined,
			notified: receipt.notified,
		})
		.into_response(),
		Err(e @ (InviteError::NotAMember | InviteError::NotFriends(_))) => error(StatusCode::FORBIDDEN, e.to_string()),
		Err(e @ InviteError::NotPrivate) => error(StatusCode::BAD_REQUEST, e.to_string()),
		Err(InviteError::Directory(e)) => {
			warn!(room = %room, error = %e, "invite: directory failure");
			error(StatusCode::INTERNAL_SERVER_ERROR, "directory unavailable")
		}
	}
}
