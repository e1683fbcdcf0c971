#![forbid(unsafe_code)]

pub mod config;
pub mod server;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::server::auth::{AnonymousResolver, HmacIdentityResolver, IdentityResolver};
use crate::server::connection::ConnectionSettings;
use crate::server::db::Database;
use crate::server::directory::{Directory, InMemoryDirectory, SqlDirectory};
use crate::server::health::HealthState;
use crate::server::registry::{ConnectionRegistry, RegistryConfig};
use crate::server::router::{RoomRouter, RouterConfig};
use crate::server::state::AppState;
use crate::server::store::{InMemoryMessageStore, MessageStore, SqlMessageStore};

/// Wire the registry, router, persistence and identity resolver from config.
pub async fn build_state(cfg: &ServerConfig) -> anyhow::Result<AppState> {
	let (store, directory): (Arc<dyn MessageStore>, Arc<dyn Directory>) = match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let db = Database::connect(url).await?;
			(Arc::new(SqlMessageStore::new(db.clone())), Arc::new(SqlDirectory::new(db)))
		}
		None => {
			warn!("persistence: no database_url configured; messages and rooms are kept in memory only");
			(Arc::new(InMemoryMessageStore::new()), Arc::new(InMemoryDirectory::new()))
		}
	};

	Ok(build_state_with(cfg, store, directory))
}

/// Wire the registry, router and identity resolver around the given persistence.
pub fn build_state_with(cfg: &ServerConfig, store: Arc<dyn MessageStore>, directory: Arc<dyn Directory>) -> AppState {
	let resolver: Arc<dyn IdentityResolver> = match cfg.server.auth_hmac_secret.as_ref() {
		Some(secret) => Arc::new(HmacIdentityResolver::new(secret.expose())),
		None => {
			info!("server auth: no auth_hmac_secret; connections are anonymous (global room only)");
			Arc::new(AnonymousResolver)
		}
	};

	let registry = ConnectionRegistry::new(RegistryConfig {
		outbound_queue_capacity: cfg.server.outbound_queue_capacity,
		debug_logs: false,
	});

	let router = RoomRouter::new(
		registry,
		store,
		directory,
		RouterConfig {
			send_timeout: cfg.server.send_timeout,
			..RouterConfig::default()
		},
	);

	AppState {
		router,
		resolver,
		connection: ConnectionSettings {
			require_identity: cfg.server.require_identity,
			max_frame_bytes: cfg.server.max_frame_bytes,
			ping_interval: cfg.server.ping_interval,
			event_rate_limit_burst: cfg.server.event_rate_limit_burst,
			event_rate_limit_per_minute: cfg.server.event_rate_limit_per_minute,
		},
		health: HealthState::new(),
		auth_token: cfg.auth_token.clone(),
	}
}
