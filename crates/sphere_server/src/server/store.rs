#![forbid(unsafe_code)]

use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use sphere_domain::{Message, MessageId, NewMessage};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::server::db::Database;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("store unavailable: {0}")]
	Unavailable(String),
}

/// Durable record of every chat message before it is delivered.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Assign an id and timestamp to `message` and store it.
	async fn persist(&self, message: NewMessage) -> Result<Message, StoreError>;
}

/// Wall clock clamped so successive readings never go backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
	last: StdMutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
	pub fn now(&self) -> DateTime<Utc> {
		self.observe(Utc::now())
	}

	fn observe(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
		let mut last = match self.last.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		};

		let ts = match *last {
			Some(prev) if wall < prev => prev,
			_ => wall,
		};
		*last = Some(ts);
		ts
	}
}

/// Process-local store for dev mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
	clock: MonotonicClock,
	messages: Mutex<Vec<Message>>,
}

impl InMemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn messages(&self) -> Vec<Message> {
		self.messages.lock().await.clone()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn persist(&self, message: NewMessage) -> Result<Message, StoreError> {
		let mut guard = self.messages.lock().await;
		let stored = message.into_stored(MessageId::new_v4(), self.clock.now());
		guard.push(stored.clone());
		Ok(stored)
	}
}

/// `messages` table writer over any supported SQL backend.
#[derive(Debug)]
pub struct SqlMessageStore {
	db: Database,
	clock: MonotonicClock,
}

impl SqlMessageStore {
	pub fn new(db: Database) -> Self {
		Self {
			db,
			clock: MonotonicClock::default(),
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn persist(&self, message: NewMessage) -> Result<Message, StoreError> {
		let stored = message.into_stored(MessageId::new_v4(), self.clock.now());
		let id = stored.id.to_string();
		let sender = stored.sender_id.as_str();
		let recipient = stored.recipient_id().map(|u| u.as_str());
		let room = stored.room_id().and_then(|r| r.private_key());
		let is_global = stored.is_global();

		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, recipient_id, room_id, content, is_global, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&id)
				.bind(sender)
				.bind(recipient)
				.bind(room)
				.bind(&stored.content)
				.bind(is_global)
				.bind(stored.timestamp)
				.execute(pool)
				.await?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, recipient_id, room_id, content, is_global, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(&id)
				.bind(sender)
				.bind(recipient)
				.bind(room)
				.bind(&stored.content)
				.bind(is_global)
				.bind(stored.timestamp)
				.execute(pool)
				.await?;
			}
			Database::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, sender_id, recipient_id, room_id, content, is_global, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(&id)
				.bind(sender)
				.bind(recipient)
				.bind(room)
				.bind(&stored.content)
				.bind(is_global)
				.bind(stored.timestamp)
				.execute(pool)
				.await?;
			}
		}

		Ok(stored)
	}
}
