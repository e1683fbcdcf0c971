#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use sphere_domain::{RoomId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::server::db::Database;

#[derive(Debug, Error)]
pub enum DirectoryError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("invalid room id in directory: {0}")]
	InvalidRoom(String),
}

/// Friend relations and private room membership, owned by the wider application.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
	async fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool, DirectoryError>;

	/// Private rooms `user` belongs to.
	async fn rooms_for(&self, user: &UserId) -> Result<Vec<RoomId>, DirectoryError>;

	async fn is_room_member(&self, room: &RoomId, user: &UserId) -> Result<bool, DirectoryError>;

	/// Record `users` as members of `room`. Existing members are left as they are.
	async fn add_room_members(&self, room: &RoomId, users: &[UserId]) -> Result<(), DirectoryError>;
}

/// Directory held in memory; used when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
	friends: RwLock<HashSet<(UserId, UserId)>>,
	rooms: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl InMemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a symmetric friendship.
	pub async fn befriend(&self, a: &UserId, b: &UserId) {
		let mut friends = self.friends.write().await;
		friends.insert((a.clone(), b.clone()));
		friends.insert((b.clone(), a.clone()));
	}
}

#[async_trait::async_trait]
impl Directory for InMemoryDirectory {
	async fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool, DirectoryError> {
		Ok(self.friends.read().await.contains(&(a.clone(), b.clone())))
	}

	async fn rooms_for(&self, user: &UserId) -> Result<Vec<RoomId>, DirectoryError> {
		let rooms = self.rooms.read().await;
		Ok(rooms
			.iter()
			.filter(|(_, members)| members.contains(user))
			.map(|(room, _)| room.clone())
			.collect())
	}

	async fn is_room_member(&self, room: &RoomId, user: &UserId) -> Result<bool, DirectoryError> {
		Ok(self.rooms.read().await.get(room).is_some_and(|m| m.contains(user)))
	}

	async fn add_room_members(&self, room: &RoomId, users: &[UserId]) -> Result<(), DirectoryError> {
		let mut rooms = self.rooms.write().await;
		rooms.entry(room.clone()).or_default().extend(users.iter().cloned());
		Ok(())
	}
}

/// Reads `friendships` and `chatroom_members`.
#[derive(Debug, Clone)]
pub struct SqlDirectory {
	db: Database,
}

impl SqlDirectory {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

fn room_key(room: &RoomId) -> String {
	room.private_key().map(str::to_string).unwrap_or_else(|| room.to_string())
}

#[async_trait::async_trait]
impl Directory for SqlDirectory {
	async fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool, DirectoryError> {
		let row: Option<(i64,)> = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as("SELECT 1 FROM friendships WHERE user_id = ? AND friend_id = ?")
					.bind(a.as_str())
					.bind(b.as_str())
					.fetch_optional(pool)
					.await?
			}
			Database::Postgres(pool) => {
				sqlx::query_as("SELECT 1::BIGINT FROM friendships WHERE user_id = $1 AND friend_id = $2")
					.bind(a.as_str())
					.bind(b.as_str())
					.fetch_optional(pool)
					.await?
			}
			Database::Mysql(pool) => {
				sqlx::query_as("SELECT CAST(1 AS SIGNED) FROM friendships WHERE user_id = ? AND friend_id = ?")
					.bind(a.as_str())
					.bind(b.as_str())
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.is_some())
	}

	async fn rooms_for(&self, user: &UserId) -> Result<Vec<RoomId>, DirectoryError> {
		let rows: Vec<(String,)> = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as("SELECT room_id FROM chatroom_members WHERE user_id = ?")
					.bind(user.as_str())
					.fetch_all(pool)
					.await?
			}
			Database::Postgres(pool) => {
				sqlx::query_as("SELECT room_id FROM chatroom_members WHERE user_id = $1")
					.bind(user.as_str())
					.fetch_all(pool)
					.await?
			}
			Database::Mysql(pool) => {
				sqlx::query_as("SELECT room_id FROM chatroom_members WHERE user_id = ?")
					.bind(user.as_str())
					.fetch_all(pool)
					.await?
			}
		};

		rows.into_iter()
			.map(|(id,)| RoomId::private(id.clone()).map_err(|_| DirectoryError::InvalidRoom(id)))
			.collect()
	}

	async fn is_room_member(&self, room: &RoomId, user: &UserId) -> Result<bool, DirectoryError> {
		let key = room_key(room);
		let row: Option<(i64,)> = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as("SELECT 1 FROM chatroom_members WHERE room_id = ? AND user_id = ?")
					.bind(&key)
					.bind(user.as_str())
					.fetch_optional(pool)
					.await?
			}
			Database::Postgres(pool) => {
				sqlx::query_as("SELECT 1::BIGINT FROM chatroom_members WHERE room_id = $1 AND user_id = $2")
					.bind(&key)
					.bind(user.as_str())
					.fetch_optional(pool)
					.await?
			}
			Database::Mysql(pool) => {
				sqlx::query_as("SELECT CAST(1 AS SIGNED) FROM chatroom_members WHERE room_id = ? AND user_id = ?")
					.bind(&key)
					.bind(user.as_str())
					.fetch_optional(pool)
					.await?
			}
		};
		Ok(row.is_some())
	}

	async fn add_room_members(&self, room: &RoomId, users: &[UserId]) -> Result<(), DirectoryError> {
		let key = room_key(room);
		match &self.db {
			Database::Sqlite(pool) => {
				let mut tx = pool.begin().await?;
				for user in users {
					sqlx::query("INSERT INTO chatroom_members (room_id, user_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
						.bind(&key)
						.bind(user.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
			Database::Postgres(pool) => {
				let mut tx = pool.begin().await?;
				for user in users {
					sqlx::query(
						"INSERT INTO chatroom_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
					)
					.bind(&key)
					.bind(user.as_str())
					.execute(&mut *tx)
					.await?;
				}
				tx.commit().await?;
			}
			Database::Mysql(pool) => {
				let mut tx = pool.begin().await?;
				for user in users {
					sqlx::query("INSERT IGNORE INTO chatroom_members (room_id, user_id) VALUES (?, ?)")
						.bind(&key)
						.bind(user.as_str())
						.execute(&mut *tx)
						.await?;
				}
				tx.commit().await?;
			}
		}
		Ok(())
	}
}
