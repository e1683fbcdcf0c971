#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use tracing::info;

/// Connection pool for one of the supported SQL backends.
#[derive(Clone, Debug)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl Database {
	/// Connect by URL scheme and run the backend's migrations.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let db = if database_url.starts_with("sqlite:") {
			let pool = if database_url.contains(":memory:") {
				// each in-memory connection is its own database
				sqlx::sqlite::SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None)
					.max_lifetime(None)
					.connect(database_url)
					.await
					.context("connect sqlite")?
			} else {
				sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
			};
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Database::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Database::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			Database::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		info!(backend = db.backend_name(), "database connected");
		Ok(db)
	}

	pub fn backend_name(&self) -> &'static str {
		match self {
			Database::Sqlite(_) => "sqlite",
			Database::Postgres(_) => "postgres",
			Database::Mysql(_) => "mysql",
		}
	}
}
