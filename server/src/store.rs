use async_trait::async_trait;
use lrsr_auth::{
    Error, LocalUser, StateStore, UpstreamProfile, UserLookup, error::Result as AuthResult,
};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;
use std::time::Duration;

/// SQLite-backed state and user storage for the broker.
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
    sweep_interval: Duration,
}

impl SqliteStore {
    pub fn builder(db: SqlitePool) -> SqliteStoreBuilder {
        SqliteStoreBuilder {
            db,
            sweep_interval: None,
        }
    }

    /// Delete expired state rows, returning how many were removed.
    pub async fn purge_expired(&self) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM ephemeral_state WHERE expires_at <= ?")
            .bind(now())
            .execute(&self.db)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    /// Periodically purge expired state in the background.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.sweep_interval);
            loop {
                interval.tick().await;
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!("purged {} expired state entries", removed),
                    Err(e) => tracing::warn!("failed to purge expired state: {}", e),
                }
            }
        })
    }
}

pub struct SqliteStoreBuilder {
    db: SqlitePool,
    sweep_interval: Option<Duration>,
}

impl SqliteStoreBuilder {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn build(self) -> Arc<SqliteStore> {
        Arc::new(SqliteStore {
            db: self.db,
            sweep_interval: self.sweep_interval.unwrap_or(Duration::from_secs(60)),
        })
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn storage(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> AuthResult<()> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO ephemeral_state (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now().saturating_add(ttl))
        .execute(&self.db)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM ephemeral_state WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now())
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        row.map(|row| row.try_get("value").map_err(storage))
            .transpose()
    }

    async fn consume(&self, key: &str) -> AuthResult<Option<String>> {
        // Single statement, so two concurrent consumers cannot both see the row
        let row = sqlx::query("DELETE FROM ephemeral_state WHERE key = ? RETURNING value, expires_at")
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at: i64 = row.try_get("expires_at").map_err(storage)?;
        if expires_at <= now() {
            return Ok(None);
        }
        Ok(Some(row.try_get("value").map_err(storage)?))
    }
}

fn user_from_row(row: &SqliteRow) -> AuthResult<LocalUser> {
    Ok(LocalUser {
        id: row.try_get("id").map_err(storage)?,
        email: row.try_get("email").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        external_id: row.try_get("external_id").map_err(storage)?,
    })
}

const USER_COLUMNS: &str = "SELECT id, email, name, external_id FROM users";

#[async_trait]
impl UserLookup for SqliteStore {
    async fn find_by_id(&self, id: i64) -> AuthResult<Option<LocalUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_external_id(&self, external_id: &str) -> AuthResult<Option<LocalUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE external_id = ?"))
            .bind(external_id)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> AuthResult<Option<LocalUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create(&self, profile: &UpstreamProfile) -> AuthResult<LocalUser> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, name, external_id)
            VALUES (?, ?, ?)
            RETURNING id, email, name, external_id
            "#,
        )
        .bind(&profile.email)
        .bind(&profile.name)
        .bind(&profile.external_id)
        .fetch_one(&self.db)
        .await
        .map_err(storage)?;
        user_from_row(&row)
    }

    async fn link_external_id(&self, user_id: i64, external_id: &str) -> AuthResult<()> {
        let result =
            sqlx::query("UPDATE users SET external_id = ? WHERE id = ? AND external_id IS NULL")
                .bind(external_id)
                .bind(user_id)
                .execute(&self.db)
                .await
                .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(Error::Storage(format!(
                "user {} is missing or already linked",
                user_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> Arc<SqliteStore> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::raw_sql(include_str!("../migrations/001_broker_schema.sql"))
            .execute(&pool)
            .await
            .unwrap();
        SqliteStore::builder(pool).build()
    }

    fn profile(external_id: &str, email: &str) -> UpstreamProfile {
        UpstreamProfile {
            external_id: external_id.into(),
            email: email.into(),
            name: Some("Ada".into()),
        }
    }

    #[tokio::test]
    async fn consume_returns_value_once() {
        let store = store().await;
        store
            .put("auth_code:abc", "{}".into(), Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(store.get("auth_code:abc").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(
            store.consume("auth_code:abc").await.unwrap().as_deref(),
            Some("{}")
        );
        assert_eq!(store.consume("auth_code:abc").await.unwrap(), None);
        assert_eq!(store.get("auth_code:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purged() {
        let store = store().await;
        store
            .put("auth_request:old", "{}".into(), Duration::ZERO)
            .await
            .unwrap();
        store
            .put("auth_request:new", "{}".into(), Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(store.get("auth_request:old").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("auth_request:new").await.unwrap().is_some());
        assert_eq!(store.consume("auth_request:old").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let store = store().await;
        store
            .put("refresh_token:r", "1".into(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("refresh_token:r", "2".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("refresh_token:r").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn users_are_created_linked_and_found() {
        let store = store().await;
        let user = store.create(&profile("g-1", "ada@example.com")).await.unwrap();
        assert_eq!(user.external_id.as_deref(), Some("g-1"));

        let by_email = store.find_by_email("ADA@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        assert_eq!(
            store.find_by_external_id("g-1").await.unwrap().map(|u| u.id),
            Some(user.id)
        );
        assert!(store.link_external_id(user.id, "g-2").await.is_err());
    }

    #[tokio::test]
    async fn resolve_or_create_links_by_email() {
        let store = store().await;
        sqlx::query("INSERT INTO users (email, name) VALUES ('bob@example.com', 'Bob')")
            .execute(&store.db)
            .await
            .unwrap();

        let user = lrsr_auth::resolve_or_create(store.as_ref(), &profile("g-7", "bob@example.com"))
            .await
            .unwrap();
        assert_eq!(user.name.as_deref(), Some("Bob"));
        assert_eq!(
            store.find_by_id(user.id).await.unwrap().unwrap().external_id.as_deref(),
            Some("g-7")
        );
    }
}
