//! SQLite database operations
//!
//! All database access goes through this module. The follower table is the
//! only shared resource mutated from concurrent inbox handlers, so its write
//! path is serialized by a process-wide async lock held across the whole
//! transaction.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use tokio::sync::Mutex;
use url::Url;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
    /// Serializes all follower-table writes across concurrent handlers.
    follower_write_lock: Mutex<()>,
}

fn map_insert_error(error: sqlx::Error, key: &str) -> AppError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            return AppError::Duplicate(key.to_string());
        }
    }
    AppError::Database(error)
}

fn parse_stored_url(raw: &str, column: &str) -> Result<Url, AppError> {
    Url::parse(raw)
        .map_err(|e| AppError::Corrupt(format!("stored {} is not a valid URL ({}): {}", column, raw, e)))
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self {
            pool,
            follower_write_lock: Mutex::new(()),
        })
    }

    // =========================================================================
    // Local actor (single row)
    // =========================================================================

    /// Get the single local actor identity
    ///
    /// # Returns
    /// The actor or None if not initialized
    pub async fn get_local_actor(&self) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>("SELECT * FROM ap_local_actor LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Insert the local actor only when the table is empty.
    ///
    /// Atomic at the SQL statement level, so concurrent initializers
    /// cannot both create the first identity.
    ///
    /// # Returns
    /// `true` if inserted, `false` if an actor already existed.
    pub async fn insert_local_actor_if_empty(&self, actor: &LocalActor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ap_local_actor (id, account, private_key_pem, public_key_pem, created_at)
            SELECT ?, ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM ap_local_actor)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.account)
        .bind(&actor.private_key_pem)
        .bind(&actor.public_key_pem)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert a new follower row.
    ///
    /// Holds the follower write lock across the whole transaction, and
    /// takes the SQLite write lock up front with BEGIN IMMEDIATE.
    ///
    /// # Errors
    /// `AppError::Duplicate` if a row with the same IRI already exists.
    pub async fn add_follower(&self, follower: &Follower) -> Result<(), AppError> {
        let _guard = self.follower_write_lock.lock().await;

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            sqlx::query(
                "INSERT INTO ap_followers (iri, inbox, name, avatar_url, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(follower.iri.as_str())
            .bind(follower.inbox.as_str())
            .bind(&follower.name)
            .bind(&follower.avatar_url)
            .bind(follower.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_insert_error(e, follower.iri.as_str()))?;
            Ok::<_, AppError>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Delete a follower row if present.
    ///
    /// # Returns
    /// `true` if a row was removed; deleting an absent IRI is a success.
    pub async fn remove_follower(&self, iri: &str) -> Result<bool, AppError> {
        let _guard = self.follower_write_lock.lock().await;

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            let result = sqlx::query("DELETE FROM ap_followers WHERE iri = ?")
                .bind(iri)
                .execute(&mut *conn)
                .await?;
            Ok::<_, AppError>(result.rows_affected() > 0)
        }
        .await;

        match result {
            Ok(removed) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(removed)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Refresh display metadata for a known follower.
    ///
    /// Updating an IRI we do not track is a silent no-op; Update activities
    /// from strangers carry nothing worth keeping.
    pub async fn update_follower_metadata(
        &self,
        iri: &str,
        inbox: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<(), AppError> {
        let _guard = self.follower_write_lock.lock().await;

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = async {
            sqlx::query(
                "UPDATE ap_followers SET inbox = ?, name = ?, avatar_url = ? WHERE iri = ?",
            )
            .bind(inbox)
            .bind(name)
            .bind(avatar_url)
            .bind(iri)
            .execute(&mut *conn)
            .await?;
            Ok::<_, AppError>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    /// Get all followers in insertion order.
    ///
    /// # Errors
    /// `AppError::Corrupt` if a stored IRI or inbox no longer parses as a URL.
    pub async fn list_followers(&self) -> Result<Vec<Follower>, AppError> {
        let rows = sqlx::query(
            "SELECT iri, inbox, name, avatar_url, created_at FROM ap_followers ORDER BY created_at ASC, iri ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut followers = Vec::with_capacity(rows.len());
        for row in rows {
            let iri: String = row.try_get("iri")?;
            let inbox: String = row.try_get("inbox")?;
            followers.push(Follower {
                iri: parse_stored_url(&iri, "iri")?,
                inbox: parse_stored_url(&inbox, "inbox")?,
                name: row.try_get("name")?,
                avatar_url: row.try_get("avatar_url")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            });
        }

        Ok(followers)
    }

    /// Count followers.
    pub async fn count_followers(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ap_followers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Outbox
    // =========================================================================

    /// Append a locally authored activity/object to the outbox log.
    ///
    /// # Errors
    /// `AppError::Validation` when the item carries no IRI;
    /// `AppError::Duplicate` if the short identifier is already taken.
    pub async fn add_outbox_item(&self, item: &OutboxItem) -> Result<(), AppError> {
        if item.iri.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "outbox item {} has no IRI",
                item.id
            )));
        }

        sqlx::query(
            "INSERT INTO ap_outbox (id, iri, object_type, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.iri)
        .bind(item.object_type.as_str())
        .bind(&item.payload)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &item.id))?;

        Ok(())
    }

    /// Fetch the stored payload for a local IRI.
    ///
    /// # Returns
    /// `None` when this server never authored an object with that IRI.
    pub async fn get_outbox_payload_by_iri(&self, iri: &str) -> Result<Option<Vec<u8>>, AppError> {
        let payload =
            sqlx::query_scalar::<_, Vec<u8>>("SELECT payload FROM ap_outbox WHERE iri = ? LIMIT 1")
                .bind(iri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(payload)
    }

    /// Get one page of the most recent outbox items, newest first.
    pub async fn get_outbox_page(&self, limit: usize) -> Result<Vec<OutboxItem>, AppError> {
        let rows = sqlx::query(
            "SELECT id, iri, object_type, payload, created_at FROM ap_outbox ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let object_type: String = row.try_get("object_type")?;
            items.push(OutboxItem {
                id: row.try_get("id")?,
                iri: row.try_get("iri")?,
                object_type: ApObjectType::parse(&object_type).ok_or_else(|| {
                    AppError::Corrupt(format!("unknown outbox object type: {}", object_type))
                })?,
                payload: row.try_get("payload")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            });
        }

        Ok(items)
    }

    /// Count outbox items.
    pub async fn count_outbox_items(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ap_outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Run arbitrary SQL against the pool, for tests that need to damage
    /// the schema and observe how callers degrade.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), AppError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}
