//! SQLite database operations
//!
//! All database access goes through this module.
//! Writes that may race across inbox workers are upserts.

use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::{AppError, FederationError};

/// Map a unique violation on `remote_actors` to a permanent actor error
///
/// A second URI claiming a stored handle or key id can never be stored, so
/// the failure must not look like a transient database fault.
fn actor_conflict(uri: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Federation(FederationError::InvalidActor(format!(
                "{} collides with a stored actor: {}",
                uri,
                db.message()
            )))
        }
        other => AppError::Database(other),
    }
}

/// Which notes an outbox page draws from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxScope {
    /// One user's notes visible to remote servers (public and home)
    User(String),
    /// Every public note that originated on this server
    LocalPublic,
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to database
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

        Ok(Self { pool })
    }

    // =========================================================================
    // Local users
    // =========================================================================

    /// Insert a local user
    pub async fn insert_user(&self, user: &LocalUser) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                id, username, username_lower, name, summary, is_bot, is_locked,
                is_deleted, is_suspended, no_federation, notes_count, public_key_pem, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.username_lower)
        .bind(&user.name)
        .bind(&user.summary)
        .bind(user.is_bot)
        .bind(user.is_locked)
        .bind(user.is_deleted)
        .bind(user.is_suspended)
        .bind(user.no_federation)
        .bind(user.notes_count)
        .bind(&user.public_key_pem)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a local user by ID
    pub async fn get_user(&self, id: &str) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Get a local user by lowercase username
    pub async fn get_user_by_username(
        &self,
        username_lower: &str,
    ) -> Result<Option<LocalUser>, AppError> {
        let user = sqlx::query_as::<_, LocalUser>("SELECT * FROM users WHERE username_lower = ?")
            .bind(username_lower)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    // =========================================================================
    // Remote actors
    // =========================================================================

    /// Find a remote actor by (lowercase username, host)
    pub async fn find_remote_actor_by_handle(
        &self,
        username_lower: &str,
        host: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors WHERE username_lower = ? AND host = ?",
        )
        .bind(username_lower)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Find a remote actor by the id of its public key
    pub async fn find_remote_actor_by_key_id(
        &self,
        public_key_id: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors WHERE public_key_id = ?",
        )
        .bind(public_key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// Find a remote actor by its canonical URI
    pub async fn find_remote_actor_by_uri(
        &self,
        uri: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Find a remote actor by local ID
    pub async fn get_remote_actor(&self, id: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Create a remote actor, or return the row another worker created first
    ///
    /// Keyed by `uri`. Key material of an existing row is left untouched.
    pub async fn upsert_remote_actor(&self, actor: &RemoteActor) -> Result<RemoteActor, AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_actors (
                id, uri, username, username_lower, host, inbox, shared_inbox,
                public_key_id, public_key_pem, last_communicated_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO NOTHING
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.username_lower)
        .bind(&actor.host)
        .bind(&actor.inbox)
        .bind(&actor.shared_inbox)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(actor.last_communicated_at)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await
        .map_err(actor_conflict(&actor.uri))?;

        self.find_remote_actor_by_uri(&actor.uri)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Refresh the non-key profile fields of a remote actor
    pub async fn update_remote_actor_profile(
        &self,
        uri: &str,
        username: &str,
        inbox: &str,
        shared_inbox: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE remote_actors
            SET username = ?, username_lower = ?, inbox = ?, shared_inbox = ?
            WHERE uri = ?
            "#,
        )
        .bind(username)
        .bind(username.to_lowercase())
        .bind(inbox)
        .bind(shared_inbox)
        .bind(uri)
        .execute(&self.pool)
        .await
        .map_err(actor_conflict(uri))?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Insert a note authored on this server and bump the author's count
    pub async fn insert_local_note(&self, note: &Note) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        insert_note_query(note).execute(&mut *tx).await?;
        sqlx::query("UPDATE users SET notes_count = notes_count + 1 WHERE id = ?")
            .bind(&note.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Insert a remote note unless one with the same URI already exists
    ///
    /// # Returns
    /// The stored row for `note.uri`
    pub async fn upsert_remote_note(&self, note: &Note) -> Result<Note, AppError> {
        let uri = note
            .uri
            .as_deref()
            .ok_or_else(|| AppError::Validation("Remote note without uri".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO notes (
                id, user_id, user_host, uri, text, cw, renote_id, reply_id,
                has_poll, file_count, visibility, local_only, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO NOTHING
            "#,
        )
        .bind(&note.id)
        .bind(&note.user_id)
        .bind(&note.user_host)
        .bind(uri)
        .bind(&note.text)
        .bind(&note.cw)
        .bind(&note.renote_id)
        .bind(&note.reply_id)
        .bind(note.has_poll)
        .bind(note.file_count)
        .bind(&note.visibility)
        .bind(note.local_only)
        .bind(note.created_at)
        .execute(&self.pool)
        .await?;

        self.get_note_by_uri(uri).await?.ok_or(AppError::NotFound)
    }

    /// Get note by ID
    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Get note by ActivityPub URI
    pub async fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>, AppError> {
        let note = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(note)
    }

    /// Delete a remote note, only when it belongs to `user_id`
    pub async fn delete_note_by_uri(&self, uri: &str, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM notes WHERE uri = ? AND user_id = ?")
            .bind(uri)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one outbox page
    ///
    /// # Arguments
    /// * `scope` - Whose notes to list
    /// * `since_id` - Walk forward from this id (ascending order)
    /// * `until_id` - Walk backward from this id (descending order)
    /// * `limit` - Page size
    ///
    /// Rows come back in query order; forward pages are ascending.
    pub async fn get_outbox_notes(
        &self,
        scope: &OutboxScope,
        since_id: Option<&str>,
        until_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Note>, AppError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM notes WHERE local_only = 0");

        match scope {
            OutboxScope::User(user_id) => {
                query
                    .push(" AND user_id = ")
                    .push_bind(user_id.clone())
                    .push(" AND visibility IN ('public', 'home')");
            }
            OutboxScope::LocalPublic => {
                query.push(" AND user_host IS NULL AND visibility = 'public'");
            }
        }

        if let Some(since_id) = since_id {
            query.push(" AND id > ").push_bind(since_id.to_string());
            query.push(" ORDER BY id ASC");
        } else {
            if let Some(until_id) = until_id {
                query.push(" AND id < ").push_bind(until_id.to_string());
            }
            query.push(" ORDER BY id DESC");
        }

        query.push(" LIMIT ").push_bind(limit as i64);

        let notes = query.build_query_as::<Note>().fetch_all(&self.pool).await?;
        Ok(notes)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Get the record for a remote host
    pub async fn get_instance(&self, host: &str) -> Result<Option<Instance>, AppError> {
        let instance = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE host = ?")
            .bind(host)
            .fetch_optional(&self.pool)
            .await?;

        Ok(instance)
    }

    /// Create the host record if missing, then apply the given fields
    ///
    /// Each statement is atomic on its own; concurrent telemetry writers may
    /// interleave, which only affects observability fields.
    pub async fn upsert_instance(
        &self,
        host: &str,
        update: &InstanceUpdate,
    ) -> Result<Instance, AppError> {
        sqlx::query("INSERT INTO instances (host, caught_at) VALUES (?, ?) ON CONFLICT(host) DO NOTHING")
            .bind(host)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            UPDATE instances SET
                latest_request_received_at = COALESCE(?, latest_request_received_at),
                last_communicated_at = COALESCE(?, last_communicated_at),
                is_not_responding = COALESCE(?, is_not_responding),
                system = COALESCE(?, system),
                is_blocked = COALESCE(?, is_blocked)
            WHERE host = ?
            "#,
        )
        .bind(update.latest_request_received_at)
        .bind(update.last_communicated_at)
        .bind(update.is_not_responding)
        .bind(&update.system)
        .bind(update.is_blocked)
        .bind(host)
        .execute(&self.pool)
        .await?;

        self.get_instance(host).await?.ok_or(AppError::NotFound)
    }
}

fn insert_note_query(note: &Note) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO notes (
            id, user_id, user_host, uri, text, cw, renote_id, reply_id,
            has_poll, file_count, visibility, local_only, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&note.id)
    .bind(&note.user_id)
    .bind(&note.user_host)
    .bind(&note.uri)
    .bind(&note.text)
    .bind(&note.cw)
    .bind(&note.renote_id)
    .bind(&note.reply_id)
    .bind(note.has_poll)
    .bind(note.file_count)
    .bind(&note.visibility)
    .bind(note.local_only)
    .bind(note.created_at)
}
