//! SQLite-backed credential store.
//!
//! Privileged access to the `storage_connections` table: every read and
//! write of a connection goes through here, bypassing any per-user row
//! policy an outer layer may apply.

use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use untitledone_common::{ConnectionStatus, Error, ProviderKind, Result, UserId};

use crate::connection::{ConnectionSummary, NewConnection, StorageConnection, TokenUpdate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage_connections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    provider_account_id TEXT NOT NULL,
    provider_account_name TEXT,
    encrypted_access_token TEXT NOT NULL,
    encrypted_refresh_token TEXT,
    encryption_key_version TEXT NOT NULL,
    token_expires_at TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    connected_at TEXT NOT NULL,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, provider)
);

CREATE INDEX IF NOT EXISTS idx_storage_connections_key_version
    ON storage_connections(encryption_key_version);
"#;

const COLUMNS: &str = "id, user_id, provider, provider_account_id, provider_account_name, \
    encrypted_access_token, encrypted_refresh_token, encryption_key_version, \
    token_expires_at, status, connected_at, last_used_at, created_at, updated_at";

/// Persistent store for `StorageConnection` records.
///
/// # Thread Safety
/// The SQLite connection sits behind an async mutex; each method is a
/// single statement, so every update is atomic on its own.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Create or open a credential database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        info!("Credential store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Create or replace the connection for `(user_id, provider)`.
    ///
    /// Replacing resets the status to active and the connection time to now.
    pub async fn upsert_connection(&self, new: &NewConnection) -> Result<StorageConnection> {
        if !new.provider.is_external() {
            return Err(Error::InvalidInput(format!(
                "{} does not store credentials",
                new.provider
            )));
        }

        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO storage_connections (
                id, user_id, provider, provider_account_id, provider_account_name,
                encrypted_access_token, encrypted_refresh_token, encryption_key_version,
                token_expires_at, status, connected_at, last_used_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10, NULL, ?10, ?10)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                provider_account_id = excluded.provider_account_id,
                provider_account_name = excluded.provider_account_name,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                encryption_key_version = excluded.encryption_key_version,
                token_expires_at = excluded.token_expires_at,
                status = 'active',
                connected_at = excluded.connected_at,
                updated_at = excluded.updated_at
            "#,
            params![
                Uuid::new_v4().to_string(),
                new.user_id.as_str(),
                new.provider.as_str(),
                new.provider_account_id,
                new.provider_account_name,
                new.encrypted_access_token,
                new.encrypted_refresh_token,
                new.encryption_key_version,
                new.token_expires_at.map(|t| t.to_rfc3339()),
                now,
            ],
        )
        .map_err(db_err)?;

        debug!(
            user_id = %new.user_id,
            provider = new.provider.as_str(),
            "Stored connection"
        );

        select_one(&conn, &new.user_id, new.provider)?
            .ok_or_else(|| Error::CredentialStore("connection vanished after upsert".to_string()))
    }

    /// Fetch the connection for `(user_id, provider)`.
    pub async fn get_connection(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
    ) -> Result<Option<StorageConnection>> {
        let conn = self.conn.lock().await;
        select_one(&conn, user_id, provider)
    }

    /// Persist refreshed tokens and mark the connection active, in one update.
    ///
    /// Returns false if the connection no longer exists.
    pub async fn update_tokens(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
        update: &TokenUpdate,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                r#"
                UPDATE storage_connections SET
                    encrypted_access_token = ?3,
                    encrypted_refresh_token = ?4,
                    encryption_key_version = ?5,
                    token_expires_at = ?6,
                    status = 'active',
                    updated_at = ?7
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![
                    user_id.as_str(),
                    provider.as_str(),
                    update.encrypted_access_token,
                    update.encrypted_refresh_token,
                    update.encryption_key_version,
                    update.token_expires_at.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Set the connection status.
    pub async fn mark_status(
        &self,
        user_id: &UserId,
        provider: ProviderKind,
        status: ConnectionStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE storage_connections SET status = ?3, updated_at = ?4 \
                 WHERE user_id = ?1 AND provider = ?2",
                params![
                    user_id.as_str(),
                    provider.as_str(),
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Record a successful use of the connection.
    pub async fn touch_last_used(&self, user_id: &UserId, provider: ProviderKind) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE storage_connections SET last_used_at = ?3 \
                 WHERE user_id = ?1 AND provider = ?2",
                params![user_id.as_str(), provider.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Remove the connection when the user disconnects the provider.
    pub async fn delete_connection(&self, user_id: &UserId, provider: ProviderKind) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM storage_connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id.as_str(), provider.as_str()],
            )
            .map_err(db_err)?;

        if changed > 0 {
            info!(user_id = %user_id, provider = provider.as_str(), "Connection removed");
        }
        Ok(changed > 0)
    }

    /// All of a user's connections, without token material.
    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<ConnectionSummary>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM storage_connections WHERE user_id = ?1 ORDER BY provider",
                COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map([user_id.as_str()], read_row)
            .map_err(db_err)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(db_err)?.summary());
        }
        Ok(summaries)
    }

    /// Connections whose tokens are sealed under any version other than `version`.
    pub async fn list_stale_versions(&self, version: &str) -> Result<Vec<StorageConnection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM storage_connections WHERE encryption_key_version != ?1 \
                 ORDER BY created_at, id",
                COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt.query_map([version], read_row).map_err(db_err)?;

        let mut connections = Vec::new();
        for row in rows {
            connections.push(row.map_err(db_err)?);
        }
        Ok(connections)
    }

    /// Replace the sealed tokens of one connection after re-encryption.
    ///
    /// `snapshot` is the row as it was read for rotation. The write only
    /// applies while the stored version and both ciphertexts still match it,
    /// so tokens refreshed mid-rotation are never overwritten. Returns
    /// whether the row was updated.
    pub async fn update_encryption(
        &self,
        snapshot: &StorageConnection,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        new_version: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                r#"
                UPDATE storage_connections SET
                    encrypted_access_token = ?5,
                    encrypted_refresh_token = ?6,
                    encryption_key_version = ?7,
                    updated_at = ?8
                WHERE id = ?1
                  AND encryption_key_version = ?2
                  AND encrypted_access_token = ?3
                  AND encrypted_refresh_token IS ?4
                "#,
                params![
                    snapshot.id,
                    snapshot.encryption_key_version,
                    snapshot.encrypted_access_token,
                    snapshot.encrypted_refresh_token,
                    encrypted_access_token,
                    encrypted_refresh_token,
                    new_version,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

fn select_one(
    conn: &Connection,
    user_id: &UserId,
    provider: ProviderKind,
) -> Result<Option<StorageConnection>> {
    let sql = format!(
        "SELECT {} FROM storage_connections WHERE user_id = ?1 AND provider = ?2",
        COLUMNS
    );
    conn.query_row(&sql, params![user_id.as_str(), provider.as_str()], read_row)
        .optional()
        .map_err(db_err)
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StorageConnection> {
    let expires_at: Option<String> = row.get(8)?;
    let last_used_at: Option<String> = row.get(11)?;

    Ok(StorageConnection {
        id: row.get(0)?,
        user_id: UserId::new(row.get::<_, String>(1)?).map_err(|e| conversion(1, e))?,
        provider: row
            .get::<_, String>(2)?
            .parse()
            .map_err(|e| conversion(2, e))?,
        provider_account_id: row.get(3)?,
        provider_account_name: row.get(4)?,
        encrypted_access_token: row.get(5)?,
        encrypted_refresh_token: row.get(6)?,
        encryption_key_version: row.get(7)?,
        token_expires_at: expires_at
            .as_deref()
            .map(parse_time)
            .transpose()
            .map_err(|e| conversion(8, e))?,
        status: row
            .get::<_, String>(9)?
            .parse()
            .map_err(|e| conversion(9, e))?,
        connected_at: parse_time(&row.get::<_, String>(10)?).map_err(|e| conversion(10, e))?,
        last_used_at: last_used_at
            .as_deref()
            .map(parse_time)
            .transpose()
            .map_err(|e| conversion(11, e))?,
        created_at: parse_time(&row.get::<_, String>(12)?).map_err(|e| conversion(12, e))?,
        updated_at: parse_time(&row.get::<_, String>(13)?).map_err(|e| conversion(13, e))?,
    })
}

fn conversion(column: usize, err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::CredentialStore(format!("invalid timestamp '{}': {}", value, e)))
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::CredentialStore(err.to_string())
}
