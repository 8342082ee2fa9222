//! Login database access
//!
//! The login handler needs a very small query surface over the
//! homeserver's database: user + password-hash lookup, third-party
//! identifier lookup, and transactional insertion of a token pair. The
//! surface is a trait so tests can substitute an in-memory double.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Queries needed to log in a user.
pub trait LoginDatabase: Send + Sync {
    /// Case-insensitive lookup of a user, returning the canonical-case
    /// stored user id together with the bcrypt password hash. Missing
    /// rows and NULL columns are errors.
    fn canonical_user_id_and_password_hash(&self, user_id: &str) -> Result<(String, String)>;

    /// Resolve a third-party identifier (medium, address) to a user id.
    fn matrix_id_for_3pid(&self, medium: &str, address: &str) -> Result<String>;

    /// Insert an access/refresh token pair in a single transaction,
    /// rolled back if either insert fails.
    fn insert_tokens(&self, user_id: &str, access_token: &str, refresh_token: &str) -> Result<()>;
}

/// SQLite-backed implementation of [`LoginDatabase`].
///
/// Token row ids are drawn from two process-local counters initialised
/// from the minimum id already present in each table, so every id this
/// proxy writes is strictly negative and strictly below anything written
/// before it (the homeserver itself uses positive ids). Running more
/// than one proxy instance against the same database is not supported:
/// the counters live in this process only.
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    next_access_token_id: AtomicI64,
    next_refresh_token_id: AtomicI64,
}

impl SqliteDatabase {
    /// Open the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open database")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        create_schema(&conn)?;

        let access_min = min_token_id(&conn, "access_tokens")?;
        let refresh_min = min_token_id(&conn, "refresh_tokens")?;
        info!(
            access_min,
            refresh_min, "Initial minimum token ids loaded from database"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            // Ids below zero stay below every id observed so far, even
            // when the existing rows are all positive.
            next_access_token_id: AtomicI64::new(access_min.min(0)),
            next_refresh_token_id: AtomicI64::new(refresh_min.min(0)),
        })
    }
}

impl LoginDatabase for SqliteDatabase {
    fn canonical_user_id_and_password_hash(&self, user_id: &str) -> Result<(String, String)> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        let (canonical_id, hash): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT name, password_hash FROM users WHERE lower(name) = lower(?1)",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .with_context(|| format!("no user row for {:?}", user_id))?;

        let canonical_id =
            canonical_id.with_context(|| format!("canonical id for {:?} was null", user_id))?;
        let hash = hash.with_context(|| format!("password hash for {:?} was null", user_id))?;

        Ok((canonical_id, hash))
    }

    fn matrix_id_for_3pid(&self, medium: &str, address: &str) -> Result<String> {
        let conn = self.conn.lock().expect("database mutex poisoned");
        conn.query_row(
            "SELECT user_id FROM user_threepids WHERE medium = ?1 AND address = ?2",
            params![medium, address],
            |row| row.get(0),
        )
        .optional()?
        .with_context(|| format!("no user for 3PID {} {}", medium, address))
    }

    fn insert_tokens(&self, user_id: &str, access_token: &str, refresh_token: &str) -> Result<()> {
        let access_token_id = self.next_access_token_id.fetch_sub(1, Ordering::SeqCst) - 1;
        let refresh_token_id = self.next_refresh_token_id.fetch_sub(1, Ordering::SeqCst) - 1;

        let mut conn = self.conn.lock().expect("database mutex poisoned");
        let txn = conn.transaction()?;
        txn.execute(
            "INSERT INTO access_tokens (id, user_id, token) VALUES (?1, ?2, ?3)",
            params![access_token_id, user_id, access_token],
        )?;
        txn.execute(
            "INSERT INTO refresh_tokens (id, user_id, token) VALUES (?1, ?2, ?3)",
            params![refresh_token_id, user_id, refresh_token],
        )?;
        txn.commit()?;
        Ok(())
    }
}

/// The subset of the homeserver schema the login path touches. Created
/// if absent so the proxy also works against a fresh database.
fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            name TEXT PRIMARY KEY,
            password_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS access_tokens (
            id INTEGER PRIMARY KEY,
            user_id TEXT NOT NULL,
            token TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            id INTEGER PRIMARY KEY,
            user_id TEXT NOT NULL,
            token TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_threepids (
            medium TEXT NOT NULL,
            address TEXT NOT NULL,
            user_id TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn min_token_id(conn: &Connection, table: &str) -> Result<i64> {
    let min: Option<i64> = conn.query_row(
        &format!("SELECT min(id) FROM {}", table),
        [],
        |row| row.get(0),
    )?;
    Ok(min.unwrap_or(0))
}
