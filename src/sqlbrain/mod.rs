//! SQLite Tuple Store
//!
//! `SqlBrain` is a brain backed by a single SQLite database:
//!
//! - **schema**: tables and statement text for a fixed order
//! - **learn**: transactional commit of one message's tuples
//! - **speak**: prompt selection, weighted suffix choice, chain walking
//! - **forget**: provenance-exact deletion
//!
//! # Concurrency
//!
//! Connections come from an r2d2 pool with WAL journaling, so readers run
//! alongside a writer and unrelated tags never wait on an application lock.
//! Each call runs on tokio's blocking pool and watches a cancellation token.
//! On cancellation the running statement is interrupted and any open
//! transaction rolls back when its handle drops.
//!
//! # Example
//!
//! ```rust,no_run
//! use chatterbrain::brain::{self, MessageMeta, UserHash};
//! use chatterbrain::sqlbrain::{SqlBrain, SqlBrainConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel = CancellationToken::new();
//!     let br = SqlBrain::create(SqlBrainConfig::new("brain.db"), 2).await?;
//!
//!     let meta = MessageMeta::new(uuid::Uuid::new_v4(), UserHash::default(), "kessoku", chrono::Utc::now());
//!     brain::learn(&br, &cancel, &meta, "the cat sat on the mat").await?;
//!
//!     let msg = brain::speak(&br, &cancel, "kessoku", "").await?;
//!     println!("{}", msg);
//!     Ok(())
//! }
//! ```

mod forget;
mod learn;
pub mod schema;
mod speak;

pub use speak::choose_weighted;

use crate::brain::{BrainError, BrainResult};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};
use schema::Statements;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Default cap on generated message length, in characters
pub const DEFAULT_MAX_SPEAK_LEN: usize = 500;

/// Configuration for a SQLite brain
#[derive(Debug, Clone)]
pub struct SqlBrainConfig {
    /// Database file
    pub path: PathBuf,
    /// Maximum pooled connections (default: 8)
    pub pool_size: u32,
    /// How long a writer waits on a locked database (default: 5000 ms)
    pub busy_timeout_ms: u32,
    /// Generation stops once the message reaches this many characters
    pub max_speak_len: usize,
}

impl Default for SqlBrainConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("brain.db"),
            pool_size: 8,
            busy_timeout_ms: 5000,
            max_speak_len: DEFAULT_MAX_SPEAK_LEN,
        }
    }
}

impl SqlBrainConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Pragmas applied to every pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

/// A brain stored in SQLite
#[derive(Clone)]
pub struct SqlBrain {
    pool: ConnectionPool,
    stmts: Arc<Statements>,
    max_speak_len: usize,
}

impl std::fmt::Debug for SqlBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBrain")
            .field("order", &self.stmts.order)
            .field("max_speak_len", &self.max_speak_len)
            .finish()
    }
}

impl SqlBrain {
    /// Initialize a new store with a fixed order and open it.
    ///
    /// Fails with `InvalidArgument` for a non-positive order and with a store
    /// error if the database already holds a brain.
    pub async fn create(config: SqlBrainConfig, order: i64) -> BrainResult<Self> {
        if order <= 0 {
            return Err(BrainError::InvalidArgument(format!(
                "order must be positive, got {}",
                order
            )));
        }
        let pool = Self::build_pool(&config)?;
        let ddl = schema::create_sql(order as usize);
        let p = pool.clone();
        tokio::task::spawn_blocking(move || -> BrainResult<()> {
            let mut conn = p.get()?;
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(|e| BrainError::store("begin create", e))?;
            tx.execute_batch(&ddl)
                .map_err(|e| BrainError::store("create schema", e))?;
            tx.execute(
                "INSERT INTO config (option, value) VALUES ('order', ?1)",
                params![order],
            )
            .map_err(|e| BrainError::store("record order", e))?;
            tx.commit().map_err(|e| BrainError::store("commit create", e))
        })
        .await??;

        tracing::info!(path = ?config.path, order, "Created brain");
        Ok(Self::from_parts(pool, order as usize, &config))
    }

    /// Open an existing store, reading its order.
    pub async fn open(config: SqlBrainConfig) -> BrainResult<Self> {
        let pool = Self::build_pool(&config)?;
        let p = pool.clone();
        let order = tokio::task::spawn_blocking(move || -> BrainResult<i64> {
            let conn = p.get()?;
            let order: Option<i64> = conn
                .query_row(
                    "SELECT value FROM config WHERE option = 'order'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| BrainError::store("read order", e))?;
            order.ok_or_else(|| {
                BrainError::InvalidArgument("database has no recorded order".to_string())
            })
        })
        .await??;
        if order <= 0 {
            return Err(BrainError::InvalidArgument(format!(
                "database records invalid order {}",
                order
            )));
        }

        tracing::info!(path = ?config.path, order, "Opened brain");
        Ok(Self::from_parts(pool, order as usize, &config))
    }

    fn build_pool(config: &SqlBrainConfig) -> BrainResult<ConnectionPool> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BrainError::InvalidArgument(format!(
                        "cannot create directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }
        let manager = SqliteConnectionManager::file(&config.path);
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;
        Ok(pool)
    }

    fn from_parts(pool: ConnectionPool, order: usize, config: &SqlBrainConfig) -> Self {
        Self {
            pool,
            stmts: Arc::new(Statements::new(order)),
            max_speak_len: config.max_speak_len,
        }
    }

    /// Length of tuple prefixes
    pub fn order(&self) -> usize {
        self.stmts.order
    }

    /// Run `f` with a pooled connection on the blocking pool.
    ///
    /// If `cancel` fires first, the connection's current statement is
    /// interrupted and the result of `f` is awaited; `f` is expected to check
    /// the token before committing.
    async fn run<T, F>(&self, cancel: &CancellationToken, f: F) -> BrainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Statements, &CancellationToken) -> BrainResult<T>
            + Send
            + 'static,
    {
        if cancel.is_cancelled() {
            return Err(BrainError::Cancelled);
        }
        let pool = self.pool.clone();
        let stmts = Arc::clone(&self.stmts);
        let token = cancel.clone();
        let slot = Arc::new(InterruptSlot::default());
        let task_slot = Arc::clone(&slot);
        let mut task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            task_slot.arm(conn.get_interrupt_handle());
            let r = f(&mut *conn, &*stmts, &token);
            // Disarm before the connection goes back to the pool.
            task_slot.disarm();
            r
        });

        tokio::select! {
            r = &mut task => r?,
            _ = cancel.cancelled() => {
                slot.interrupt();
                task.await?
            }
        }
    }

    /// Count rows for a summary of the store's contents.
    pub async fn stats(&self, cancel: &CancellationToken) -> BrainResult<BrainStats> {
        self.run(cancel, |conn, stmts, _| {
            let q = |sql: &str| -> BrainResult<i64> {
                conn.query_row(sql, [], |row| row.get(0))
                    .map_err(|e| BrainError::store("stats", e))
            };
            Ok(BrainStats {
                order: stmts.order,
                chains: q("SELECT COUNT(*) FROM chains")? as u64,
                weight: q("SELECT COALESCE(SUM(weight), 0) FROM chains")? as u64,
                messages: q("SELECT COUNT(*) FROM messages WHERE deleted IS NULL")? as u64,
                forgotten: q("SELECT COUNT(*) FROM messages WHERE deleted IS NOT NULL")? as u64,
            })
        })
        .await
    }
}

/// Interrupt handle for the connection a blocking task is using.
#[derive(Default)]
struct InterruptSlot(Mutex<Option<InterruptHandle>>);

impl InterruptSlot {
    fn arm(&self, h: InterruptHandle) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(h);
        }
    }

    fn disarm(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    fn interrupt(&self) {
        if let Ok(slot) = self.0.lock() {
            if let Some(h) = slot.as_ref() {
                h.interrupt();
            }
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BrainStats {
    pub order: usize,
    /// Distinct (tag, prefix, suffix) rows
    pub chains: u64,
    /// Total multiplicity over all chains
    pub weight: u64,
    /// Messages currently learned
    pub messages: u64,
    /// Messages that have been forgotten
    pub forgotten: u64,
}

impl std::fmt::Display for BrainStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Order: {}, Chains: {}, Weight: {}, Messages: {}, Forgotten: {}",
            self.order, self.chains, self.weight, self.messages, self.forgotten
        )
    }
}
