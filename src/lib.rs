//! # Chatterbrain
//!
//! A Markov chain brain for chat bots: it learns word sequences from chat
//! messages, generates new messages from them, and forgets precisely what it
//! was taught when asked.
//!
//! ## Features
//!
//! - **Tagged brains**: every message is learned under a tag, and generation
//!   only ever draws from one tag
//! - **Weighted generation**: suffixes are chosen in proportion to how often
//!   they were seen
//! - **Exact forgetting**: each learned tuple remembers the message that taught
//!   it, so a message, a time range, or a user can be unlearned
//! - **Concurrency**: pooled SQLite connections in WAL mode; every operation is
//!   cancellable and atomic
//!
//! ## Modules
//!
//! - [`brain`]: Tokenizer, tuples, and the learner/speaker/forgetter contracts
//! - [`sqlbrain`]: SQLite tuple store implementing them
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatterbrain::brain::{self, Forgetter, MessageMeta, UserHasher};
//! use chatterbrain::sqlbrain::{SqlBrain, SqlBrainConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel = CancellationToken::new();
//!     let br = SqlBrain::create(SqlBrainConfig::new("brain.db"), 2).await?;
//!     let hasher = UserHasher::new("secret");
//!
//!     // Learn a message
//!     let now = chrono::Utc::now();
//!     let meta = MessageMeta::new(uuid::Uuid::new_v4(), hasher.hash("bocchi", "#kessoku", now), "#kessoku", now);
//!     brain::learn(&br, &cancel, &meta, "I would like a cup of tea").await?;
//!
//!     // Speak, optionally continuing a prompt
//!     println!("{}", brain::speak(&br, &cancel, "#kessoku", "would").await?);
//!
//!     // Forget it again
//!     br.forget_message(&cancel, meta.id).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod brain;
pub mod config;
pub mod sqlbrain;

// Re-export top-level types for convenience
pub use brain::{
    tokens, tuples_of, BrainError, BrainResult, Forgetter, Learner, MessageMeta, Speaker, Tuple,
    UserHash, UserHasher,
};

pub use sqlbrain::{BrainStats, SqlBrain, SqlBrainConfig};

pub use config::{BrainConfig, Config, ConfigError, LogFormat, LoggingConfig, UserHashConfig};
