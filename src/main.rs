//! Chatterbrain CLI
//!
//! Command-line interface for a brain database:
//! - Create a brain
//! - Learn messages
//! - Speak
//! - Forget messages, time ranges, users, or text
//! - Show statistics

use anyhow::{bail, Context};
use chatterbrain::brain::{self, tokens, tuples_of, Forgetter, MessageMeta, UserHasher};
use chatterbrain::config::{self, Config, LogFormat};
use chatterbrain::sqlbrain::SqlBrain;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chatterbrain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Markov chain brain for chat bots")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Brain database, overriding the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new brain
    Init {
        /// Prefix length (default: from config)
        #[arg(short, long)]
        order: Option<i64>,
    },

    /// Learn a message. Without text, learns each line of stdin.
    Learn {
        /// Tag to learn under
        tag: String,
        /// Sender's user ID
        #[arg(short, long, default_value = "")]
        user: String,
        /// Where the message was sent
        #[arg(short, long, default_value = "")]
        location: String,
        /// Message ID (default: random)
        #[arg(long)]
        id: Option<Uuid>,
        text: Vec<String>,
    },

    /// Generate a message
    Speak {
        /// Tag to speak from
        tag: String,
        /// Prompt to continue from
        prompt: Vec<String>,
    },

    /// Forget learned messages
    Forget {
        #[command(subcommand)]
        what: ForgetCommand,
    },

    /// Show brain statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ForgetCommand {
    /// Forget one message by ID
    Message { id: Uuid },

    /// Forget everything learned in a tag over a time range
    During {
        tag: String,
        /// Start, inclusive. Supports: "now", RFC 3339, Unix millis, or an age like 15m, 2h, 7d
        since: String,
        /// End, exclusive (default: now)
        #[arg(default_value = "now")]
        before: String,
    },

    /// Forget everything a user has sent since a time
    User {
        user: String,
        #[arg(short, long, default_value = "")]
        location: String,
        since: String,
    },

    /// Forget one occurrence of each tuple of a text
    Text { tag: String, text: Vec<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(db) = &cli.db {
        config.brain.path = db.to_string_lossy().to_string();
    }
    init_logging(&config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Init { order } => {
            let order = order.unwrap_or(config.brain.order);
            let br = SqlBrain::create(config.brain.to_store_config(), order)
                .await
                .with_context(|| format!("creating brain at {:?}", config.brain.db_path()))?;
            println!(
                "Created brain of order {} at {:?}",
                br.order(),
                config.brain.db_path()
            );
        }

        Commands::Learn {
            tag,
            user,
            location,
            id,
            text,
        } => {
            let br = open(&config).await?;
            let hasher = UserHasher::new(config.userhash.secret.as_bytes());
            let lines: Vec<String> = if text.is_empty() {
                std::io::stdin().lock().lines().collect::<Result<_, _>>()?
            } else {
                vec![text.join(" ")]
            };
            if id.is_some() && lines.len() > 1 {
                bail!("--id applies to a single message");
            }

            let mut learned = 0usize;
            for line in lines.iter().filter(|l| !l.trim().is_empty()) {
                let now = Utc::now();
                let meta = MessageMeta::new(
                    id.unwrap_or_else(Uuid::new_v4),
                    hasher.hash(&user, &location, now),
                    &tag,
                    now,
                );
                brain::learn(&br, &cancel, &meta, line).await?;
                if lines.len() == 1 {
                    println!("{}", meta.id);
                }
                learned += 1;
            }
            tracing::info!(tag = %tag, learned, "Learned messages");
        }

        Commands::Speak { tag, prompt } => {
            let br = open(&config).await?;
            let msg = brain::speak(&br, &cancel, &tag, &prompt.join(" ")).await?;
            println!("{}", msg);
        }

        Commands::Forget { what } => {
            let br = open(&config).await?;
            let removed = match what {
                ForgetCommand::Message { id } => br.forget_message(&cancel, id).await?,
                ForgetCommand::During { tag, since, before } => {
                    let now = Utc::now();
                    let since = parse_time(&since, now)?;
                    let before = parse_time(&before, now)?;
                    br.forget_during(&cancel, &tag, since, before).await?
                }
                ForgetCommand::User {
                    user,
                    location,
                    since,
                } => {
                    let now = Utc::now();
                    let since = parse_time(&since, now)?;
                    let hasher = UserHasher::new(config.userhash.secret.as_bytes());
                    // A user's messages hash differently in every time bucket.
                    let buckets = br.message_buckets_since(&cancel, since).await?;
                    let users: Vec<_> = buckets
                        .into_iter()
                        .map(|t| hasher.hash(&user, &location, t))
                        .collect();
                    br.forget_users_since(&cancel, &users, since).await?
                }
                ForgetCommand::Text { tag, text } => {
                    let toks = tokens(&text.join(" "));
                    if toks.is_empty() {
                        bail!("nothing to forget");
                    }
                    let tuples = tuples_of(br.order(), &toks)?;
                    br.forget_tuples(&cancel, &tag, &tuples).await?
                }
            };
            println!("Forgot {} tuples", removed);
        }

        Commands::Stats { json } => {
            let br = open(&config).await?;
            let stats = br.stats(&cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", stats);
            }
        }

        Commands::Config { output } => {
            let content = config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &content)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", content);
                }
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chatterbrain={}", config.logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match config.logging.log_format() {
        LogFormat::Json => registry.with(layer.json()).init(),
        LogFormat::Compact => registry.with(layer.compact()).init(),
        LogFormat::Pretty => registry.with(layer.pretty()).init(),
    }
}

async fn open(config: &Config) -> anyhow::Result<SqlBrain> {
    SqlBrain::open(config.brain.to_store_config())
        .await
        .with_context(|| {
            format!(
                "opening brain at {:?} (create one with `chatterbrain init`)",
                config.brain.db_path()
            )
        })
}

/// Parse an absolute time or an age relative to `now`.
fn parse_time(s: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ms) = s.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_millis(ms)
            .with_context(|| format!("timestamp out of range: {}", s));
    }
    Ok(now - parse_age(s)?)
}

fn parse_age(s: &str) -> anyhow::Result<Duration> {
    let s = s.to_lowercase();
    let age = if let Some(n) = s.strip_suffix('s') {
        Duration::seconds(n.parse()?)
    } else if let Some(n) = s.strip_suffix('m') {
        Duration::minutes(n.parse()?)
    } else if let Some(n) = s.strip_suffix('h') {
        Duration::hours(n.parse()?)
    } else if let Some(n) = s.strip_suffix('d') {
        Duration::days(n.parse()?)
    } else if let Some(n) = s.strip_suffix('w') {
        Duration::weeks(n.parse()?)
    } else {
        bail!("Invalid time: {}. Use: now, RFC 3339, Unix millis, or 15m, 2h, 7d", s);
    };
    Ok(age)
}
