use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Development fallback, matches what the token issuer uses when unconfigured.
const DEV_JWT_SECRET: &str = "dev-secret";

/// Which replication backend the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    /// NATS core pub/sub plus JetStream key-value buckets.
    Nats,
    /// In-process bus, only consistent within a single process.
    Memory,
}

impl std::str::FromStr for BusBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("nats") {
            Ok(Self::Nats)
        } else if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else {
            bail!("unknown bus backend '{}', expected 'nats' or 'memory'", s)
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub bus_backend: BusBackend,
    pub nats_url: String,
    pub snapshot_bucket: String,
    pub claims_bucket: String,
    pub channel_prefix: String,
    /// How many times a move is re-validated after losing a snapshot race.
    pub move_retry_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) => secret,
            Err(_) => {
                tracing::warn!("JWT_SECRET not set, using development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            jwt_secret,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "tictactoe".to_string()),
            bus_backend: env::var("BUS_BACKEND")
                .unwrap_or_else(|_| "nats".to_string())
                .parse()
                .context("BUS_BACKEND must be 'nats' or 'memory'")?,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            snapshot_bucket: env::var("SNAPSHOT_BUCKET")
                .unwrap_or_else(|_| "ttt-snapshots".to_string()),
            claims_bucket: env::var("CLAIMS_BUCKET").unwrap_or_else(|_| "ttt-claims".to_string()),
            channel_prefix: env::var("CHANNEL_PREFIX").unwrap_or_else(|_| "games".to_string()),
            move_retry_limit: env::var("MOVE_RETRY_LIMIT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("MOVE_RETRY_LIMIT must be a non-negative number")?,
        })
    }
}
