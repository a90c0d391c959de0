use orebot_client::{instruction::Discriminators, transaction::DEFAULT_COMPUTE_UNIT_LIMIT};
use orebot_types::{sol_to_lamports, SQUARES};
use serde::{Deserialize, Serialize};
use solana_sdk::{
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair},
};
use std::{fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::Level;
use url::Url;

mod backoff;
pub mod confirm;
pub mod decision;
pub mod engine;
pub mod poller;
pub mod price;
pub mod reconciler;
pub mod state;
pub mod store;

pub use decision::{Decision, Policy, Strategy};
pub use engine::{Engine, EngineConfig};
pub use price::PriceFeed;
pub use store::{JsonStore, MemoryStore, Store, StoreError};

/// Jupiter price API, queried for the ORE and wrapped SOL mints.
pub const DEFAULT_PRICE_API: &str = "https://lite-api.jup.ag/price/v3";

/// How often the price feed is refreshed.
pub const PRICE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Errors surfaced by the betting loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] orebot_client::Error),
    #[error("deploy for round {round_id} landed {slots_late} slots after the round ended")]
    DeadlineMissed { round_id: u64, slots_late: u64 },
    #[error("{consecutive} consecutive failures, connection degraded")]
    ConnectionDegraded { consecutive: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration for the bot (from config file).
///
/// Amounts are in SOL, thresholds are percentages of the amount staked.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub rpc_url: String,
    pub keypair_path: String,
    pub program_id: String,
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub metrics_port: Option<u16>,

    pub bet_amount: f64,
    #[serde(default)]
    pub secondary_bet_amount: Option<f64>,
    #[serde(default)]
    pub ev_threshold: f64,
    /// Defaults to `ev_threshold`.
    #[serde(default)]
    pub early_ev_threshold: Option<f64>,
    #[serde(default = "default_slots_threshold")]
    pub slots_threshold: u64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_max_squares")]
    pub max_squares: usize,
    #[serde(default = "default_lowest_squares_count")]
    pub lowest_squares_count: usize,
    #[serde(default)]
    pub variance_reduction: bool,

    /// ORE price in SOL, used until (or unless) the price feed reports.
    #[serde(default)]
    pub ore_price: f64,
    /// Mint of the bonus token; enables the price feed when set.
    #[serde(default)]
    pub ore_mint: Option<String>,
    #[serde(default = "default_price_api")]
    pub price_api: String,
    #[serde(default = "default_ore_price_multiplier")]
    pub ore_price_multiplier: f64,

    #[serde(default)]
    pub discriminators: Discriminators,
    #[serde(default = "default_compute_unit_limit")]
    pub compute_unit_limit: u32,
}

fn default_data_directory() -> String {
    "data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_threads() -> usize {
    2
}

fn default_slots_threshold() -> u64 {
    10
}

fn default_max_squares() -> usize {
    SQUARES
}

fn default_lowest_squares_count() -> usize {
    5
}

fn default_price_api() -> String {
    DEFAULT_PRICE_API.to_string()
}

fn default_ore_price_multiplier() -> f64 {
    0.85
}

fn default_compute_unit_limit() -> u32 {
    DEFAULT_COMPUTE_UNIT_LIMIT
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: usize },
    #[error("{field} must be a positive amount of SOL (got {value})")]
    InvalidAmount { field: &'static str, value: f64 },
    #[error("{field} must be a finite number (got {value})")]
    InvalidNumber { field: &'static str, value: f64 },
    #[error("{field} must be at most {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: usize,
        max: usize,
    },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("{field} must be a base58 public key: {value}")]
    InvalidPubkey { field: &'static str, value: String },
    #[error("could not read keypair from {path}: {reason}")]
    InvalidKeypair { path: String, reason: String },
}

pub struct ValidatedConfig {
    pub rpc_url: String,
    pub signer: Arc<Keypair>,
    pub program_id: Pubkey,
    pub data_directory: PathBuf,
    pub log_level: Level,
    pub json_logs: bool,
    pub worker_threads: usize,
    pub metrics_port: Option<u16>,
    pub policy: Policy,
    pub ore_price: f64,
    pub price_feed: Option<PriceFeed>,
    pub discriminators: Discriminators,
    pub compute_unit_limit: u32,
}

/// Keep the first and last 10 characters of a URL (API keys usually sit in between).
fn mask_url(url: &str) -> String {
    let chars: Vec<char> = url.chars().collect();
    if chars.len() <= 20 {
        return url.to_string();
    }
    let start: String = chars[..10].iter().collect();
    let end: String = chars[chars.len() - 10..].iter().collect();
    let middle = "*".repeat((chars.len() - 20).max(8));
    format!("{start}{middle}{end}")
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("rpc_url", &mask_url(&cfg.rpc_url))
            .field("keypair_path", &"<redacted>")
            .field("program_id", &cfg.program_id)
            .field("data_directory", &cfg.data_directory)
            .field("log_level", &cfg.log_level)
            .field("json_logs", &cfg.json_logs)
            .field("worker_threads", &cfg.worker_threads)
            .field("metrics_port", &cfg.metrics_port)
            .field("bet_amount", &cfg.bet_amount)
            .field("secondary_bet_amount", &cfg.secondary_bet_amount)
            .field("ev_threshold", &cfg.ev_threshold)
            .field("early_ev_threshold", &cfg.early_ev_threshold)
            .field("slots_threshold", &cfg.slots_threshold)
            .field("strategy", &cfg.strategy)
            .field("skip", &cfg.skip)
            .field("max_squares", &cfg.max_squares)
            .field("lowest_squares_count", &cfg.lowest_squares_count)
            .field("variance_reduction", &cfg.variance_reduction)
            .field("ore_price", &cfg.ore_price)
            .field("ore_mint", &cfg.ore_mint)
            .field("price_api", &cfg.price_api)
            .field("ore_price_multiplier", &cfg.ore_price_multiplier)
            .field("discriminators", &cfg.discriminators)
            .field("compute_unit_limit", &cfg.compute_unit_limit)
            .finish()
    }
}

fn ensure_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn ensure_at_most(field: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

fn ensure_finite(field: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::InvalidNumber { field, value });
    }
    Ok(value)
}

/// SOL amount to whole lamports; must be finite and at least one lamport.
fn lamports(field: &'static str, value: f64) -> Result<u64, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidAmount { field, value });
    }
    match sol_to_lamports(value) {
        0 => Err(ConfigError::InvalidAmount { field, value }),
        lamports => Ok(lamports),
    }
}

fn parse_pubkey(field: &'static str, value: &str) -> Result<Pubkey, ConfigError> {
    Pubkey::from_str(value).map_err(|_| ConfigError::InvalidPubkey {
        field,
        value: value.to_string(),
    })
}

fn validate_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: mask_url(value),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: mask_url(value),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: mask_url(value),
        });
    }
    Ok(())
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn load_signer(&self) -> Result<Keypair, ConfigError> {
        read_keypair_file(&self.keypair_path).map_err(|err| ConfigError::InvalidKeypair {
            path: self.keypair_path.clone(),
            reason: err.to_string(),
        })
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let signer = self.load_signer()?;
        self.validate_with_signer(signer)
    }

    pub fn validate_with_signer(self, signer: Keypair) -> Result<ValidatedConfig, ConfigError> {
        validate_http_url("rpc_url", &self.rpc_url)?;
        let program_id = parse_pubkey("program_id", &self.program_id)?;

        let bet_amount = lamports("bet_amount", self.bet_amount)?;
        let secondary_bet_amount = self
            .secondary_bet_amount
            .map(|amount| lamports("secondary_bet_amount", amount))
            .transpose()?;
        let ev_threshold = ensure_finite("ev_threshold", self.ev_threshold)?;
        let early_ev_threshold = match self.early_ev_threshold {
            Some(threshold) => ensure_finite("early_ev_threshold", threshold)?,
            None => ev_threshold,
        };

        ensure_nonzero("slots_threshold", self.slots_threshold as usize)?;
        ensure_at_most("skip", self.skip, SQUARES - 1)?;
        ensure_nonzero("max_squares", self.max_squares)?;
        ensure_at_most("max_squares", self.max_squares, SQUARES)?;
        ensure_nonzero("lowest_squares_count", self.lowest_squares_count)?;
        ensure_at_most("lowest_squares_count", self.lowest_squares_count, SQUARES)?;
        ensure_nonzero("worker_threads", self.worker_threads)?;
        ensure_nonzero("compute_unit_limit", self.compute_unit_limit as usize)?;

        let ore_price = ensure_finite("ore_price", self.ore_price)?;
        if ore_price < 0.0 {
            return Err(ConfigError::InvalidNumber {
                field: "ore_price",
                value: ore_price,
            });
        }
        let price_feed = match self.ore_mint {
            Some(mint) => {
                let ore_mint = parse_pubkey("ore_mint", &mint)?;
                validate_http_url("price_api", &self.price_api)?;
                let multiplier =
                    ensure_finite("ore_price_multiplier", self.ore_price_multiplier)?;
                Some(PriceFeed {
                    url: self.price_api,
                    ore_mint,
                    multiplier,
                    interval: PRICE_REFRESH_INTERVAL,
                })
            }
            None => None,
        };

        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        Ok(ValidatedConfig {
            rpc_url: self.rpc_url,
            signer: Arc::new(signer),
            program_id,
            data_directory: PathBuf::from(self.data_directory),
            log_level,
            json_logs: self.json_logs,
            worker_threads: self.worker_threads,
            metrics_port: self.metrics_port,
            policy: Policy {
                bet_amount,
                secondary_bet_amount,
                ev_threshold,
                early_ev_threshold,
                slots_threshold: self.slots_threshold,
                strategy: self.strategy,
                skip: self.skip,
                max_squares: self.max_squares,
                lowest_squares_count: self.lowest_squares_count,
                variance_reduction: self.variance_reduction,
            },
            ore_price,
            price_feed,
            discriminators: self.discriminators,
            compute_unit_limit: self.compute_unit_limit,
        })
    }
}
