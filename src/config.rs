//! Service configuration
//!
//! Defaults cover a local run; an optional `escrow.toml` and
//! `ESCROW_`-prefixed environment variables layer on top.

use serde::Deserialize;

use crate::EscrowResult;
use crate::money::Currency;

/// External processor endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Base URL of the processor API
    pub base_url: String,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Ledger currency; a single-currency system
    pub currency: Currency,
    /// Platform fee in basis points, charged on top of each funding
    pub fee_bps: u32,
    /// Commit retries on optimistic-concurrency conflicts
    pub max_commit_retries: u32,
    /// How long completed idempotency keys stay replayable before eviction
    pub replay_ttl_secs: u64,
    /// Bind address for the HTTP surface
    pub bind_addr: String,
    pub processor: ProcessorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            currency: Currency::Usd,
            fee_bps: 500, // 5%
            max_commit_retries: 3,
            replay_ttl_secs: 86_400, // one day
            bind_addr: "127.0.0.1:8080".to_string(),
            processor: ProcessorConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: defaults, then `escrow.toml` if present, then
    /// `ESCROW_*` environment variables (e.g. `ESCROW_FEE_BPS=250`,
    /// `ESCROW_PROCESSOR__BASE_URL=...`).
    pub fn load() -> EscrowResult<Self> {
        let defaults = Self::default();
        let settings = config::Config::builder()
            .set_default("currency", defaults.currency.as_str())?
            .set_default("fee_bps", i64::from(defaults.fee_bps))?
            .set_default("max_commit_retries", i64::from(defaults.max_commit_retries))?
            .set_default("replay_ttl_secs", defaults.replay_ttl_secs as i64)?
            .set_default("bind_addr", defaults.bind_addr.clone())?
            .set_default("processor.base_url", defaults.processor.base_url.clone())?
            .set_default("processor.timeout_secs", defaults.processor.timeout_secs as i64)?
            .add_source(config::File::with_name("escrow").required(false))
            .add_source(config::Environment::with_prefix("ESCROW").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
