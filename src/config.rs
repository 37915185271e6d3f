//! Configuration management for the round engine
//!
//! Configuration is read from a TOML file, overridden by `ROUNDHOUSE_*`
//! environment variables and validated before anything starts.

use crate::engine::{EngineSettings, GameSettings};
use crate::errors::{ConfigurationError, EngineResult};
use crate::games::outcome::CrashParams;
use crate::games::payout::FeeSchedule;
use crate::games::types::{GameKind, Multiplier};
use crate::games::vrf_engine::{HashChainSeedSource, SeedSource, VrfSeedSource};
use crate::ledger::{ConfigAccount, RetryPolicy};
use crate::round::RoundRules;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: CoreConfig,
    pub games: GamesConfig,
    pub fees: FeesConfig,
    pub settlement: SettlementConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SeedSourceKind {
    Vrf,
    HashChain,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub tick_interval_ms: u64,
    /// Finished rounds kept per game
    pub history_limit: usize,
    pub event_capacity: usize,
    /// Ledger program id used for account derivation
    pub program_id: String,
    pub seed_source: SeedSourceKind,
    /// Hex-encoded 32-byte secret; random when absent
    pub seed_secret: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            history_limit: 100,
            event_capacity: 1024,
            program_id: "roundhouse".to_string(),
            seed_source: SeedSourceKind::Vrf,
            seed_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameConfig {
    pub enabled: bool,
    pub round_duration_secs: u64,
    /// Lamports
    pub min_deposit: u64,
    pub max_participants: u32,
}

impl GameConfig {
    fn with_duration(round_duration_secs: u64) -> Self {
        Self {
            enabled: true,
            round_duration_secs,
            min_deposit: 100_000_000,
            max_participants: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GamesConfig {
    pub crash: GameConfig,
    pub flip: GameConfig,
    pub pool: GameConfig,
}

impl Default for GamesConfig {
    fn default() -> Self {
        Self {
            crash: GameConfig::with_duration(15),
            flip: GameConfig::with_duration(10),
            pool: GameConfig::with_duration(60),
        }
    }
}

impl GamesConfig {
    pub fn get(&self, kind: GameKind) -> &GameConfig {
        match kind {
            GameKind::RisingMultiplier => &self.crash,
            GameKind::BinaryFlip => &self.flip,
            GameKind::WeightedPool => &self.pool,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeesConfig {
    pub platform_fee_bps: u64,
    /// Probability of an instant 1.00x crash, in basis points
    pub house_edge_bps: u64,
    /// Multipliers are in hundredths (250 = 2.50x)
    pub max_cashout: u64,
    pub max_crash: u64,
    /// Rising multiplier growth `k` in `e^(k·t)`, per second
    pub growth_per_sec: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 100,
            house_edge_bps: 100,
            max_cashout: 100_000_000,
            max_crash: 100_000_000,
            growth_per_sec: 0.12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SettlementConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff_ms,
            max_backoff_ms: policy.max_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn rules(&self, kind: GameKind) -> RoundRules {
        let game = self.games.get(kind);
        RoundRules {
            min_deposit: game.min_deposit,
            max_participants: game.max_participants,
            fees: FeeSchedule {
                platform_fee_bps: self.fees.platform_fee_bps,
                max_cashout: Multiplier::from_hundredths(self.fees.max_cashout),
            },
            crash: CrashParams {
                house_edge_bps: self.fees.house_edge_bps,
                max_crash: Multiplier::from_hundredths(self.fees.max_crash),
                growth_milli: (self.fees.growth_per_sec * 1_000.0).round() as u64,
            },
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let games: HashMap<GameKind, GameSettings> = GameKind::ALL
            .into_iter()
            .map(|kind| {
                let game = self.games.get(kind);
                (
                    kind,
                    GameSettings {
                        enabled: game.enabled,
                        round_duration_ms: game.round_duration_secs * 1_000,
                        rules: self.rules(kind),
                    },
                )
            })
            .collect();

        EngineSettings {
            games,
            history_limit: self.engine.history_limit,
            event_capacity: self.engine.event_capacity,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.settlement.max_attempts,
            initial_backoff_ms: self.settlement.initial_backoff_ms,
            max_backoff_ms: self.settlement.max_backoff_ms,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.engine.tick_interval_ms)
    }

    /// Config account an in-process ledger starts with for `kind`
    pub fn ledger_config_account(&self, kind: GameKind) -> ConfigAccount {
        let game = self.games.get(kind);
        ConfigAccount {
            authority: self.engine.program_id.clone(),
            team_wallet: format!("{}-team", self.engine.program_id),
            platform_fee_bps: self.fees.platform_fee_bps,
            min_deposit: game.min_deposit,
            max_participants: game.max_participants,
            round_counter: 0,
        }
    }

    /// Seed source selected by `engine.seed_source`, keyed by `engine.seed_secret`
    pub fn seed_source(&self) -> EngineResult<Arc<dyn SeedSource>> {
        let secret = match &self.engine.seed_secret {
            Some(raw) => {
                let bytes = hex::decode(raw)
                    .map_err(|_| invalid("engine.seed_secret", "<redacted>", "must be hex"))?;
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| invalid("engine.seed_secret", "<redacted>", "must be 32 bytes"))?;
                Some(secret)
            }
            None => None,
        };

        let source: Arc<dyn SeedSource> = match (self.engine.seed_source, secret) {
            (SeedSourceKind::Vrf, Some(secret)) => Arc::new(VrfSeedSource::from_secret(&secret)?),
            (SeedSourceKind::Vrf, None) => Arc::new(VrfSeedSource::new_random()),
            (SeedSourceKind::HashChain, Some(secret)) => Arc::new(HashChainSeedSource::new(secret)),
            (SeedSourceKind::HashChain, None) => {
                Arc::new(HashChainSeedSource::new(rand::random::<[u8; 32]>()))
            }
        };
        Ok(source)
    }
}

/// Configuration loader with environment variable support
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T: FromStr>(name: &str, raw: String) -> Result<T, ConfigurationError> {
    raw.parse()
        .map_err(|_| invalid(name, &raw, "could not parse value"))
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<EngineConfig> {
        let mut config = match &self.config_path {
            Some(path) => self.load_from_file(path)?,
            None => EngineConfig::default(),
        };

        Self::apply_overrides(&mut config, |name| env::var(name).ok())?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<EngineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Applies `ROUNDHOUSE_*` overrides read through `lookup`
    pub fn apply_overrides(
        config: &mut EngineConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigurationError> {
        if let Some(host) = lookup("ROUNDHOUSE_API_HOST") {
            config.api.host = host;
        }
        if let Some(port) = lookup("ROUNDHOUSE_API_PORT") {
            config.api.port = parse_var("ROUNDHOUSE_API_PORT", port)?;
        }
        if let Some(program_id) = lookup("ROUNDHOUSE_PROGRAM_ID") {
            config.engine.program_id = program_id;
        }
        if let Some(secret) = lookup("ROUNDHOUSE_SEED_SECRET") {
            config.engine.seed_secret = Some(secret);
        }
        if let Some(tick) = lookup("ROUNDHOUSE_TICK_INTERVAL_MS") {
            config.engine.tick_interval_ms = parse_var("ROUNDHOUSE_TICK_INTERVAL_MS", tick)?;
        }
        if let Some(fee) = lookup("ROUNDHOUSE_PLATFORM_FEE_BPS") {
            config.fees.platform_fee_bps = parse_var("ROUNDHOUSE_PLATFORM_FEE_BPS", fee)?;
        }
        if let Some(edge) = lookup("ROUNDHOUSE_HOUSE_EDGE_BPS") {
            config.fees.house_edge_bps = parse_var("ROUNDHOUSE_HOUSE_EDGE_BPS", edge)?;
        }
        if let Some(attempts) = lookup("ROUNDHOUSE_SETTLEMENT_MAX_ATTEMPTS") {
            config.settlement.max_attempts =
                parse_var("ROUNDHOUSE_SETTLEMENT_MAX_ATTEMPTS", attempts)?;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(config: &EngineConfig) -> Result<(), ConfigurationError> {
        if config.engine.tick_interval_ms < 10 {
            return Err(invalid(
                "engine.tick_interval_ms",
                config.engine.tick_interval_ms,
                "tick interval must be at least 10ms",
            ));
        }
        if config.engine.history_limit == 0 {
            return Err(invalid("engine.history_limit", 0, "history limit cannot be zero"));
        }
        if config.engine.program_id.is_empty() {
            return Err(ConfigurationError::ValidationFailed(
                "engine.program_id is required".to_string(),
            ));
        }
        if let Some(secret) = &config.engine.seed_secret {
            let valid = hex::decode(secret).map(|b| b.len() == 32).unwrap_or(false);
            if !valid {
                return Err(invalid("engine.seed_secret", "<redacted>", "must be 32 bytes of hex"));
            }
        }

        for kind in GameKind::ALL {
            let game = config.games.get(kind);
            let field = |name: &str| format!("games.{}.{}", kind, name);
            if game.round_duration_secs == 0 {
                return Err(invalid(&field("round_duration_secs"), 0, "round duration cannot be zero"));
            }
            if game.min_deposit == 0 {
                return Err(invalid(&field("min_deposit"), 0, "minimum deposit cannot be zero"));
            }
            if game.max_participants == 0 {
                return Err(invalid(&field("max_participants"), 0, "max participants cannot be zero"));
            }
        }
        if !GameKind::ALL.iter().any(|kind| config.games.get(*kind).enabled) {
            return Err(ConfigurationError::ValidationFailed(
                "at least one game must be enabled".to_string(),
            ));
        }

        let fees = &config.fees;
        if fees.platform_fee_bps > 10_000 {
            return Err(invalid("fees.platform_fee_bps", fees.platform_fee_bps, "fee cannot exceed 10000 bps"));
        }
        if fees.house_edge_bps >= 10_000 {
            return Err(invalid("fees.house_edge_bps", fees.house_edge_bps, "house edge must be below 10000 bps"));
        }
        let min_target = Multiplier::MIN_TARGET.hundredths();
        if fees.max_cashout < min_target {
            return Err(invalid("fees.max_cashout", fees.max_cashout, "must be at least 101 (1.01x)"));
        }
        if fees.max_crash < min_target {
            return Err(invalid("fees.max_crash", fees.max_crash, "must be at least 101 (1.01x)"));
        }
        if !(fees.growth_per_sec.is_finite() && fees.growth_per_sec >= 0.001) {
            return Err(invalid("fees.growth_per_sec", fees.growth_per_sec, "growth must be at least 0.001 per second"));
        }

        let settlement = &config.settlement;
        if settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", 0, "at least one attempt is required"));
        }
        if settlement.initial_backoff_ms > settlement.max_backoff_ms {
            return Err(invalid(
                "settlement.initial_backoff_ms",
                settlement.initial_backoff_ms,
                "initial backoff cannot exceed max backoff",
            ));
        }

        if config.api.enabled && config.api.port == 0 {
            return Err(invalid("api.port", 0, "API port cannot be zero when API is enabled"));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &EngineConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> EngineResult<()> {
    ConfigLoader::new().save(&EngineConfig::default(), path)
}
