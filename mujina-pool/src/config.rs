//! Coordinator configuration.
//!
//! Loaded once at startup from `MUJINA_POOL_*` environment variables and
//! validated before anything else runs. An invalid value is fatal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Difficulty;

/// Upper bound for every configured duration.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Which daemon implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    /// JSON-RPC over HTTP.
    Rpc,
    /// In-process daemon for local development.
    Dummy,
}

impl FromStr for DaemonKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rpc" => Ok(Self::Rpc),
            "dummy" => Ok(Self::Dummy),
            other => Err(Error::ConfigurationInvalid(format!(
                "unknown daemon kind {other:?}, expected \"rpc\" or \"dummy\""
            ))),
        }
    }
}

/// How a solved block's round is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardScheme {
    /// Every valid share since the previous block.
    Proportional,
    /// The last `n` valid shares before the block.
    Pplns { n: usize },
}

impl FromStr for RewardScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "proportional" {
            return Ok(Self::Proportional);
        }
        if let Some(n) = s.strip_prefix("pplns:") {
            let n: usize = n.parse().map_err(|_| {
                Error::ConfigurationInvalid(format!("invalid PPLNS share count {n:?}"))
            })?;
            return Ok(Self::Pplns { n });
        }
        Err(Error::ConfigurationInvalid(format!(
            "unknown reward scheme {s:?}, expected \"proportional\" or \"pplns:<N>\""
        )))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    /// Upper bound on every daemon call.
    pub rpc_timeout: Duration,
    pub daemon: DaemonKind,

    /// Fraction of each block reward kept by the pool.
    pub pool_fee: f64,
    /// Difficulty assigned to newly registered workers.
    pub min_difficulty: Difficulty,
    /// Minimum pending balance before a worker is paid.
    pub payout_threshold: f64,
    /// Used when the daemon does not report a block's reward.
    pub block_reward: f64,
    pub reward_scheme: RewardScheme,
    /// Proportional round start when no previous block exists.
    pub round_lookback: Duration,

    pub work_refresh_interval: Duration,
    pub hashrate_interval: Duration,
    pub hashrate_window: Duration,
    pub payout_interval: Duration,

    pub api_bind: SocketAddr,
    /// Snapshot file. `None` keeps state in memory only.
    pub state_file: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:62620".into(),
            rpc_user: "trinityuser".into(),
            rpc_password: "trinitypass".into(),
            rpc_timeout: Duration::from_secs(10),
            daemon: DaemonKind::Rpc,
            pool_fee: 0.01,
            min_difficulty: Difficulty::new(0.0001),
            payout_threshold: 0.1,
            block_reward: 50.0,
            reward_scheme: RewardScheme::Proportional,
            round_lookback: Duration::from_secs(24 * 60 * 60),
            work_refresh_interval: Duration::from_secs(10),
            hashrate_interval: Duration::from_secs(60),
            hashrate_window: Duration::from_secs(600),
            payout_interval: Duration::from_secs(300),
            api_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            state_file: None,
        }
    }
}

impl PoolConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup and validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(&format!("MUJINA_POOL_{key}")).filter(|v| !v.is_empty());

        if let Some(v) = get("RPC_URL") {
            config.rpc_url = v;
        }
        if let Some(v) = get("RPC_USER") {
            config.rpc_user = v;
        }
        if let Some(v) = get("RPC_PASSWORD") {
            config.rpc_password = v;
        }
        if let Some(v) = get("RPC_TIMEOUT_SECS") {
            config.rpc_timeout = parse_secs("RPC_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DAEMON") {
            config.daemon = v.parse()?;
        }
        if let Some(v) = get("FEE") {
            config.pool_fee = parse("FEE", &v)?;
        }
        if let Some(v) = get("MIN_DIFFICULTY") {
            let raw: f64 = parse("MIN_DIFFICULTY", &v)?;
            if !(raw.is_finite() && raw > 0.0) {
                return Err(Error::ConfigurationInvalid(format!(
                    "MUJINA_POOL_MIN_DIFFICULTY must be positive, got {raw}"
                )));
            }
            config.min_difficulty = Difficulty::new(raw);
        }
        if let Some(v) = get("PAYOUT_THRESHOLD") {
            config.payout_threshold = parse("PAYOUT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("BLOCK_REWARD") {
            config.block_reward = parse("BLOCK_REWARD", &v)?;
        }
        if let Some(v) = get("REWARD_SCHEME") {
            config.reward_scheme = v.parse()?;
        }
        if let Some(v) = get("ROUND_LOOKBACK_SECS") {
            config.round_lookback = parse_secs("ROUND_LOOKBACK_SECS", &v)?;
        }
        if let Some(v) = get("WORK_REFRESH_SECS") {
            config.work_refresh_interval = parse_secs("WORK_REFRESH_SECS", &v)?;
        }
        if let Some(v) = get("HASHRATE_INTERVAL_SECS") {
            config.hashrate_interval = parse_secs("HASHRATE_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("HASHRATE_WINDOW_SECS") {
            config.hashrate_window = parse_secs("HASHRATE_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("PAYOUT_INTERVAL_SECS") {
            config.payout_interval = parse_secs("PAYOUT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("API_BIND") {
            config.api_bind = parse("API_BIND", &v)?;
        }
        if let Some(v) = get("STATE_FILE") {
            config.state_file = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::ConfigurationInvalid(msg));

        if !(self.payout_threshold.is_finite() && self.payout_threshold > 0.0) {
            return invalid(format!(
                "payout threshold must be positive, got {}",
                self.payout_threshold
            ));
        }
        if !(0.0..1.0).contains(&self.pool_fee) {
            return invalid(format!("pool fee must be in [0, 1), got {}", self.pool_fee));
        }
        if self.min_difficulty.is_zero() {
            return invalid("minimum difficulty must be positive".into());
        }
        if !(self.block_reward.is_finite() && self.block_reward > 0.0) {
            return invalid(format!(
                "block reward must be positive, got {}",
                self.block_reward
            ));
        }
        if let RewardScheme::Pplns { n: 0 } = self.reward_scheme {
            return invalid("PPLNS share count must be at least 1".into());
        }
        for (name, value) in [
            ("RPC timeout", self.rpc_timeout),
            ("round lookback", self.round_lookback),
            ("work refresh interval", self.work_refresh_interval),
            ("hashrate interval", self.hashrate_interval),
            ("hashrate window", self.hashrate_window),
            ("payout interval", self.payout_interval),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be positive"));
            }
            if value > MAX_DURATION {
                return invalid(format!(
                    "{name} must be at most {}s, got {}s",
                    MAX_DURATION.as_secs(),
                    value.as_secs()
                ));
            }
        }
        if self.daemon == DaemonKind::Rpc && self.rpc_url.trim().is_empty() {
            return invalid("RPC URL must not be empty".into());
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::ConfigurationInvalid(format!("MUJINA_POOL_{key}: cannot parse {value:?}"))
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<PoolConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PoolConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = load(&[]).unwrap();
        assert_eq!(config.pool_fee, 0.01);
        assert_eq!(config.payout_threshold, 0.1);
        assert_eq!(config.min_difficulty, Difficulty::new(0.0001));
        assert_eq!(config.reward_scheme, RewardScheme::Proportional);
        assert_eq!(config.daemon, DaemonKind::Rpc);
        assert_eq!(config.work_refresh_interval, Duration::from_secs(10));
        assert_eq!(config.payout_interval, Duration::from_secs(300));
        assert!(config.state_file.is_none());
    }

    #[test]
    fn overrides_apply() {
        let config = load(&[
            ("MUJINA_POOL_FEE", "0.02"),
            ("MUJINA_POOL_REWARD_SCHEME", "pplns:5000"),
            ("MUJINA_POOL_DAEMON", "dummy"),
            ("MUJINA_POOL_API_BIND", "127.0.0.1:9000"),
            ("MUJINA_POOL_STATE_FILE", "/var/lib/mujina-pool/state.json"),
        ])
        .unwrap();
        assert_eq!(config.pool_fee, 0.02);
        assert_eq!(config.reward_scheme, RewardScheme::Pplns { n: 5000 });
        assert_eq!(config.daemon, DaemonKind::Dummy);
        assert_eq!(config.api_bind.port(), 9000);
        assert!(config.state_file.is_some());
    }

    #[test_case("MUJINA_POOL_PAYOUT_THRESHOLD", "0" ; "zero threshold")]
    #[test_case("MUJINA_POOL_PAYOUT_THRESHOLD", "-1" ; "negative threshold")]
    #[test_case("MUJINA_POOL_FEE", "1.0" ; "fee of one")]
    #[test_case("MUJINA_POOL_FEE", "-0.1" ; "negative fee")]
    #[test_case("MUJINA_POOL_MIN_DIFFICULTY", "0" ; "zero difficulty")]
    #[test_case("MUJINA_POOL_REWARD_SCHEME", "pplns:0" ; "empty pplns window")]
    #[test_case("MUJINA_POOL_REWARD_SCHEME", "score" ; "unknown scheme")]
    #[test_case("MUJINA_POOL_PAYOUT_INTERVAL_SECS", "0" ; "zero interval")]
    #[test_case("MUJINA_POOL_PAYOUT_INTERVAL_SECS", "18446744073709551615" ; "huge interval")]
    #[test_case("MUJINA_POOL_ROUND_LOOKBACK_SECS", "9223372036854775807" ; "huge lookback")]
    #[test_case("MUJINA_POOL_HASHRATE_WINDOW_SECS", "31536001" ; "window over a year")]
    #[test_case("MUJINA_POOL_RPC_TIMEOUT_SECS", "ten" ; "unparsable timeout")]
    #[test_case("MUJINA_POOL_DAEMON", "bitcoind" ; "unknown daemon")]
    fn invalid_values_are_fatal(key: &str, value: &str) {
        let err = load(&[(key, value)]).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)), "{err}");
    }

    #[test]
    fn one_year_is_accepted() {
        let config = load(&[("MUJINA_POOL_ROUND_LOOKBACK_SECS", "31536000")]).unwrap();
        assert_eq!(config.round_lookback, MAX_DURATION);
    }
}
