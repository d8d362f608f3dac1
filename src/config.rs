use serde::Deserialize;

/// Full configuration surface for the trading core.
///
/// Layered: optional TOML file, then environment variables prefixed with
/// `PAPERTRADER_` (double underscore as the section separator, e.g.
/// `PAPERTRADER_RISK__MAX_DAILY_LOSS_FRACTION=0.03`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub initial_cash: f64,
    pub database_url: Option<String>,
    pub providers: ProvidersConfig,
    pub cache: CacheTtlConfig,
    pub risk: RiskConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_cash: 10_000.0,
            database_url: None,
            providers: ProvidersConfig::default(),
            cache: CacheTtlConfig::default(),
            risk: RiskConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub coingecko: ProviderConfig,
    pub binance: ProviderConfig,
    /// Which provider's universe listing is authoritative for resolution.
    pub resolution: String,
    pub route: RouteConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            coingecko: ProviderConfig {
                base_url: "https://api.coingecko.com/api/v3".to_string(),
                api_key: None,
                // Demo tier: 10000 requests per hour
                max_requests: 10_000,
                interval_ms: 3_600_000,
            },
            binance: ProviderConfig {
                base_url: "https://api.binance.com".to_string(),
                api_key: None,
                // Conservative slice of the public REST weight budget
                max_requests: 50,
                interval_ms: 60_000,
            },
            resolution: "coingecko".to_string(),
            route: RouteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_requests: u32,
    pub interval_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            max_requests: 50,
            interval_ms: 60_000,
        }
    }
}

/// Ordered provider lists per capability. The first entry is the primary;
/// later entries are tried on retryable failures only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub price: Vec<String>,
    pub candles: Vec<String>,
    pub order_book: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            price: vec!["coingecko".to_string(), "binance".to_string()],
            candles: vec!["binance".to_string(), "coingecko".to_string()],
            // CoinGecko exposes no depth endpoint, so it never routes here
            order_book: vec!["binance".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub price_secs: u64,
    pub candles_secs: u64,
    pub market_meta_secs: u64,
    pub news_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            price_secs: 300,
            candles_secs: 300,
            market_meta_secs: 3600,
            news_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Max fraction of portfolio value one position may cost.
    pub max_position_size_fraction: f64,
    /// Daily realized-loss fraction that trips the force-close.
    pub max_daily_loss_fraction: f64,
    pub monitor_interval_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_fraction: 0.05,
            max_daily_loss_fraction: 0.05,
            monitor_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub market_cap_floor: f64,
    pub market_cap_ceiling: f64,
    pub volume_floor: f64,
    pub score_threshold: f64,
    pub universe_size: usize,
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            market_cap_floor: 10_000_000.0,
            market_cap_ceiling: 100_000_000_000.0,
            volume_floor: 1_000_000.0,
            score_threshold: 0.5,
            universe_size: 50,
            interval_secs: 1800,
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let cfg = builder
            .add_source(config::Environment::with_prefix("PAPERTRADER").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = Settings::default();
        assert!(s.initial_cash > 0.0);
        assert!(s.risk.max_position_size_fraction < 1.0);
        assert!(s.risk.max_daily_loss_fraction < 1.0);
        assert!(s.discovery.market_cap_floor < s.discovery.market_cap_ceiling);
        assert_eq!(s.providers.route.price[0], "coingecko");
        assert_eq!(s.providers.route.order_book, vec!["binance"]);
    }

    #[test]
    fn test_load_without_file() {
        let s = Settings::load(None).expect("load with defaults");
        assert_eq!(s.cache.price_secs, 300);
    }
}
