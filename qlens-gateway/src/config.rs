//! # Configuration
//!
//! TOML-based gateway configuration with environment overrides. Durations
//! are written in the `"30s"` / `"5m"` / `"1h"` style.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! timeout = "30s"
//!
//! [providers.azure-openai]
//! enabled = true
//! endpoint = "https://my-resource.openai.azure.com"
//! api_key = ""                 # or AZURE_OPENAI_API_KEY
//! priority = 10
//! timeout = "30s"
//! retries = 3
//! [providers.azure-openai.model_map]
//! gpt-35-turbo = "prod-gpt35"
//!
//! [providers.aws-bedrock]
//! enabled = true
//! region = "us-east-1"         # credentials via AWS_* variables
//! priority = 5
//! timeout = "30s"
//! retries = 3
//!
//! [router]
//! auto_failover = true
//! load_balancing = true
//! health_check_interval = "30s"
//!
//! [cache]
//! enabled = true
//! ttl = "15m"
//! max_size = 1000
//! backend = "memory"           # or "redis" + redis_url
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use qlens_core::cache::{CacheBackend, CacheConfig};
use qlens_core::models::ProviderId;
use qlens_core::providers::ProviderConfig;
use qlens_core::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub providers: HashMap<ProviderId, ProviderSettings>,
    pub router: RouterSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub api_key: String,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub priority: u32,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub retries: u32,
    pub model_map: HashMap<String, String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            endpoint: None,
            api_version: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            priority: 0,
            timeout: Duration::from_secs(30),
            retries: 3,
            model_map: HashMap::new(),
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self, provider: ProviderId) -> ProviderConfig {
        ProviderConfig {
            provider,
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
            api_version: self.api_version.clone(),
            region: self.region.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
            enabled: self.enabled,
            priority: self.priority,
            timeout: self.timeout,
            retries: self.retries,
            model_map: self.model_map.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub auto_failover: bool,
    pub load_balancing: bool,
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,
    pub default_provider: Option<ProviderId>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            auto_failover: true,
            load_balancing: true,
            health_check_interval: Duration::from_secs(30),
            default_provider: None,
        }
    }
}

impl RouterSettings {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            auto_failover: self.auto_failover,
            load_balancing: self.load_balancing,
            health_check_interval: self.health_check_interval,
            default_provider: self.default_provider,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    pub max_size: usize,
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(900),
            max_size: 1000,
            backend: CacheBackendKind::Memory,
            redis_url: None,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled,
            ttl: self.ttl,
            max_size: self.max_size,
            backend: match self.backend {
                CacheBackendKind::Memory => CacheBackend::Memory,
                CacheBackendKind::Redis => CacheBackend::Redis {
                    url: self
                        .redis_url
                        .clone()
                        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            providers: HashMap::new(),
            router: RouterSettings::default(),
            cache: CacheSettings::default(),
            logging: LoggingSettings::default(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {path}: {e}"))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("cannot parse config {path}: {e}"))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("QLENS_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = env::var("QLENS_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(level) = env::var("QLENS_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(url) = env::var("QLENS_REDIS_URL") {
            if !url.is_empty() {
                self.cache.backend = CacheBackendKind::Redis;
                self.cache.redis_url = Some(url);
            }
        }

        if let Some(azure) = self.providers.get_mut(&ProviderId::AzureOpenAi) {
            if let Ok(key) = env::var("AZURE_OPENAI_API_KEY") {
                if !key.is_empty() {
                    azure.api_key = key;
                }
            }
            if let Ok(endpoint) = env::var("AZURE_OPENAI_ENDPOINT") {
                if !endpoint.is_empty() {
                    azure.endpoint = Some(endpoint);
                }
            }
        }
        if let Some(bedrock) = self.providers.get_mut(&ProviderId::AwsBedrock) {
            if let Ok(key) = env::var("AWS_ACCESS_KEY_ID") {
                if !key.is_empty() {
                    bedrock.access_key_id = Some(key);
                }
            }
            if let Ok(secret) = env::var("AWS_SECRET_ACCESS_KEY") {
                if !secret.is_empty() {
                    bedrock.secret_access_key = Some(secret);
                }
            }
            if let Ok(token) = env::var("AWS_SESSION_TOKEN") {
                if !token.is_empty() {
                    bedrock.session_token = Some(token);
                }
            }
            if let Ok(region) = env::var("AWS_REGION") {
                if !region.is_empty() {
                    bedrock.region = Some(region);
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.server.timeout.is_zero() {
            anyhow::bail!("server timeout cannot be zero");
        }

        let enabled: Vec<_> = self
            .providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .collect();
        if enabled.is_empty() {
            anyhow::bail!("at least one provider must be enabled");
        }
        for (provider, settings) in &self.providers {
            if !settings.enabled {
                continue;
            }
            if settings.timeout.is_zero() {
                anyhow::bail!("provider {provider} timeout cannot be zero");
            }
            match provider {
                ProviderId::AzureOpenAi => {
                    if settings.endpoint.is_none() {
                        anyhow::bail!("provider {provider} requires an endpoint");
                    }
                }
                ProviderId::AwsBedrock => {
                    if settings.region.is_none() {
                        anyhow::bail!("provider {provider} requires a region");
                    }
                }
            }
            if let Some(endpoint) = &settings.endpoint {
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                    anyhow::bail!("provider {provider} endpoint must be an http(s) url");
                }
            }
        }

        if self.cache.enabled {
            if self.cache.max_size == 0 {
                anyhow::bail!("cache max_size cannot be zero when the cache is enabled");
            }
            if self.cache.ttl.is_zero() {
                anyhow::bail!("cache ttl cannot be zero when the cache is enabled");
            }
            if self.cache.backend == CacheBackendKind::Redis {
                let url = self.cache.redis_url.as_deref().unwrap_or_default();
                if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                    anyhow::bail!("redis_url must start with redis:// or rediss://");
                }
            }
        }

        if self.router.health_check_interval.is_zero() {
            anyhow::bail!("health_check_interval cannot be zero");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "invalid log level {}; expected one of {}",
                self.logging.level,
                valid_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Serde adapter for `"30s"` / `"5m"` / `"1h"` duration strings. Bare
/// integers are seconds.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        let (value, unit) = s.split_at(s.len().saturating_sub(1));
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))?;
        match unit {
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            _ => Err(format!("invalid duration unit in {s}; use s, m, or h")),
        }
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(u64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Repr::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}
