use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Environment(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} looks like a placeholder ({value:?}); set a real value")]
    Placeholder { key: &'static str, value: String },
    #[error("{key} is not a valid http(s) URL: {value:?}")]
    InvalidUrl { key: &'static str, value: String },
    #[error("{0} must be at least 1")]
    ZeroInterval(&'static str),
}

/// Connection details for the WhatsApp bridge (Evolution API).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub integration: String,
}

impl GatewayConfig {
    /// Rejects empty or placeholder credentials so no malformed request ever leaves the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_not_placeholder("EVOLUTION_API_URL", &self.base_url)?;
        check_not_placeholder("EVOLUTION_API_KEY", &self.api_key)?;

        let parsed = Url::parse(&self.base_url).map_err(|_| ConfigError::InvalidUrl {
            key: "EVOLUTION_API_URL",
            value: self.base_url.clone(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ConfigError::InvalidUrl {
                key: "EVOLUTION_API_URL",
                value: self.base_url.clone(),
            });
        }
        Ok(())
    }
}

/// QR countdown and status polling cadence.
#[derive(Debug, Clone)]
pub struct ConnectTiming {
    pub countdown_ticks: u32,
    pub poll_every: u32,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_audience: String,
    pub gateway: GatewayConfig,
    pub webhook_url: Option<String>,
    pub webhook_events: Vec<String>,
    pub timing: ConnectTiming,
    pub calendar_api_url: String,
    pub log_dir: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    listen_address: Option<String>,
    database_url: Option<String>,
    jwt_secret: Option<String>,
    jwt_audience: Option<String>,
    evolution_api_url: Option<String>,
    evolution_api_key: Option<String>,
    evolution_integration: Option<String>,
    webhook_url: Option<String>,
    webhook_events: Option<Vec<String>>,
    qr_countdown_seconds: Option<u32>,
    status_poll_every: Option<u32>,
    tick_millis: Option<u64>,
    calendar_api_url: Option<String>,
    log_dir: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_jwt_audience() -> String {
    "authenticated".to_string()
}

fn default_integration() -> String {
    "WHATSAPP-BAILEYS".to_string()
}

fn default_webhook_events() -> Vec<String> {
    vec!["MESSAGES_UPSERT".to_string()]
}

fn default_calendar_api_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

const DEFAULT_COUNTDOWN_SECONDS: u32 = 40;
const DEFAULT_POLL_EVERY: u32 = 5;
const DEFAULT_TICK_MILLIS: u64 = 1000;

const PLACEHOLDER_MARKERS: &[&str] = &["your-", "your_", "changeme", "change-me", "example.com", "placeholder"];

fn check_not_placeholder(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Missing(key));
    }
    let lowered = trimmed.to_lowercase();
    let bracketed = lowered.starts_with('<') && lowered.ends_with('>');
    let all_x = lowered.chars().all(|c| c == 'x');
    if lowered == "undefined" || bracketed || all_x || PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(ConfigError::Placeholder {
            key,
            value: trimmed.to_string(),
        });
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config = match config_path {
            Some(path_str) => read_config_file(Path::new(path_str))?,
            None => PartialServerConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialServerConfig = envy::from_env::<PartialServerConfig>()?;

        // 3. Merge: environment overrides file
        Self::merge(env_config, file_config)
    }

    fn merge(env: PartialServerConfig, file: PartialServerConfig) -> Result<Self, ConfigError> {
        let gateway = GatewayConfig {
            base_url: non_empty(env.evolution_api_url.or(file.evolution_api_url))
                .ok_or(ConfigError::Missing("EVOLUTION_API_URL"))?
                .trim_end_matches('/')
                .to_string(),
            api_key: non_empty(env.evolution_api_key.or(file.evolution_api_key))
                .ok_or(ConfigError::Missing("EVOLUTION_API_KEY"))?,
            integration: env
                .evolution_integration
                .or(file.evolution_integration)
                .unwrap_or_else(default_integration),
        };
        gateway.validate()?;

        let timing = ConnectTiming {
            countdown_ticks: env
                .qr_countdown_seconds
                .or(file.qr_countdown_seconds)
                .unwrap_or(DEFAULT_COUNTDOWN_SECONDS),
            poll_every: env
                .status_poll_every
                .or(file.status_poll_every)
                .unwrap_or(DEFAULT_POLL_EVERY),
            tick: Duration::from_millis(env.tick_millis.or(file.tick_millis).unwrap_or(DEFAULT_TICK_MILLIS)),
        };
        if timing.countdown_ticks == 0 {
            return Err(ConfigError::ZeroInterval("QR_COUNTDOWN_SECONDS"));
        }
        if timing.poll_every == 0 {
            return Err(ConfigError::ZeroInterval("STATUS_POLL_EVERY"));
        }
        if timing.tick.is_zero() {
            return Err(ConfigError::ZeroInterval("TICK_MILLIS"));
        }

        Ok(ServerConfig {
            listen_address: env
                .listen_address
                .or(file.listen_address)
                .unwrap_or_else(default_listen_address),
            database_url: non_empty(env.database_url.or(file.database_url))
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            jwt_secret: non_empty(env.jwt_secret.or(file.jwt_secret)).ok_or(ConfigError::Missing("JWT_SECRET"))?,
            jwt_audience: env
                .jwt_audience
                .or(file.jwt_audience)
                .unwrap_or_else(default_jwt_audience),
            gateway,
            webhook_url: non_empty(env.webhook_url.or(file.webhook_url)),
            webhook_events: env
                .webhook_events
                .or(file.webhook_events)
                .filter(|events| !events.is_empty())
                .unwrap_or_else(default_webhook_events),
            timing,
            calendar_api_url: env
                .calendar_api_url
                .or(file.calendar_api_url)
                .unwrap_or_else(default_calendar_api_url)
                .trim_end_matches('/')
                .to_string(),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or_else(default_log_dir),
        })
    }
}

fn read_config_file(path: &Path) -> Result<PartialServerConfig, ConfigError> {
    if !path.exists() {
        return Ok(PartialServerConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn complete_file() -> PartialServerConfig {
        PartialServerConfig {
            database_url: Some("sqlite::memory:".to_string()),
            jwt_secret: Some("secret".to_string()),
            evolution_api_url: Some("https://evo.salon.test/".to_string()),
            evolution_api_key: Some("k3y".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_fill_optional_keys() {
        let config = ServerConfig::merge(PartialServerConfig::default(), complete_file()).unwrap();

        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(config.gateway.base_url, "https://evo.salon.test");
        assert_eq!(config.gateway.integration, "WHATSAPP-BAILEYS");
        assert_eq!(config.timing.countdown_ticks, 40);
        assert_eq!(config.timing.poll_every, 5);
        assert_eq!(config.timing.tick, Duration::from_secs(1));
        assert_eq!(config.webhook_events, vec!["MESSAGES_UPSERT".to_string()]);
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_environment_overrides_file() {
        let env = PartialServerConfig {
            qr_countdown_seconds: Some(14),
            evolution_api_key: Some("from-env".to_string()),
            ..Default::default()
        };
        let config = ServerConfig::merge(env, complete_file()).unwrap();

        assert_eq!(config.timing.countdown_ticks, 14);
        assert_eq!(config.gateway.api_key, "from-env");
    }

    #[test]
    fn test_missing_gateway_url_fails_loudly() {
        let mut file = complete_file();
        file.evolution_api_url = None;
        let err = ServerConfig::merge(PartialServerConfig::default(), file).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("EVOLUTION_API_URL")));
    }

    #[test]
    fn test_placeholder_values_are_rejected() {
        let mut file = complete_file();
        file.evolution_api_key = Some("your-api-key".to_string());
        let err = ServerConfig::merge(PartialServerConfig::default(), file).unwrap_err();
        assert!(matches!(err, ConfigError::Placeholder { key: "EVOLUTION_API_KEY", .. }));

        let mut file = complete_file();
        file.evolution_api_url = Some("ftp://evo.salon.test".to_string());
        let err = ServerConfig::merge(PartialServerConfig::default(), file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let mut file = complete_file();
        file.evolution_api_key = Some("<api-key>".to_string());
        assert!(ServerConfig::merge(PartialServerConfig::default(), file).is_err());
    }

    #[test]
    fn test_keys_with_symbols_are_accepted() {
        let mut file = complete_file();
        file.evolution_api_key = Some("@2^h5?.Sc/)1$Gp4ZF3X<YeU=2q".to_string());
        assert!(ServerConfig::merge(PartialServerConfig::default(), file).is_ok());
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let env = PartialServerConfig {
            status_poll_every: Some(0),
            ..Default::default()
        };
        let err = ServerConfig::merge(env, complete_file()).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval("STATUS_POLL_EVERY")));
    }

    #[test]
    fn test_reads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
database_url = "postgres://localhost/salon"
jwt_secret = "s"
evolution_api_url = "http://127.0.0.1:8081"
evolution_api_key = "abc"
webhook_url = "https://hooks.salon.test/wa"
webhook_events = ["MESSAGES_UPSERT", "CONNECTION_UPDATE"]
status_poll_every = 3
"#
        )
        .unwrap();

        let partial = read_config_file(file.path()).unwrap();
        let config = ServerConfig::merge(PartialServerConfig::default(), partial).unwrap();

        assert_eq!(config.webhook_url.as_deref(), Some("https://hooks.salon.test/wa"));
        assert_eq!(config.webhook_events.len(), 2);
        assert_eq!(config.timing.poll_every, 3);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let partial = read_config_file(Path::new("/definitely/not/here.toml")).unwrap();
        assert!(partial.database_url.is_none());
    }
}
