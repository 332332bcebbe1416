//! Configuration file parser for ~/.config/feedbrief/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides `ai.api_key` from the file.
pub const API_KEY_ENV: &str = "BRIEF_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Every section uses `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub crawl: CrawlConfig,
    pub ai: AiConfig,
    pub scheduler: SchedulerConfig,
}

/// Paginated crawl settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Delay between listing pages, in seconds.
    pub interval: u64,
    /// Maximum number of listing pages fetched per feed per run.
    pub max_page: u32,
    /// First listing page index.
    pub start_page: u32,
    /// Allow feed URLs on loopback or private networks (self-hosted bridges).
    pub allow_private_hosts: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            max_page: 1,
            start_page: 0,
            allow_private_hosts: false,
        }
    }
}

/// AI brief enrichment settings.
///
/// Custom Debug impl masks `api_key` so it never reaches logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    /// API key for the chat-completions service. `BRIEF_API_KEY` takes
    /// precedence when set.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    pub api_url: String,
    pub model: String,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Total attempts per article, including the first.
    pub max_retries: u32,
    /// Articles per periodic batch.
    pub batch_size: u32,
    /// Concurrent generations within a batch.
    pub max_concurrent: usize,
    /// Run the periodic batch job.
    pub auto_generate: bool,
    /// Queue enrichment for every newly ingested article.
    pub auto_generate_on_fetch: bool,
    /// Periodic batch interval in minutes.
    pub generate_interval: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_url: "https://open.bigmodel.cn/api/paas/v4/chat/completions".to_string(),
            model: "GLM-4.5-Flash".to_string(),
            timeout: 60,
            max_retries: 3,
            batch_size: 10,
            max_concurrent: 2,
            auto_generate: false,
            auto_generate_on_fetch: true,
            generate_interval: 60,
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("batch_size", &self.batch_size)
            .field("max_concurrent", &self.max_concurrent)
            .field("auto_generate", &self.auto_generate)
            .field("auto_generate_on_fetch", &self.auto_generate_on_fetch)
            .field("generate_interval", &self.generate_interval)
            .finish()
    }
}

impl AiConfig {
    /// Resolve the API key: environment first, then the config file.
    /// Blank values count as absent.
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(SecretString::from(key));
            }
        }
        self.api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())
            .cloned()
    }

    /// Cron expression for the periodic batch job.
    ///
    /// Below an hour runs every N minutes, exactly an hour runs hourly,
    /// above an hour runs every whole number of hours.
    pub fn batch_cron(&self) -> String {
        let minutes = self.generate_interval.max(1);
        match minutes {
            m if m < 60 => format!("*/{} * * * *", m),
            60 => "0 * * * *".to_string(),
            m => format!("0 */{} * * *", (m / 60).clamp(1, 23)),
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(SecretString::from))
}

/// Scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the cron driver. When false, jobs are registered but only fire
    /// when driven explicitly.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            ai_enabled = config.ai.enabled,
            max_page = config.crawl.max_page,
            "Loaded configuration"
        );
        Ok(config)
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    const SECTIONS: [(&str, &[&str]); 3] = [
        (
            "crawl",
            &["interval", "max_page", "start_page", "allow_private_hosts"],
        ),
        (
            "ai",
            &[
                "enabled",
                "api_key",
                "api_url",
                "model",
                "timeout",
                "max_retries",
                "batch_size",
                "max_concurrent",
                "auto_generate",
                "auto_generate_on_fetch",
                "generate_interval",
            ],
        ),
        ("scheduler", &["enabled"]),
    ];

    for (key, value) in raw {
        let Some((_, known)) = SECTIONS.iter().find(|(name, _)| name == key) else {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        };
        if let Some(table) = value.as_table() {
            for sub in table.keys() {
                if !known.contains(&sub.as_str()) {
                    tracing::warn!(key = %format!("{}.{}", key, sub), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.crawl.interval, 10);
        assert_eq!(config.crawl.max_page, 1);
        assert_eq!(config.crawl.start_page, 0);
        assert!(!config.ai.enabled);
        assert_eq!(config.ai.model, "GLM-4.5-Flash");
        assert_eq!(config.ai.max_retries, 3);
        assert_eq!(config.ai.max_concurrent, 2);
        assert!(config.ai.auto_generate_on_fetch);
        assert!(config.ai.api_key.is_none());
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedbrief_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.crawl.interval, 10);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::parse("   \n  \n  ").unwrap();
        assert_eq!(config.ai.batch_size, 10);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::parse("[crawl]\nmax_page = 3\n").unwrap();
        assert_eq!(config.crawl.max_page, 3);
        assert_eq!(config.crawl.interval, 10);
        assert_eq!(config.ai.timeout, 60);
    }

    #[test]
    fn test_full_ai_section() {
        let content = r#"
[ai]
enabled = true
api_key = "test-key-123"
api_url = "http://localhost:9999/v1/chat"
model = "small"
timeout = 5
max_retries = 4
batch_size = 20
max_concurrent = 3
auto_generate = true
auto_generate_on_fetch = false
generate_interval = 15
"#;
        let config = Config::parse(content).unwrap();
        assert!(config.ai.enabled);
        assert_eq!(
            config.ai.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("test-key-123".to_string())
        );
        assert_eq!(config.ai.api_url, "http://localhost:9999/v1/chat");
        assert_eq!(config.ai.max_retries, 4);
        assert_eq!(config.ai.max_concurrent, 3);
        assert!(!config.ai.auto_generate_on_fetch);
        assert_eq!(config.ai.generate_interval, 15);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("[crawl]\ninterval = \"soon\"\n").is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let content = r#"
totally_fake_key = "should not fail"

[ai]
modle = "typo"
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.ai.model, "GLM-4.5-Flash");
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedbrief_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_debug_masks_api_key() {
        let config = Config::parse("[ai]\napi_key = \"super-secret-key-12345\"\n").unwrap();
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-key-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_batch_cron_from_interval() {
        let mut ai = AiConfig::default();
        ai.generate_interval = 15;
        assert_eq!(ai.batch_cron(), "*/15 * * * *");
        ai.generate_interval = 60;
        assert_eq!(ai.batch_cron(), "0 * * * *");
        ai.generate_interval = 180;
        assert_eq!(ai.batch_cron(), "0 */3 * * *");
        ai.generate_interval = 0;
        assert_eq!(ai.batch_cron(), "*/1 * * * *");
    }
}
