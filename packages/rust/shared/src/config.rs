//! Application configuration for ReconPipe.
//!
//! User config lives at `~/.reconpipe/reconpipe.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "reconpipe.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".reconpipe";

// ---------------------------------------------------------------------------
// Config structs (matching reconpipe.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Per-stage worker concurrency limits.
    #[serde(default)]
    pub stages: StagesConfig,

    /// Contact-discovery API settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// LLM (OpenRouter-compatible) settings for profile/pretext generation.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// HTML-to-Markdown conversion service settings.
    #[serde(default)]
    pub converter: ConverterConfig,

    /// Scraping timeouts, settle delays, and platform content rules.
    #[serde(default)]
    pub scrape_policies: ScrapePoliciesConfig,
}

impl AppConfig {
    /// Path of the pipeline database inside the data directory, with a
    /// leading `~` expanded.
    pub fn db_path(&self) -> Result<PathBuf> {
        let raw = &self.defaults.data_dir;
        let dir = match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .ok_or_else(|| PipelineError::config("could not determine home directory"))?
                .join(rest),
            None => PathBuf::from(raw),
        };
        Ok(dir.join("reconpipe.db"))
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the pipeline database.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.reconpipe/data".into()
}

/// `[stages]` section — one bound per pipeline stage.
///
/// Scraping is capped low because every in-flight job holds a browser page;
/// DNS/API-bound stages can run much wider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "default_dns_concurrency")]
    pub dns_concurrency: usize,

    #[serde(default = "default_scrape_concurrency")]
    pub scrape_concurrency: usize,

    #[serde(default = "default_profile_concurrency")]
    pub profile_concurrency: usize,

    #[serde(default = "default_pretext_concurrency")]
    pub pretext_concurrency: usize,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            dns_concurrency: default_dns_concurrency(),
            scrape_concurrency: default_scrape_concurrency(),
            profile_concurrency: default_profile_concurrency(),
            pretext_concurrency: default_pretext_concurrency(),
        }
    }
}

fn default_dns_concurrency() -> usize {
    16
}
fn default_scrape_concurrency() -> usize {
    3
}
fn default_profile_concurrency() -> usize {
    2
}
fn default_pretext_concurrency() -> usize {
    2
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_discovery_key_env")]
    pub api_key_env: String,

    /// Contact-discovery API base URL.
    #[serde(default = "default_discovery_base_url")]
    pub base_url: String,

    /// Domain-relation service base URL.
    #[serde(default = "default_related_base_url")]
    pub related_base_url: String,

    /// DNS-over-HTTPS resolver base URL.
    #[serde(default = "default_doh_base_url")]
    pub doh_base_url: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_discovery_key_env(),
            base_url: default_discovery_base_url(),
            related_base_url: default_related_base_url(),
            doh_base_url: default_doh_base_url(),
        }
    }
}

fn default_discovery_key_env() -> String {
    "HUNTER_API_KEY".into()
}
fn default_discovery_base_url() -> String {
    "https://api.hunter.io".into()
}
fn default_related_base_url() -> String {
    "http://127.0.0.1:8901".into()
}
fn default_doh_base_url() -> String {
    "https://dns.google".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL.
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,

    /// Default model for profile/pretext generation.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_openrouter_base_url(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}

/// `[converter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Base URL of the HTML-to-Markdown service.
    #[serde(default = "default_converter_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_converter_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            base_url: default_converter_url(),
            timeout_secs: default_converter_timeout(),
        }
    }
}

fn default_converter_url() -> String {
    "http://127.0.0.1:8900".into()
}
fn default_converter_timeout() -> u64 {
    30
}

/// `[scrape_policies]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapePoliciesConfig {
    /// Navigation timeout in seconds.
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,

    /// Fallback delay (ms) raced against the network-settled wait.
    #[serde(default = "default_settle_fallback")]
    pub settle_fallback_ms: u64,

    /// Delay (ms) after each lazy-load scroll step.
    #[serde(default = "default_scroll_settle")]
    pub scroll_settle_ms: u64,

    /// Platforms whose extraction is restricted to a main content selector.
    #[serde(default = "default_platform_regions")]
    pub platform_regions: Vec<PlatformRegion>,
}

impl Default for ScrapePoliciesConfig {
    fn default() -> Self {
        Self {
            nav_timeout_secs: default_nav_timeout(),
            settle_fallback_ms: default_settle_fallback(),
            scroll_settle_ms: default_scroll_settle(),
            platform_regions: default_platform_regions(),
        }
    }
}

fn default_nav_timeout() -> u64 {
    20
}
fn default_settle_fallback() -> u64 {
    3000
}
fn default_scroll_settle() -> u64 {
    400
}
fn default_platform_regions() -> Vec<PlatformRegion> {
    vec![PlatformRegion {
        domain: "linkedin.com".into(),
        selector: "main".into(),
    }]
}

/// `[[scrape_policies.platform_regions]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRegion {
    /// Host suffix the rule applies to.
    pub domain: String,
    /// CSS selector of the content region that must be present.
    pub selector: String,
}

// ---------------------------------------------------------------------------
// Scrape config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scraping configuration — merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub nav_timeout: std::time::Duration,
    pub settle_fallback: std::time::Duration,
    pub scroll_settle: std::time::Duration,
    pub platform_regions: Vec<PlatformRegion>,
}

impl From<&AppConfig> for ScrapeConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            nav_timeout: std::time::Duration::from_secs(config.scrape_policies.nav_timeout_secs),
            settle_fallback: std::time::Duration::from_millis(
                config.scrape_policies.settle_fallback_ms,
            ),
            scroll_settle: std::time::Duration::from_millis(
                config.scrape_policies.scroll_settle_ms,
            ),
            platform_regions: config.scrape_policies.platform_regions.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.reconpipe/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.reconpipe/reconpipe.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that an API key env var named by the config is set and non-empty.
pub fn validate_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PipelineError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("HUNTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.stages.scrape_concurrency, 3);
        assert_eq!(parsed.openrouter.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn config_with_platform_region_override() {
        let toml_str = r#"
[stages]
scrape_concurrency = 1

[[scrape_policies.platform_regions]]
domain = "profiles.example"
selector = "div.profile-body"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.stages.scrape_concurrency, 1);
        assert_eq!(config.scrape_policies.platform_regions.len(), 1);
        assert_eq!(
            config.scrape_policies.platform_regions[0].selector,
            "div.profile-body"
        );
    }

    #[test]
    fn scrape_config_from_app_config() {
        let app = AppConfig::default();
        let scrape = ScrapeConfig::from(&app);
        assert_eq!(scrape.nav_timeout.as_secs(), 20);
        assert_eq!(scrape.settle_fallback.as_millis(), 3000);
        assert_eq!(scrape.platform_regions.len(), 1);
    }

    #[test]
    fn api_key_validation() {
        // Use a unique env var name to avoid interfering with other tests
        let result = validate_api_key("RP_TEST_NONEXISTENT_KEY_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
