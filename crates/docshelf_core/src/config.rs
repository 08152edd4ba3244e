use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MANIFEST_URL: &str =
    "https://github.com/Hisham-Pak/DjangoDocs/releases/download/offline-docs/manifest.json";
pub const DEFAULT_DOCS_HOME: &str = "https://docs.djangoproject.com/";
pub const DEFAULT_ARCHIVE_URL_TEMPLATE: &str =
    "https://media.djangoproject.com/docs/django-docs-{slug}-en.zip";
pub const DEFAULT_USER_AGENT: &str = "docshelf/0.2";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 30 * 60_000;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10 * 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ShelfConfig {
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourcesSection {
    pub manifest_url: Option<String>,
    pub docs_home: Option<String>,
    pub archive_url_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub download_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub min_interval_secs: Option<u64>,
}

/// Effective settings after applying env > config file > built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub manifest_url: String,
    pub docs_home: String,
    pub archive_url_template: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Upper bound on a whole archive transfer, body included.
    pub download_timeout_ms: u64,
    pub sync_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        ShelfConfig::default().resolve_with_lookup(|_| None)
    }
}

impl Settings {
    /// Landing page for one version, e.g. `https://docs.djangoproject.com/en/5.2/`.
    pub fn page_url(&self, slug: &str) -> String {
        let base = self.docs_home.trim_end_matches('/');
        format!("{base}/en/{slug}/")
    }

    /// Conventional archive location for a `<major>.<minor>` slug.
    pub fn conventional_archive_url(&self, slug: &str) -> String {
        self.archive_url_template.replace("{slug}", slug)
    }
}

impl ShelfConfig {
    pub fn resolve(&self) -> Settings {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_string = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_u64 = |key: &str| env_string(key).and_then(|value| value.parse::<u64>().ok());

        Settings {
            manifest_url: env_string("DOCSHELF_MANIFEST_URL")
                .or_else(|| self.sources.manifest_url.clone())
                .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string()),
            docs_home: env_string("DOCSHELF_DOCS_HOME")
                .or_else(|| self.sources.docs_home.clone())
                .unwrap_or_else(|| DEFAULT_DOCS_HOME.to_string()),
            archive_url_template: self
                .sources
                .archive_url_template
                .clone()
                .unwrap_or_else(|| DEFAULT_ARCHIVE_URL_TEMPLATE.to_string()),
            user_agent: env_string("DOCSHELF_USER_AGENT")
                .or_else(|| self.http.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: env_u64("DOCSHELF_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
            download_timeout_ms: env_u64("DOCSHELF_DOWNLOAD_TIMEOUT_MS")
                .or(self.http.download_timeout_ms)
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_MS),
            sync_interval: Duration::from_secs(
                env_u64("DOCSHELF_SYNC_INTERVAL_SECS")
                    .or(self.sync.min_interval_secs)
                    .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            ),
        }
    }
}

/// Load and parse a ShelfConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ShelfConfig> {
    if !config_path.exists() {
        return Ok(ShelfConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ShelfConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_upstream_sources() {
        let settings = Settings::default();
        assert_eq!(settings.manifest_url, DEFAULT_MANIFEST_URL);
        assert_eq!(settings.docs_home, DEFAULT_DOCS_HOME);
        assert_eq!(settings.sync_interval, Duration::from_secs(600));
        assert_eq!(settings.download_timeout_ms, 1_800_000);
        assert_eq!(
            settings.page_url("5.2"),
            "https://docs.djangoproject.com/en/5.2/"
        );
        assert_eq!(
            settings.conventional_archive_url("4.2"),
            "https://media.djangoproject.com/docs/django-docs-4.2-en.zip"
        );
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, ShelfConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[sources]
manifest_url = "https://mirror.example/manifest.json"
docs_home = "https://docs.example/"

[http]
user_agent = "test-agent/1.0"
timeout_ms = 1500
download_timeout_ms = 90000

[sync]
min_interval_secs = 30
"#,
        )
        .expect("write config");

        let settings = load_config(&config_path)
            .expect("load config")
            .resolve_with_lookup(|_| None);
        assert_eq!(settings.manifest_url, "https://mirror.example/manifest.json");
        assert_eq!(settings.page_url("dev"), "https://docs.example/en/dev/");
        assert_eq!(settings.user_agent, "test-agent/1.0");
        assert_eq!(settings.timeout_ms, 1500);
        assert_eq!(settings.download_timeout_ms, 90_000);
        assert_eq!(settings.sync_interval, Duration::from_secs(30));
        assert_eq!(settings.archive_url_template, DEFAULT_ARCHIVE_URL_TEMPLATE);
    }

    #[test]
    fn env_overrides_config_values() {
        let config = ShelfConfig {
            sources: SourcesSection {
                manifest_url: Some("https://file.example/manifest.json".to_string()),
                ..SourcesSection::default()
            },
            sync: SyncSection {
                min_interval_secs: Some(30),
            },
            ..ShelfConfig::default()
        };
        let settings = config.resolve_with_lookup(|key| match key {
            "DOCSHELF_MANIFEST_URL" => Some(" https://env.example/manifest.json ".to_string()),
            "DOCSHELF_SYNC_INTERVAL_SECS" => Some("not-a-number".to_string()),
            "DOCSHELF_USER_AGENT" => Some("   ".to_string()),
            "DOCSHELF_DOWNLOAD_TIMEOUT_MS" => Some("120000".to_string()),
            _ => None,
        });
        assert_eq!(settings.manifest_url, "https://env.example/manifest.json");
        assert_eq!(settings.sync_interval, Duration::from_secs(30));
        assert_eq!(settings.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(settings.download_timeout_ms, 120_000);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[sources\nmanifest_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
