//! Configuration loading and validation.
//!
//! The config document is YAML; `METARELAY_SUPABASE_URL` and
//! `METARELAY_SUPABASE_KEY` override the matching `cloud` values so
//! credentials can stay out of the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::models::{HandlerConfig, RepoConfig};

pub const DEFAULT_CONFIG_PATH: &str = "~/.metarelay/config.yaml";
const DEFAULT_DB_PATH: &str = "~/.metarelay/metarelay.db";

pub const ENV_SUPABASE_URL: &str = "METARELAY_SUPABASE_URL";
pub const ENV_SUPABASE_KEY: &str = "METARELAY_SUPABASE_KEY";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct MetarelayConfig {
    pub cloud: CloudConfig,
    pub repos: Vec<RepoConfig>,
    pub handlers: Vec<HandlerConfig>,
    pub db_path: PathBuf,
    pub log_level: String,
    pub concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cloud: CloudConfig,
    #[serde(default)]
    repos: Vec<RepoEntry>,
    #[serde(default)]
    handlers: Vec<HandlerConfig>,
    #[serde(default)]
    db_path: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    concurrency: Option<usize>,
}

/// Repos are written either as a bare `owner/name` string or as a mapping
/// with a local `path` for the event journal.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RepoEntry {
    Name(String),
    Full(RepoConfig),
}

impl RepoEntry {
    fn into_repo(self) -> RepoConfig {
        match self {
            Self::Name(name) => RepoConfig { name, path: None },
            Self::Full(repo) => repo,
        }
    }
}

/// Loads and validates the configuration document at `path` (or the
/// default location). Fatal on any problem; config errors never surface at
/// runtime.
pub fn load_config(path: Option<&Path>) -> Result<MetarelayConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => expand_home(Path::new(DEFAULT_CONFIG_PATH)),
    };
    if !config_path.exists() {
        return Err(ConfigError::NotFound(config_path));
    }

    let raw_text = std::fs::read_to_string(&config_path)?;
    let raw: RawConfig = serde_yaml::from_str(&raw_text)?;
    build_config(raw)
}

fn build_config(raw: RawConfig) -> Result<MetarelayConfig, ConfigError> {
    let mut cloud = raw.cloud;
    if let Some(url) = non_empty_env(ENV_SUPABASE_URL) {
        cloud.url = url;
    }
    if let Some(key) = non_empty_env(ENV_SUPABASE_KEY) {
        cloud.key = key;
    }
    if cloud.url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "cloud.url is required (or set METARELAY_SUPABASE_URL)".to_string(),
        ));
    }
    if cloud.key.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "cloud.key is required (or set METARELAY_SUPABASE_KEY)".to_string(),
        ));
    }
    cloud.url = cloud.url.trim_end_matches('/').to_string();

    let repos = raw
        .repos
        .into_iter()
        .map(RepoEntry::into_repo)
        .map(|mut repo| {
            validate_repo_name(&repo.name)?;
            repo.path = repo.path.map(|path| expand_home(&path));
            Ok(repo)
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let concurrency = raw.concurrency.unwrap_or(4);
    if concurrency == 0 {
        return Err(ConfigError::Invalid(
            "concurrency must be greater than 0".to_string(),
        ));
    }

    let db_path = expand_home(Path::new(
        raw.db_path.as_deref().unwrap_or(DEFAULT_DB_PATH),
    ));

    Ok(MetarelayConfig {
        cloud,
        repos,
        handlers: raw.handlers,
        db_path,
        log_level: raw.log_level.unwrap_or_else(|| "info".to_string()),
        concurrency,
    })
}

fn validate_repo_name(name: &str) -> Result<(), ConfigError> {
    let mut parts = name.split('/');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty()
    );
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "invalid repo format '{name}': expected 'owner/repo'"
        )))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(rest) = path.to_str().and_then(|text| text.strip_prefix("~/")) else {
        return path.to_path_buf();
    };
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => Path::new(&home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_from_str(text: &str) -> RawConfig {
        serde_yaml::from_str(text).expect("parse raw config")
    }

    #[test]
    fn parses_full_document() {
        let raw = raw_from_str(
            r#"
cloud:
  url: https://proj.supabase.co/
  key: service-key-value
repos:
  - octo/widgets
  - name: octo/gadgets
    path: /srv/gadgets
handlers:
  - name: on-red-ci
    event_type: check_run
    action: completed
    command: "notify {{repo}}"
    filters: ["payload.conclusion == 'failure'"]
    timeout: 60
db_path: /tmp/relay.db
concurrency: 8
"#,
        );
        let config = build_config(raw).expect("build config");
        assert_eq!(config.cloud.url, "https://proj.supabase.co");
        assert_eq!(config.repos.len(), 2);
        assert_eq!(config.repos[0].name, "octo/widgets");
        assert!(config.repos[0].path.is_none());
        assert_eq!(
            config.repos[1].path.as_deref(),
            Some(Path::new("/srv/gadgets"))
        );
        assert_eq!(config.handlers[0].timeout_seconds, 60);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn rejects_malformed_repo_names() {
        for name in ["widgets", "octo/", "/widgets", "a/b/c"] {
            let raw = raw_from_str(&format!(
                "cloud: {{url: u, key: k}}\nrepos: [\"{name}\"]\n"
            ));
            assert!(
                matches!(build_config(raw), Err(ConfigError::Invalid(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_cloud_credentials() {
        let raw = raw_from_str("repos: [octo/widgets]\n");
        assert!(matches!(build_config(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let raw = raw_from_str("cloud: {url: u, key: k}\nconcurrency: 0\n");
        assert!(matches!(build_config(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = load_config(Some(Path::new("/nonexistent/metarelay.yaml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
