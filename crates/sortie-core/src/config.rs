//! Daemon configuration, loaded from `sortie.toml` plus environment.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Allowed range for `max_concurrent`.
pub const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<usize> = 1..=10;

/// Smallest accepted poll interval.
pub const MIN_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("github_repo is not set (GITHUB_REPO)")]
    MissingGithubRepo,
    #[error("github_repo must be owner/name, got {0:?}")]
    InvalidGithubRepo(String),
    #[error("neither repo_url nor repo_path is set (REPO_URL / REPO_PATH)")]
    MissingRepoSource,
    #[error("max_concurrent must be between 1 and 10, got {0}")]
    MaxConcurrentOutOfRange(usize),
    #[error("poll_interval_secs must be at least 60, got {0}")]
    PollIntervalTooShort(u64),
    #[error("no GitHub token (GITHUB_TOKEN or GH_TOKEN)")]
    MissingGithubToken,
    #[error("no model credentials (CLAUDE_API_KEY, ANTHROPIC_API_KEY, or ~/.claude/.credentials.json)")]
    MissingModelCredentials,
}

/// Container settings for each execution unit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    /// Non-root user the agent runs as. Its home holds the credentials mount.
    pub user: String,
    pub network: String,
    /// Memory limit in MB. Unlimited when unset.
    pub memory_limit_mb: Option<u64>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "sortie-agent:latest".into(),
            user: "claude".into(),
            network: "bridge".into(),
            memory_limit_mb: None,
        }
    }
}

impl ContainerConfig {
    /// Home directory of the container user.
    pub fn home(&self) -> PathBuf {
        if self.user == "root" {
            PathBuf::from("/root")
        } else {
            PathBuf::from("/home").join(&self.user)
        }
    }
}

/// Credentials read from the environment. Never read from the config file.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub github_token: Option<String>,
    pub api_key: Option<String>,
    /// Host path of the CLI OAuth credentials file, when present.
    pub credentials_file: Option<PathBuf>,
}

impl Secrets {
    /// Resolve secrets through `lookup` (normally `std::env::var`).
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>, home: Option<&Path>) -> Self {
        let first = |names: &[&str]| {
            names
                .iter()
                .copied()
                .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
        };
        let credentials_file = home
            .map(|h| h.join(".claude").join(".credentials.json"))
            .filter(|p| p.is_file());
        Self {
            github_token: first(&["GITHUB_TOKEN", "GH_TOKEN"]),
            api_key: first(&["CLAUDE_API_KEY", "ANTHROPIC_API_KEY"]),
            credentials_file,
        }
    }

    pub fn has_model_credentials(&self) -> bool {
        self.api_key.is_some() || self.credentials_file.is_some()
    }
}

fn mask(value: &Option<String>) -> &'static str {
    if value.is_some() { "***" } else { "<unset>" }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("github_token", &mask(&self.github_token))
            .field("api_key", &mask(&self.api_key))
            .field("credentials_file", &self.credentials_file)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Tracker repository as `owner/name`.
    pub github_repo: String,
    pub repo_url: Option<String>,
    /// Use an existing local clone instead of cloning `repo_url`.
    pub repo_path: Option<PathBuf>,
    pub worktree_base: PathBuf,
    pub repo_cache: PathBuf,
    pub poll_interval_secs: u64,
    pub max_concurrent: usize,
    pub snapshot_interval_secs: u64,
    pub dispatch_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub db_path: PathBuf,
    pub api_bind: String,
    pub label: String,
    pub implement_label: String,
    pub log_file: Option<PathBuf>,
    pub container: ContainerConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            github_repo: String::new(),
            repo_url: None,
            repo_path: None,
            worktree_base: PathBuf::from("/tmp/sortie-worktrees"),
            repo_cache: PathBuf::from("/tmp/sortie-repos"),
            poll_interval_secs: 600,
            max_concurrent: 3,
            snapshot_interval_secs: 60,
            dispatch_interval_ms: 1000,
            shutdown_grace_secs: 5,
            db_path: PathBuf::from("/tmp/sortie.redb"),
            api_bind: "127.0.0.1:7878".into(),
            label: "Claude".into(),
            implement_label: "Implement".into(),
            log_file: None,
            container: ContainerConfig::default(),
            secrets: Secrets::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file. Returns defaults if the file doesn't exist.
    ///
    /// Environment overrides and secrets are not applied here; see
    /// [`apply_env`](Self::apply_env).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .context(format!("failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .context(format!("failed to parse config: {}", path.display()))?;
        tracing::info!(path = %path.display(), repo = %config.github_repo, "loaded config");
        Ok(config)
    }

    /// Load the file, then overlay the process environment.
    pub fn from_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|k| std::env::var(k).ok(), dirs::home_dir().as_deref())?;
        Ok(config)
    }

    /// Overlay environment overrides and resolve secrets.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
        home: Option<&Path>,
    ) -> Result<()> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GITHUB_REPO") {
            self.github_repo = v;
        }
        if let Some(v) = get("REPO_URL") {
            self.repo_url = Some(v);
        }
        if let Some(v) = get("REPO_PATH") {
            self.repo_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("WORKTREE_BASE") {
            self.worktree_base = PathBuf::from(v);
        }
        if let Some(v) = get("REPO_CACHE") {
            self.repo_cache = PathBuf::from(v);
        }
        if let Some(v) = get("POLL_INTERVAL") {
            self.poll_interval_secs = v
                .trim()
                .parse()
                .context(format!("POLL_INTERVAL is not a number: {v}"))?;
        }
        if let Some(v) = get("MAX_CONCURRENT") {
            self.max_concurrent = v
                .trim()
                .parse()
                .context(format!("MAX_CONCURRENT is not a number: {v}"))?;
        }
        if let Some(v) = get("STATE_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("SORTIE_API") {
            self.api_bind = v;
        }

        self.secrets = Secrets::resolve(&lookup, home);
        Ok(())
    }

    /// Check the settings the daemon cannot run without.
    ///
    /// With `dry_run` the credential checks are skipped.
    pub fn validate(&self, dry_run: bool) -> Result<(), ConfigError> {
        if self.github_repo.is_empty() {
            return Err(ConfigError::MissingGithubRepo);
        }
        match self.github_repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
            _ => return Err(ConfigError::InvalidGithubRepo(self.github_repo.clone())),
        }
        if self.repo_url.is_none() && self.repo_path.is_none() {
            return Err(ConfigError::MissingRepoSource);
        }
        if !MAX_CONCURRENT_RANGE.contains(&self.max_concurrent) {
            return Err(ConfigError::MaxConcurrentOutOfRange(self.max_concurrent));
        }
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigError::PollIntervalTooShort(self.poll_interval_secs));
        }
        if dry_run {
            return Ok(());
        }
        if self.secrets.github_token.is_none() {
            return Err(ConfigError::MissingGithubToken);
        }
        if !self.secrets.has_model_credentials() {
            return Err(ConfigError::MissingModelCredentials);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn valid() -> DaemonConfig {
        let mut config = DaemonConfig {
            github_repo: "acme/widgets".into(),
            repo_url: Some("https://github.com/acme/widgets.git".into()),
            ..Default::default()
        };
        config
            .apply_env(env(&[("GH_TOKEN", "ghp_x"), ("ANTHROPIC_API_KEY", "sk-y")]), None)
            .unwrap();
        config
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.poll_interval_secs, 600);
        assert_eq!(config.container.image, "sortie-agent:latest");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sortie.toml");
        std::fs::write(
            &path,
            r#"
github_repo = "acme/widgets"
repo_path = "/srv/widgets"
max_concurrent = 5

[container]
image = "agent:dev"
memory_limit_mb = 2048
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.repo_path, Some(PathBuf::from("/srv/widgets")));
        assert_eq!(config.container.image, "agent:dev");
        assert_eq!(config.container.user, "claude");
        assert_eq!(config.container.memory_limit_mb, Some(2048));
        assert_eq!(config.label, "Claude");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = DaemonConfig::default();
        config
            .apply_env(
                env(&[
                    ("GITHUB_REPO", "o/r"),
                    ("MAX_CONCURRENT", "7"),
                    ("POLL_INTERVAL", "120"),
                    ("STATE_DB", "/var/lib/sortie.redb"),
                ]),
                None,
            )
            .unwrap();
        assert_eq!(config.github_repo, "o/r");
        assert_eq!(config.max_concurrent, 7);
        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/sortie.redb"));
    }

    #[test]
    fn bad_number_in_env_is_an_error() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_env(env(&[("MAX_CONCURRENT", "lots")]), None)
            .unwrap_err();
        assert!(err.to_string().contains("MAX_CONCURRENT"));
    }

    #[test]
    fn github_token_preferred_over_gh_token() {
        let secrets = Secrets::resolve(env(&[("GITHUB_TOKEN", "a"), ("GH_TOKEN", "b")]), None);
        assert_eq!(secrets.github_token.as_deref(), Some("a"));
        let secrets = Secrets::resolve(env(&[("GITHUB_TOKEN", " "), ("GH_TOKEN", "b")]), None);
        assert_eq!(secrets.github_token.as_deref(), Some("b"));
    }

    #[test]
    fn credentials_file_detected_under_home() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(home.path().join(".claude/.credentials.json"), "{}").unwrap();

        let secrets = Secrets::resolve(env(&[]), Some(home.path()));
        assert!(secrets.credentials_file.is_some());
        assert!(secrets.has_model_credentials());
    }

    #[test]
    fn debug_masks_secrets() {
        let secrets = Secrets::resolve(env(&[("GITHUB_TOKEN", "ghp_secret")]), None);
        let printed = format!("{secrets:?}");
        assert!(!printed.contains("ghp_secret"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn validate_rules() {
        assert_eq!(valid().validate(false), Ok(()));

        let mut c = valid();
        c.github_repo = "widgets".into();
        assert!(matches!(c.validate(false), Err(ConfigError::InvalidGithubRepo(_))));

        let mut c = valid();
        c.repo_url = None;
        assert_eq!(c.validate(false), Err(ConfigError::MissingRepoSource));

        let mut c = valid();
        c.max_concurrent = 11;
        assert_eq!(c.validate(false), Err(ConfigError::MaxConcurrentOutOfRange(11)));

        let mut c = valid();
        c.poll_interval_secs = 30;
        assert_eq!(c.validate(false), Err(ConfigError::PollIntervalTooShort(30)));

        let mut c = valid();
        c.secrets.api_key = None;
        assert_eq!(c.validate(false), Err(ConfigError::MissingModelCredentials));
        assert_eq!(c.validate(true), Ok(()));
    }

    #[test]
    fn container_home_follows_user() {
        assert_eq!(ContainerConfig::default().home(), PathBuf::from("/home/claude"));
        let root = ContainerConfig {
            user: "root".into(),
            ..Default::default()
        };
        assert_eq!(root.home(), PathBuf::from("/root"));
    }
}
