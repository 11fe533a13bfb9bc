use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use mailsync_content::HeuristicRules;
use mailsync_core::credentials::CREDENTIAL_KEY_ENV_VAR;
use mailsync_mail::{AccountPreferences, SyncOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct MailsyncConfig {
    pub(crate) database: String,
    /// Owner recorded on accounts added without --owner.
    pub(crate) owner: String,
    pub(crate) credential_key_env: String,
    pub(crate) sync: SyncConfig,
    pub(crate) heuristics: HeuristicRules,
}

impl Default for MailsyncConfig {
    fn default() -> Self {
        Self {
            database: "mailsync.db".to_string(),
            owner: "local".to_string(),
            credential_key_env: CREDENTIAL_KEY_ENV_VAR.to_string(),
            sync: SyncConfig::default(),
            heuristics: HeuristicRules::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct SyncConfig {
    pub(crate) batch_size: usize,
    pub(crate) timeout_secs: u64,
    pub(crate) poll_seconds: u64,
    pub(crate) lookback_days: Option<u32>,
    pub(crate) frequency_minutes: Option<u32>,
    pub(crate) sync_sent: Option<bool>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            timeout_secs: 30,
            poll_seconds: 60,
            lookback_days: None,
            frequency_minutes: None,
            sync_sent: None,
        }
    }
}

impl SyncConfig {
    pub(crate) fn options(&self) -> SyncOptions {
        SyncOptions {
            batch_size: self.batch_size.max(1),
            attempt_timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }

    /// Account defaults layered under whatever the command line sets.
    pub(crate) fn preference_defaults(&self) -> AccountPreferences {
        AccountPreferences {
            lookback_days: self.lookback_days,
            frequency_minutes: self.frequency_minutes,
            sync_sent: self.sync_sent,
            ..AccountPreferences::default()
        }
    }
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailsync.toml"),
        xdg_config_dir().join("mailsync").join("mailsync.toml"),
    ]
}

pub(crate) fn parse_config(text: &str) -> Result<MailsyncConfig> {
    toml::from_str(text).context("invalid mailsync config")
}

/// An explicit path must exist; otherwise the first candidate found wins and
/// defaults apply when there is none.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<MailsyncConfig> {
    if let Some(path) = explicit {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        return parse_config(&text);
    }
    for path in config_path_candidates() {
        if let Ok(text) = std::fs::read_to_string(&path) {
            tracing::debug!(path = %path.display(), "loaded config");
            return parse_config(&text);
        }
    }
    Ok(MailsyncConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.database, "mailsync.db");
        assert_eq!(config.credential_key_env, "MAILSYNC_CREDENTIAL_KEY");
        assert_eq!(config.sync.options().batch_size, 50);
        assert_eq!(config.heuristics, HeuristicRules::default());
    }

    #[test]
    fn parses_sync_and_heuristic_sections() {
        let config = parse_config(
            r#"
database = "/var/lib/mailsync/mail.db"
credential_key_env = "MY_KEY"

[sync]
batch_size = 10
timeout_secs = 5
lookback_days = 7

[heuristics]
meeting_keywords = ["standup"]
max_action_items = 2
"#,
        )
        .unwrap();
        assert_eq!(config.database, "/var/lib/mailsync/mail.db");
        assert_eq!(config.credential_key_env, "MY_KEY");
        let options = config.sync.options();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.sync.preference_defaults().lookback_days, Some(7));
        assert_eq!(config.heuristics.meeting_keywords, vec!["standup"]);
        assert_eq!(config.heuristics.max_action_items, 2);
        assert!(!config.heuristics.date_patterns.is_empty());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(parse_config("database = [").is_err());
    }
}
