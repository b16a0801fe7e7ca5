/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* Runtime settings for the audit and migration pipeline. Settings are built
* from defaults, then an optional JSON settings file, then command-line flags.
* The file is deserialized with serde into strongly-typed structs so invalid
* values are rejected before any cluster or cloud call is made.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_VOLUME_TYPE: &str = "gp3";
pub const DEFAULT_STATE_DIR: &str = ".pv-encrypter-state";

/// How long and how often to poll snapshot progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(2 * 3600),
        }
    }
}

impl WaitPolicy {
    /// The instant at which a wait started now gives up.
    pub fn deadline(&self) -> Result<Instant> {
        Instant::now()
            .checked_add(self.max_wait)
            .ok_or_else(|| Error::InvalidDuration(format!("{:?}", self.max_wait)))
    }
}

/// Exponential backoff for scale operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// The single region used for the EC2 client and for same-region snapshot copies.
    pub region: String,
    pub profile: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub wait: WaitPolicy,
    pub retry: RetryPolicy,
    /// Upper bound on how long a deleted PV or PVC may take to disappear.
    pub deletion_timeout: Duration,
    pub volume_type: String,
    pub state_dir: PathBuf,
    /// Owner groups migrated at the same time.
    pub concurrency: usize,
}

impl Settings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            profile: None,
            kubeconfig: None,
            wait: WaitPolicy::default(),
            retry: RetryPolicy::default(),
            deletion_timeout: Duration::from_secs(300),
            volume_type: DEFAULT_VOLUME_TYPE.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            concurrency: 1,
        }
    }

    /// Applies the values present in a settings file on top of `self`.
    pub fn merge_file(mut self, file: SettingsFile) -> Result<Self> {
        if let Some(region) = file.region {
            self.region = region;
        }
        if file.profile.is_some() {
            self.profile = file.profile;
        }
        if let Some(path) = file.kubeconfig {
            self.kubeconfig = Some(path);
        }
        if let Some(s) = file.poll_interval.as_deref() {
            self.wait.poll_interval = parse_duration_str(s)?;
        }
        if let Some(s) = file.max_wait.as_deref() {
            self.wait.max_wait = parse_duration_str(s)?;
        }
        if let Some(attempts) = file.scale_attempts {
            self.retry.attempts = attempts;
        }
        if let Some(s) = file.scale_backoff.as_deref() {
            self.retry.initial_delay = parse_duration_str(s)?;
        }
        if let Some(s) = file.deletion_timeout.as_deref() {
            self.deletion_timeout = parse_duration_str(s)?;
        }
        if let Some(volume_type) = file.volume_type {
            self.volume_type = volume_type;
        }
        if let Some(dir) = file.state_dir {
            self.state_dir = dir;
        }
        if let Some(concurrency) = file.concurrency {
            self.concurrency = concurrency;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            return Err(Error::Config("a region is required (set AWS_REGION or --region)".into()));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("scale attempts must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.wait.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".into()));
        }
        self.wait.deadline()?;
        Ok(())
    }
}

/// The optional JSON settings file. Every field is optional so a file only
/// needs to carry the values it overrides.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsFile {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub poll_interval: Option<String>,
    pub max_wait: Option<String>,
    pub scale_attempts: Option<u32>,
    pub scale_backoff: Option<String>,
    pub deletion_timeout: Option<String>,
    pub volume_type: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Parses a simple duration string (e.g., "1m", "30s") into a `Duration`.
pub fn parse_duration_str(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || Error::InvalidDuration(s.to_string());
    let (num_str, unit) = if let Some(num_str) = s.strip_suffix('s') {
        (num_str, 1)
    } else if let Some(num_str) = s.strip_suffix('m') {
        (num_str, 60)
    } else if let Some(num_str) = s.strip_suffix('h') {
        (num_str, 3600)
    } else {
        return Err(invalid());
    };
    let value = num_str.parse::<u64>().map_err(|_| invalid())?;
    let secs = value.checked_mul(unit).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_str() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_str("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration_str(" 10s ").unwrap(), Duration::from_secs(10));

        assert!(parse_duration_str("invalid").is_err());
        assert!(parse_duration_str("30x").is_err());
        assert!(parse_duration_str("s").is_err());
    }

    #[test]
    fn test_parse_duration_str_rejects_overflow() {
        let max_hours = u64::MAX / 3600;
        assert!(parse_duration_str(&format!("{}h", max_hours)).is_ok());
        assert!(matches!(
            parse_duration_str(&format!("{}h", max_hours + 1)),
            Err(Error::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration_str(&format!("{}m", u64::MAX)),
            Err(Error::InvalidDuration(_))
        ));
        assert_eq!(parse_duration_str(&format!("{}s", u64::MAX)).unwrap(), Duration::from_secs(u64::MAX));
    }

    #[tokio::test]
    async fn test_deadline_rejects_unrepresentable_wait() {
        let policy = WaitPolicy {
            poll_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(u64::MAX),
        };
        assert!(matches!(policy.deadline(), Err(Error::InvalidDuration(_))));
        assert!(WaitPolicy::default().deadline().is_ok());
    }

    #[test]
    fn test_settings_file_overrides_defaults() {
        let file: SettingsFile = serde_json::from_str(
            r#"{ "region": "eu-west-1", "maxWait": "30m", "scaleAttempts": 3, "volumeType": "gp2" }"#,
        )
        .unwrap();

        let settings = Settings::new("us-east-1").merge_file(file).unwrap();
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.wait.max_wait, Duration::from_secs(1800));
        assert_eq!(settings.wait.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.retry.attempts, 3);
        assert_eq!(settings.volume_type, "gp2");
    }

    #[test]
    fn test_settings_file_rejects_unknown_fields() {
        let parsed = serde_json::from_str::<SettingsFile>(r#"{ "regoin": "eu-west-1" }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(Settings::new("us-east-1").validate().is_ok());
        assert!(Settings::new("").validate().is_err());

        let mut settings = Settings::new("us-east-1");
        settings.concurrency = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new("us-east-1");
        settings.wait.max_wait = Duration::from_secs(u64::MAX);
        assert!(matches!(settings.validate(), Err(Error::InvalidDuration(_))));
    }
}
