use anyhow::{anyhow, Context};
use bounce_classify::{BounceClassifier, BounceClassifierBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ONE_MINUTE: Duration = Duration::from_secs(60);

/// Daemon level configuration, loaded from TOML. The sending policy
/// itself arrives separately as a settings update.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Where the sender state is persisted
    #[serde(default = "DaemonConfig::default_state_path")]
    pub state_path: PathBuf,

    /// A JSON settings update applied at startup and again on SIGHUP
    #[serde(default)]
    pub settings_path: Option<PathBuf>,

    /// Additional bounce classification rule files, TOML or JSON,
    /// merged over the built-in rules
    #[serde(default)]
    pub bounce_rules: Vec<PathBuf>,

    /// Base URL of the management plane. Without it, events and
    /// reports are discarded.
    #[serde(default)]
    pub upstream_url: Option<String>,

    #[serde(default)]
    pub access_key: String,

    /// Idle connections are closed after this long
    #[serde(
        default = "DaemonConfig::default_idle_timeout",
        with = "humantime_serde"
    )]
    pub idle_timeout: Duration,

    #[serde(
        default = "DaemonConfig::default_reaper_interval",
        with = "humantime_serde"
    )]
    pub reaper_interval: Duration,

    /// Minimum spacing of state snapshots taken after deliveries
    #[serde(
        default = "DaemonConfig::default_persist_min_interval",
        with = "humantime_serde"
    )]
    pub persist_min_interval: Duration,

    /// How long MX and address lookups are cached
    #[serde(default = "DaemonConfig::default_dns_ttl", with = "humantime_serde")]
    pub dns_ttl: Duration,

    #[serde(default = "DaemonConfig::default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default = "DaemonConfig::default_event_batch_size")]
    pub event_batch_size: usize,

    #[serde(
        default = "DaemonConfig::default_event_flush_interval",
        with = "humantime_serde"
    )]
    pub event_flush_interval: Duration,

    #[serde(default = "DaemonConfig::default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    #[serde(default = "DaemonConfig::default_queue_interval", with = "humantime_serde")]
    pub queue_interval: Duration,

    #[serde(
        default = "DaemonConfig::default_limits_interval",
        with = "humantime_serde"
    )]
    pub limits_interval: Duration,

    /// Events that could not be posted are kept here across restarts
    #[serde(default)]
    pub saved_events_path: Option<PathBuf>,

    /// Defer keys whose delivery rate falls below the profile's
    /// target. Only profiles with `ratedefer` set are affected.
    #[serde(default)]
    pub rate_deferral: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_path: Self::default_state_path(),
            settings_path: None,
            bounce_rules: vec![],
            upstream_url: None,
            access_key: String::new(),
            idle_timeout: Self::default_idle_timeout(),
            reaper_interval: Self::default_reaper_interval(),
            persist_min_interval: Self::default_persist_min_interval(),
            dns_ttl: Self::default_dns_ttl(),
            event_channel_capacity: Self::default_event_channel_capacity(),
            event_batch_size: Self::default_event_batch_size(),
            event_flush_interval: Self::default_event_flush_interval(),
            stats_interval: Self::default_stats_interval(),
            queue_interval: Self::default_queue_interval(),
            limits_interval: Self::default_limits_interval(),
            saved_events_path: None,
            rate_deferral: false,
        }
    }
}

impl DaemonConfig {
    fn default_state_path() -> PathBuf {
        "/var/spool/egressd/state.json".into()
    }

    fn default_idle_timeout() -> Duration {
        Duration::from_secs(4)
    }

    fn default_reaper_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_persist_min_interval() -> Duration {
        Duration::from_millis(200)
    }

    fn default_dns_ttl() -> Duration {
        Duration::from_secs(8 * 3600)
    }

    fn default_event_channel_capacity() -> usize {
        10240
    }

    fn default_event_batch_size() -> usize {
        1024
    }

    fn default_event_flush_interval() -> Duration {
        Duration::from_secs(123)
    }

    fn default_stats_interval() -> Duration {
        ONE_MINUTE
    }

    fn default_queue_interval() -> Duration {
        Duration::from_secs(91)
    }

    fn default_limits_interval() -> Duration {
        Duration::from_secs(259)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// The built-in bounce rules extended by `bounce_rules`
    pub fn bounce_classifier(&self) -> anyhow::Result<BounceClassifier> {
        let mut builder = BounceClassifierBuilder::with_default_rules().map_err(|err| anyhow!(err))?;
        for path in &self.bounce_rules {
            let file_name = path.to_string_lossy();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => builder.merge_json_file(&file_name),
                Some("toml") => builder.merge_toml_file(&file_name),
                _ => anyhow::bail!(
                    "{file_name}: classifier files must have either .toml or .json filename extension"
                ),
            }
            .map_err(|err| anyhow!(err))?;
        }
        builder.build().map_err(|err| anyhow!(err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        k9::assert_equal!(config, DaemonConfig::default());
        assert_eq!(config.idle_timeout, Duration::from_secs(4));
        assert_eq!(config.dns_ttl, Duration::from_secs(28800));
        assert!(!config.rate_deferral);
    }

    #[test]
    fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("egressd.toml");
        std::fs::write(
            &path,
            r#"
state_path = "/tmp/state.json"
settings_path = "/etc/egressd/settings.json"
bounce_rules = ["/etc/egressd/rules.toml"]
upstream_url = "https://mgmt.example.com"
access_key = "secret"
idle_timeout = "10s"
dns_ttl = "1h"
event_flush_interval = "2m 3s"
rate_deferral = true
"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.state_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(
            config.settings_path,
            Some(PathBuf::from("/etc/egressd/settings.json"))
        );
        assert_eq!(config.bounce_rules.len(), 1);
        assert_eq!(config.upstream_url.as_deref(), Some("https://mgmt.example.com"));
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.dns_ttl, Duration::from_secs(3600));
        assert_eq!(config.event_flush_interval, Duration::from_secs(123));
        assert_eq!(config.queue_interval, Duration::from_secs(91));
        assert!(config.rate_deferral);
    }

    #[test]
    fn extra_bounce_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.toml");
        std::fs::write(
            &rules,
            "[rules]\nInvalidRecipient = [\"^550 no such luser\"]\n",
        )
        .unwrap();

        let config = DaemonConfig {
            bounce_rules: vec![rules],
            ..Default::default()
        };
        let classifier = config.bounce_classifier().unwrap();
        assert!(classifier.classify_str("550 no such luser here").is_hard_bounce());

        let config = DaemonConfig {
            bounce_rules: vec![dir.path().join("rules.yaml")],
            ..Default::default()
        };
        assert!(config.bounce_classifier().is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = toml::from_str::<DaemonConfig>("idle_timout = \"4s\"").unwrap_err();
        assert!(err.to_string().contains("idle_timout"), "{err}");

        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading config"));
    }
}
