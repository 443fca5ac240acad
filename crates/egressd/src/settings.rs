//! Per-profile sending policy as delivered by the management plane.
//!
//! Field names follow the compact wire names used by the management
//! plane, so these types are deserialized from JSON as-is.
use crate::glob::glob_match;
use crate::keys::LimitKey;
use crate::limits::DeferReason;
use crate::warmup::Warmup;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, Utc};
use ordermap::OrderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MtaSettings {
    /// Static connection cap per (IP, MX suffix)
    #[serde(default = "MtaSettings::default_numconns")]
    pub numconns: usize,
    /// Connection caps for specific MX suffixes or glob patterns
    #[serde(default)]
    pub customnumconns: BTreeMap<String, usize>,
    /// Maximum age, in hours, of a message that may still be retried
    #[serde(default)]
    pub retryfor: u64,
    /// Maximum messages per connection before it is re-established;
    /// 0 means unlimited
    #[serde(default)]
    pub sendsperconn: u32,
    #[serde(default = "MtaSettings::default_wait_secs")]
    pub deferwaitsecs: Vec<u64>,
    /// Wait tables for replies containing the given lowercase text
    #[serde(default)]
    pub customwaitsecs: BTreeMap<String, Vec<u64>>,
    #[serde(default = "MtaSettings::default_wait_secs")]
    pub connerrwaitsecs: Vec<u64>,
    #[serde(default)]
    pub ipsettings: IpSettings,
    /// IP to domain assignment; the keys are the usable sending IPs
    #[serde(default)]
    pub ipdomains: BTreeMap<String, IpDomains>,
    /// Lowercase text that marks a reply as a transient hiccup: the
    /// message is retried without deferring the destination
    #[serde(default)]
    pub transient: BTreeMap<String, bool>,

    #[serde(default)]
    pub ratedefer: bool,
    #[serde(default)]
    pub ratedefercheckmins: usize,
    #[serde(default)]
    pub ratedefertarget: u64,
    #[serde(default)]
    pub ratedeferwaitsecs: Vec<u64>,

    #[serde(skip)]
    pub(crate) cap_time: Option<DateTime<FixedOffset>>,
}

impl Default for MtaSettings {
    fn default() -> Self {
        Self {
            numconns: Self::default_numconns(),
            customnumconns: BTreeMap::new(),
            retryfor: 0,
            sendsperconn: 0,
            deferwaitsecs: Self::default_wait_secs(),
            customwaitsecs: BTreeMap::new(),
            connerrwaitsecs: Self::default_wait_secs(),
            ipsettings: IpSettings::default(),
            ipdomains: BTreeMap::new(),
            transient: BTreeMap::new(),
            ratedefer: false,
            ratedefercheckmins: 0,
            ratedefertarget: 0,
            ratedeferwaitsecs: vec![],
            cap_time: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IpSettings {
    /// When true, or when `iplist` is empty, every assigned IP is used
    /// and the global caps apply
    #[serde(default = "IpSettings::default_allips")]
    pub allips: bool,
    #[serde(default)]
    pub iplist: BTreeMap<String, IpSetting>,
    /// Empty for plain selection; any other value enables the
    /// minimum-volume policy
    #[serde(default)]
    pub algorithm: String,
    /// RFC 3339 timestamp whose time of day, in its own offset,
    /// is the daily counter boundary
    #[serde(default)]
    pub captime: String,
    pub sendcap: Option<u64>,
    pub sendrate: Option<u64>,
}

impl Default for IpSettings {
    fn default() -> Self {
        Self {
            allips: Self::default_allips(),
            iplist: BTreeMap::new(),
            algorithm: String::new(),
            captime: String::new(),
            sendcap: None,
            sendrate: None,
        }
    }
}

impl IpSettings {
    fn default_allips() -> bool {
        true
    }

    fn per_ip(&self) -> bool {
        !self.allips && !self.iplist.is_empty()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct IpSetting {
    #[serde(default)]
    pub selected: bool,
    #[serde(default)]
    pub mintype: MinType,
    #[serde(default)]
    pub minpct: u64,
    #[serde(default)]
    pub minnum: u64,
    pub sendcap: Option<u64>,
    pub sendrate: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MinType {
    /// Percentage of the destination's total volume
    Pct,
    /// Absolute message count
    #[default]
    #[serde(other)]
    Num,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct IpDomains {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub linkdomain: String,
}

impl IpDomains {
    pub fn link_domain(&self) -> &str {
        if self.linkdomain.is_empty() {
            &self.domain
        } else {
            &self.linkdomain
        }
    }
}

/// Identifies a (profile, destination, IP) to pause or force-start.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IpPause {
    pub settingsid: String,
    pub domaingroupid: String,
    pub ip: String,
    /// Paused keys are skipped; discarding keys also drop the message
    #[serde(default)]
    pub discard: bool,
}

impl IpPause {
    pub fn key(&self) -> LimitKey {
        LimitKey::new(&self.domaingroupid, &self.ip)
    }
}

/// A complete replacement of the sending policy.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub sinkid: String,
    #[serde(default)]
    pub mtasettings: BTreeMap<String, MtaSettings>,
    #[serde(default)]
    pub ippauses: Vec<IpPause>,
    #[serde(default)]
    pub warmups: OrderMap<String, Warmup>,
    #[serde(default)]
    pub forcestart: Vec<IpPause>,
    #[serde(default)]
    pub ipdomains: BTreeMap<String, IpDomains>,
    #[serde(default)]
    pub allips: Vec<String>,
    #[serde(default)]
    pub allsinks: Vec<String>,
}

impl SettingsUpdate {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing {} as a settings update", path.display()))
    }
}

impl MtaSettings {
    fn default_numconns() -> usize {
        1
    }

    fn default_wait_secs() -> Vec<u64> {
        vec![60]
    }

    /// Computes derived state; must be called whenever the
    /// settings are deserialized or replaced.
    pub fn prepare(&mut self) {
        self.cap_time = DateTime::parse_from_rfc3339(&self.ipsettings.captime).ok();
        if self.cap_time.is_none() && !self.ipsettings.captime.is_empty() {
            tracing::warn!(
                "invalid captime {:?}, using midnight UTC",
                self.ipsettings.captime
            );
        }
    }

    /// All IPs assigned to this profile, in a stable order
    pub fn all_ips(&self) -> impl Iterator<Item = &str> {
        self.ipdomains.keys().map(String::as_str)
    }

    /// Returns the IPs eligible to carry traffic for `destination`.
    /// `sent_for` reports the current daily send count for a key.
    pub fn candidate_ips<F>(&self, destination: &str, sent_for: F) -> Vec<String>
    where
        F: Fn(&LimitKey) -> u64,
    {
        let ips = &self.ipsettings;
        if !ips.per_ip() {
            return self.all_ips().map(str::to_string).collect();
        }

        let selected: Vec<(&String, &IpSetting)> = ips
            .iplist
            .iter()
            .filter(|(ip, setting)| setting.selected && self.ipdomains.contains_key(*ip))
            .collect();

        if ips.algorithm.is_empty() {
            return selected.into_iter().map(|(ip, _)| ip.clone()).collect();
        }

        // Minimum-volume policy: IPs that have not yet reached their
        // share of today's volume for this destination take priority.
        let total: u64 = self
            .all_ips()
            .map(|ip| sent_for(&LimitKey::new(destination, ip)))
            .sum();

        let under_target: Vec<String> = selected
            .iter()
            .filter(|(ip, setting)| {
                let sent = sent_for(&LimitKey::new(destination, ip.as_str())) as f64;
                let target = match setting.mintype {
                    MinType::Pct => total as f64 * (setting.minpct as f64 / 100.0),
                    MinType::Num => setting.minnum as f64,
                };
                sent < target
            })
            .map(|(ip, _)| (*ip).clone())
            .collect();

        if under_target.is_empty() {
            selected.into_iter().map(|(ip, _)| ip.clone()).collect()
        } else {
            under_target
        }
    }

    /// Maps an MX host name to its connection pool group.
    /// A `customnumconns` entry that is a suffix of, or a glob
    /// matching, the host wins; otherwise the last two labels.
    pub fn mx_suffix(&self, mx_host: &str) -> String {
        let mx = mx_host.strip_suffix('.').unwrap_or(mx_host);

        for pattern in self.customnumconns.keys() {
            if mx.ends_with(pattern.as_str()) || glob_match(pattern, mx) {
                return pattern.clone();
            }
        }

        let mut labels = mx.rsplitn(3, '.');
        match (labels.next(), labels.next(), labels.next()) {
            (Some(_), Some(_), Some(rest)) => mx[rest.len() + 1..].to_string(),
            _ => mx.to_string(),
        }
    }

    /// The static connection cap for an MX suffix group
    pub fn num_conns(&self, mx_suffix: &str) -> usize {
        self.customnumconns
            .get(mx_suffix)
            .copied()
            .unwrap_or(self.numconns)
    }

    /// Hourly cap for the key, if any
    pub fn send_rate(&self, key: &LimitKey) -> Option<u64> {
        if self.ipsettings.per_ip() {
            self.selected_setting(&key.ip)?.sendrate
        } else {
            self.ipsettings.sendrate
        }
    }

    /// Static daily cap for the key, if any
    pub fn ip_limit(&self, key: &LimitKey) -> Option<u64> {
        if self.ipsettings.per_ip() {
            self.selected_setting(&key.ip)?.sendcap
        } else {
            self.ipsettings.sendcap
        }
    }

    fn selected_setting(&self, ip: &str) -> Option<&IpSetting> {
        self.ipsettings.iplist.get(ip).filter(|s| s.selected)
    }

    /// The most recent daily boundary at or before `now`.
    pub fn day_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let (offset, time) = match &self.cap_time {
            Some(cap) => (*cap.offset(), cap.time()),
            None => (Utc.fix(), NaiveTime::MIN),
        };

        let local = now.with_timezone(&offset);
        let today = local.date_naive().and_time(time) - offset;
        let boundary = DateTime::<Utc>::from_naive_utc_and_offset(today, Utc);
        if boundary > now {
            boundary - Duration::days(1)
        } else {
            boundary
        }
    }

    /// The wait table for a deferral cause
    pub fn wait_secs(&self, reason: &DeferReason) -> &[u64] {
        match reason {
            DeferReason::ConnectionError => &self.connerrwaitsecs,
            DeferReason::Matched(bucket) => self
                .customwaitsecs
                .get(bucket)
                .unwrap_or(&self.deferwaitsecs),
            DeferReason::Rate => &self.ratedeferwaitsecs,
            DeferReason::Default => &self.deferwaitsecs,
        }
    }

    /// Returns the first `customwaitsecs` bucket contained in the
    /// lowercased reply text.
    pub fn matching_bucket(&self, lowered: &str) -> Option<&str> {
        self.customwaitsecs
            .keys()
            .find(|bucket| lowered.contains(bucket.as_str()))
            .map(String::as_str)
    }

    pub fn is_transient_text(&self, lowered: &str) -> bool {
        self.transient
            .keys()
            .any(|text| lowered.contains(text.as_str()))
    }

    pub fn retry_window(&self) -> Duration {
        Duration::hours(self.retryfor as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use maplit::btreemap;

    fn settings_json(json: serde_json::Value) -> MtaSettings {
        let mut settings: MtaSettings = serde_json::from_value(json).unwrap();
        settings.prepare();
        settings
    }

    #[test]
    fn mx_suffix() {
        let settings = settings_json(serde_json::json!({
            "customnumconns": {
                "outlook.com": 10,
                "*.yahoodns.net": 4,
            }
        }));

        assert_eq!(settings.mx_suffix("mx1.example.com."), "example.com");
        assert_eq!(settings.mx_suffix("example.com"), "example.com");
        assert_eq!(settings.mx_suffix("localhost"), "localhost");
        assert_eq!(
            settings.mx_suffix("example-com.mail.protection.outlook.com"),
            "outlook.com"
        );
        assert_eq!(
            settings.mx_suffix("mta5.am0.yahoodns.net"),
            "*.yahoodns.net"
        );
        assert_eq!(settings.num_conns("outlook.com"), 10);
        assert_eq!(settings.num_conns("example.com"), 1);
    }

    #[test]
    fn caps_global_and_per_ip() {
        let global = settings_json(serde_json::json!({
            "ipsettings": {"allips": true, "sendcap": 100, "sendrate": 10}
        }));
        let key = LimitKey::new("example.com", "10.0.0.1");
        assert_eq!(global.ip_limit(&key), Some(100));
        assert_eq!(global.send_rate(&key), Some(10));

        let per_ip = settings_json(serde_json::json!({
            "ipsettings": {
                "allips": false,
                "sendcap": 100,
                "iplist": {
                    "10.0.0.1": {"selected": true, "sendcap": 5},
                    "10.0.0.2": {"selected": false, "sendcap": 7},
                }
            }
        }));
        assert_eq!(per_ip.ip_limit(&key), Some(5));
        assert_eq!(per_ip.send_rate(&key), None);
        assert_eq!(
            per_ip.ip_limit(&LimitKey::new("example.com", "10.0.0.2")),
            None
        );
    }

    #[test]
    fn day_boundary() {
        let settings = settings_json(serde_json::json!({
            "ipsettings": {"captime": "2020-01-01T06:30:00-05:00"}
        }));
        // 06:30 at -05:00 is 11:30 UTC
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            settings.day_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 10, 11, 30, 0).unwrap()
        );
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 11, 0, 0).unwrap();
        assert_eq!(
            settings.day_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 9, 11, 30, 0).unwrap()
        );

        let midnight = MtaSettings::default();
        assert_eq!(
            midnight.day_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn candidate_selection() {
        let ipdomains = btreemap! {
            "10.0.0.1".to_string() => IpDomains::default(),
            "10.0.0.2".to_string() => IpDomains::default(),
            "10.0.0.3".to_string() => IpDomains::default(),
        };

        let mut all = MtaSettings::default();
        all.ipdomains = ipdomains.clone();
        assert_eq!(
            all.candidate_ips("example.com", |_| 0),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );

        let mut selected = settings_json(serde_json::json!({
            "ipsettings": {
                "allips": false,
                "iplist": {
                    "10.0.0.1": {"selected": true},
                    "10.0.0.2": {"selected": true},
                    "10.0.0.3": {"selected": false},
                    "10.0.0.9": {"selected": true},
                }
            }
        }));
        selected.ipdomains = ipdomains.clone();
        assert_eq!(
            selected.candidate_ips("example.com", |_| 0),
            vec!["10.0.0.1", "10.0.0.2"]
        );

        let mut minimum = settings_json(serde_json::json!({
            "ipsettings": {
                "allips": false,
                "algorithm": "minimum",
                "iplist": {
                    "10.0.0.1": {"selected": true, "mintype": "pct", "minpct": 50},
                    "10.0.0.2": {"selected": true, "mintype": "num", "minnum": 10},
                }
            }
        }));
        minimum.ipdomains = ipdomains;

        let counts = btreemap! {
            "10.0.0.1" => 10u64,
            "10.0.0.2" => 30u64,
        };
        let sent = |key: &LimitKey| counts.get(key.ip.as_str()).copied().unwrap_or(0);
        // total 40: .1 needs 20 and has 10; .2 needs 10 and has 30
        assert_eq!(minimum.candidate_ips("example.com", sent), vec!["10.0.0.1"]);

        // everyone at target: fall back to all selected IPs
        let sent = |key: &LimitKey| if key.ip == "10.0.0.1" { 100 } else { 50 };
        assert_eq!(
            minimum.candidate_ips("example.com", sent),
            vec!["10.0.0.1", "10.0.0.2"]
        );
    }

    #[test]
    fn wait_tables_and_buckets() {
        let settings = settings_json(serde_json::json!({
            "deferwaitsecs": [60, 120],
            "connerrwaitsecs": [30],
            "customwaitsecs": {"try again later": [600, 1200]},
            "transient": {"greylisted": true},
        }));
        assert_eq!(settings.wait_secs(&DeferReason::Default), &[60, 120]);
        assert_eq!(settings.wait_secs(&DeferReason::ConnectionError), &[30]);
        assert_eq!(
            settings.wait_secs(&DeferReason::Matched("try again later".into())),
            &[600, 1200]
        );
        assert_eq!(
            settings.wait_secs(&DeferReason::Matched("gone".into())),
            &[60, 120]
        );
        assert_eq!(
            settings.matching_bucket("421 please try again later"),
            Some("try again later")
        );
        assert!(settings.is_transient_text("451 you have been greylisted"));
        assert!(!settings.is_transient_text("451 busy"));
    }
}
