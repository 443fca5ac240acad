//! Per (destination, IP) counters, deferral windows and the
//! admission check that combines hourly, daily and warm-up caps.
use crate::keys::LimitKey;
use crate::settings::MtaSettings;
use crate::warmup::WarmupSet;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Number of prior days of delivered counts kept for warm-up promotion
pub const DELIVERED_HISTORY_DAYS: usize = 30;

/// Why a key is currently deferred; selects the wait table and
/// determines whether consecutive deferrals escalate.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    #[default]
    Default,
    ConnectionError,
    /// Reply text contained the named `customwaitsecs` bucket
    Matched(String),
    Rate,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::Matched(bucket) => write!(f, "matched {bucket:?}"),
            Self::Rate => write!(f, "rate"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct SendLimits {
    pub last_check: Option<DateTime<Utc>>,
    pub send_count: u64,
    pub send_count_hour: u64,
    pub delivered_count: u64,
    /// Delivered counts of prior days, most recent first
    #[serde(default)]
    pub prev_delivered: VecDeque<u64>,
    #[serde(default)]
    pub delivered_count_minute: u64,
    /// Delivered counts of prior minutes, most recent first
    #[serde(default)]
    pub prev_delivered_minutes: VecDeque<u64>,
    pub defer_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub defer_reason: DeferReason,
    #[serde(default)]
    pub defer_count: usize,

    #[serde(skip)]
    pub limit_logged: bool,
    #[serde(skip)]
    pub last_attempt: Option<DateTime<Utc>>,
}

impl SendLimits {
    pub fn record_sent(&mut self, delivered: bool) {
        self.send_count += 1;
        self.send_count_hour += 1;
        if delivered {
            self.delivered_count += 1;
            self.delivered_count_minute += 1;
        }
    }

    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.defer_until.is_some_and(|until| until > now)
    }

    /// Clears an elapsed deferral, returning true if there was one
    pub fn expire_defer(&mut self, now: DateTime<Utc>) -> bool {
        match self.defer_until {
            Some(until) if until < now => {
                self.defer_until = None;
                true
            }
            _ => false,
        }
    }

    /// Applies a deferral for `reason` using the wait table `waits`.
    ///
    /// The defer counter selects the table entry, clamped to the last
    /// entry, and restarts when the reason changes. The deferral only
    /// takes effect if it ends later than the current one.
    /// Returns the applied duration in seconds.
    pub fn apply_defer(
        &mut self,
        reason: &DeferReason,
        waits: &[u64],
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let changed = self.defer_reason != *reason;
        let count = if changed { 0 } else { self.defer_count };
        let secs = *waits.get(count.min(waits.len().saturating_sub(1)))?;
        if secs == 0 {
            return None;
        }

        let until = now + Duration::seconds(secs as i64);
        if self.defer_until.is_some_and(|current| until <= current) {
            return None;
        }

        if !self.is_deferred(now) {
            if changed {
                self.defer_count = 0;
                self.defer_reason = reason.clone();
            }
            self.defer_count += 1;
        }
        self.defer_until = Some(until);
        Some(secs)
    }

    /// Shifts today's delivered count into the history and zeroes the
    /// daily counters, then lets matching warm-ups promote.
    fn roll_day(&mut self, key: &LimitKey, warmups: &mut WarmupSet) {
        self.prev_delivered.push_front(self.delivered_count);
        self.prev_delivered.truncate(DELIVERED_HISTORY_DAYS);
        self.send_count = 0;
        self.delivered_count = 0;
        warmups.promote(key, &self.prev_delivered);
    }

    /// Closes out one minute of delivery history and, when the
    /// profile asks for it, defers a key whose delivery rate over the
    /// check window fell below target while it was being attempted.
    /// Returns the applied deferral in seconds.
    pub fn check_delivery_rate(
        &mut self,
        settings: &MtaSettings,
        now: DateTime<Utc>,
    ) -> Option<u64> {
        let window = settings.ratedefercheckmins;
        self.prev_delivered_minutes
            .push_front(self.delivered_count_minute);
        self.prev_delivered_minutes.truncate(window);
        self.delivered_count_minute = 0;

        if window == 0 || self.prev_delivered_minutes.len() != window {
            return None;
        }

        let total: u64 = self.prev_delivered_minutes.iter().sum();
        let attempted = self
            .last_attempt
            .is_some_and(|at| now - at < Duration::minutes(window as i64));
        if total >= settings.ratedefertarget || !attempted {
            return None;
        }

        self.prev_delivered_minutes.clear();
        if self.defer_reason == DeferReason::Rate {
            self.defer_count += 1;
        } else {
            self.defer_count = 0;
            self.defer_reason = DeferReason::Rate;
        }

        let waits = &settings.ratedeferwaitsecs;
        let secs = *waits.get(self.defer_count.min(waits.len().saturating_sub(1)))?;
        if secs == 0 {
            return None;
        }
        let until = now + Duration::seconds(secs as i64);
        if self.defer_until.is_some_and(|current| until <= current) {
            return None;
        }
        self.defer_until = Some(until);
        Some(secs)
    }
}

fn same_hour(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive() && a.hour() == b.hour()
}

/// Decides whether `key` may start another send right now.
///
/// `in_flight` counts sends already admitted but not yet reported.
/// Rolls the daily and hourly counters first, so it must be called
/// with the same lock that guards counter increments.
pub fn over_limit(
    key: &LimitKey,
    settings: &MtaSettings,
    warmups: &mut WarmupSet,
    limits: &mut SendLimits,
    in_flight: u64,
    now: DateTime<Utc>,
) -> bool {
    let boundary = settings.day_boundary(now);

    if let Some(last) = limits.last_check {
        if last < boundary {
            limits.roll_day(key, warmups);
        }
        if !same_hour(last, now) && now > last {
            limits.send_count_hour = 0;
        }
    }
    limits.last_check = Some(now);

    if let Some(rate) = settings.send_rate(key) {
        if limits.send_count_hour + in_flight >= rate {
            return true;
        }
    }

    let cap = match warmups.effective_limit(key) {
        Some((limit, _)) => Some(limit),
        None => settings.ip_limit(key),
    };

    match cap {
        Some(cap) if limits.send_count + in_flight >= cap => {
            if !limits.limit_logged {
                let resume = boundary + Duration::days(1);
                tracing::debug!("limit hit for {key}, sleeping until {resume}");
                limits.limit_logged = true;
            }
            true
        }
        _ => {
            limits.limit_logged = false;
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::warmup::Warmup;
    use chrono::TimeZone;
    use ordermap::OrderMap;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn capped(cap: u64) -> MtaSettings {
        let mut settings: MtaSettings = serde_json::from_value(serde_json::json!({
            "ipsettings": {"allips": true, "sendcap": cap}
        }))
        .unwrap();
        settings.prepare();
        settings
    }

    #[test]
    fn daily_cap_boundary() {
        let key = LimitKey::new("example.com", "10.0.0.1");
        let settings = capped(100);
        let mut warmups = WarmupSet::default();
        let mut limits = SendLimits {
            send_count: 99,
            last_check: Some(at(10, 0)),
            ..Default::default()
        };

        assert!(!over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(10, 1)));
        limits.send_count = 100;
        assert!(over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(10, 2)));
        assert!(limits.limit_logged);

        limits.send_count = 99;
        assert!(over_limit(&key, &settings, &mut warmups, &mut limits, 1, at(10, 3)));
    }

    #[test]
    fn hourly_cap_and_rollover() {
        let key = LimitKey::new("example.com", "10.0.0.1");
        let mut settings: MtaSettings = serde_json::from_value(serde_json::json!({
            "ipsettings": {"sendrate": 5}
        }))
        .unwrap();
        settings.prepare();
        let mut warmups = WarmupSet::default();
        let mut limits = SendLimits::default();

        // the first check only records the time
        assert!(!over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(10, 0)));
        for _ in 0..5 {
            limits.record_sent(true);
        }
        assert!(over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(10, 59)));
        assert!(!over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(11, 0)));
        assert_eq!(limits.send_count_hour, 0);
        assert_eq!(limits.send_count, 5);
    }

    #[test]
    fn day_rollover_feeds_history_and_promotes() {
        let key = LimitKey::new("example.com", "10.0.0.1");
        let settings = MtaSettings::default();
        let mut map = OrderMap::new();
        map.insert(
            "ramp".to_string(),
            serde_json::from_value::<Warmup>(serde_json::json!({
                "allips": ["10.0.0.1"],
                "domains": "example.com",
                "dailylimit": 10,
                "rampfactor": 100,
                "threshold": 50,
                "thresholddays": 1,
                "limitcount": 5,
            }))
            .unwrap(),
        );
        let mut warmups = WarmupSet::new(map);
        let mut limits = SendLimits {
            last_check: Some(Utc.with_ymd_and_hms(2024, 4, 30, 23, 0, 0).unwrap()),
            ..Default::default()
        };
        for _ in 0..10 {
            limits.record_sent(true);
        }
        assert!(over_limit(
            &key,
            &settings,
            &mut warmups,
            &mut limits,
            0,
            Utc.with_ymd_and_hms(2024, 4, 30, 23, 30, 0).unwrap()
        ));

        assert!(!over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(0, 5)));
        assert_eq!(limits.prev_delivered, VecDeque::from(vec![10]));
        assert_eq!(limits.send_count, 0);
        assert_eq!(warmups.get("ramp").unwrap().stage(&key), 1);
        assert_eq!(warmups.effective_limit(&key), Some((20, "ramp")));

        // no second rollover within the same day
        limits.record_sent(true);
        assert!(!over_limit(&key, &settings, &mut warmups, &mut limits, 0, at(9, 0)));
        assert_eq!(limits.prev_delivered.len(), 1);
        assert_eq!(limits.send_count, 1);
    }

    #[test]
    fn history_is_bounded() {
        let key = LimitKey::new("example.com", "10.0.0.1");
        let mut warmups = WarmupSet::default();
        let mut limits = SendLimits::default();
        for day in 0..40 {
            limits.delivered_count = day;
            limits.roll_day(&key, &mut warmups);
        }
        assert_eq!(limits.prev_delivered.len(), DELIVERED_HISTORY_DAYS);
        assert_eq!(limits.prev_delivered.front(), Some(&39));
    }

    #[test]
    fn deferral_never_shortens() {
        let mut limits = SendLimits::default();
        let waits = [60, 600, 3600];

        assert_eq!(limits.apply_defer(&DeferReason::Default, &waits, at(10, 0)), Some(60));
        assert_eq!(limits.defer_count, 1);
        let first = limits.defer_until;

        // still deferred: index 1 extends the window but the counter holds
        assert_eq!(limits.apply_defer(&DeferReason::Default, &waits, at(10, 0)), Some(600));
        assert_eq!(limits.defer_count, 1);
        assert!(limits.defer_until > first);
        let extended = limits.defer_until;

        // a different reason restarts at index 0, which would shorten
        assert_eq!(
            limits.apply_defer(&DeferReason::ConnectionError, &[30], at(10, 1)),
            None
        );
        assert_eq!(limits.defer_until, extended);
        assert_eq!(limits.defer_reason, DeferReason::Default);
    }

    #[test]
    fn deferral_escalates_and_clamps() {
        let mut limits = SendLimits::default();
        let waits = [60, 120];
        let mut now = at(10, 0);
        let mut applied = vec![];
        for _ in 0..4 {
            applied.push(limits.apply_defer(&DeferReason::Default, &waits, now));
            now = now + Duration::hours(1);
            assert!(limits.expire_defer(now));
        }
        assert_eq!(applied, vec![Some(60), Some(120), Some(120), Some(120)]);

        let reason = DeferReason::Matched("try later".to_string());
        assert_eq!(limits.apply_defer(&reason, &[900], now), Some(900));
        assert_eq!(limits.defer_reason, reason);
        assert_eq!(limits.defer_count, 1);

        assert_eq!(limits.apply_defer(&DeferReason::Default, &[], now), None);
        assert_eq!(limits.apply_defer(&DeferReason::Default, &[0], now), None);
    }

    #[test]
    fn delivery_rate_deferral() {
        let mut settings: MtaSettings = serde_json::from_value(serde_json::json!({
            "ratedefer": true,
            "ratedefercheckmins": 3,
            "ratedefertarget": 10,
            "ratedeferwaitsecs": [300, 900],
        }))
        .unwrap();
        settings.prepare();

        let mut limits = SendLimits {
            last_attempt: Some(at(10, 0)),
            ..Default::default()
        };
        assert_eq!(limits.check_delivery_rate(&settings, at(10, 1)), None);
        limits.delivered_count_minute = 2;
        assert_eq!(limits.check_delivery_rate(&settings, at(10, 2)), None);
        assert_eq!(limits.check_delivery_rate(&settings, at(10, 2)), Some(300));
        assert_eq!(limits.defer_reason, DeferReason::Rate);
        assert!(limits.prev_delivered_minutes.is_empty());

        // an idle key is not rate deferred
        let mut idle = SendLimits::default();
        for minute in 1..=3 {
            assert_eq!(idle.check_delivery_rate(&settings, at(10, minute)), None);
        }
    }

    #[test]
    fn counters_survive_serialization() {
        let mut limits = SendLimits {
            last_check: Some(at(10, 0)),
            send_count: 12,
            send_count_hour: 3,
            delivered_count: 11,
            prev_delivered: VecDeque::from(vec![5, 4]),
            defer_until: Some(at(11, 0)),
            defer_reason: DeferReason::Matched("quota".to_string()),
            defer_count: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&limits).unwrap();
        limits.limit_logged = true;
        let loaded: SendLimits = serde_json::from_str(&json).unwrap();
        k9::assert_equal!(
            loaded,
            SendLimits {
                limit_logged: false,
                ..limits
            }
        );
    }
}
