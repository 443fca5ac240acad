//! Warm-up ramps: a gradually increasing daily cap for new
//! (destination, IP) pairs that is promoted one stage at a time as
//! delivery volume proves out.
use crate::glob::glob_match;
use crate::keys::LimitKey;
use ordermap::OrderMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

const MAX_LIMIT: i64 = i32::MAX as i64;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Med,
    #[default]
    #[serde(other)]
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::High => 2,
            Self::Med => 1,
            Self::Low => 0,
        }
    }
}

/// What happens once a key has been promoted past `limitcount` stages
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AfterLimit {
    /// The warm-up stops applying and the profile caps take over
    Policy,
    /// The limit of the final stage stays in force
    #[default]
    #[serde(other)]
    Freeze,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Warmup {
    #[serde(default)]
    pub allips: Vec<String>,
    /// Whitespace separated glob patterns
    #[serde(default)]
    pub domains: String,
    #[serde(default)]
    pub excludedomains: String,
    #[serde(default)]
    pub dailylimit: u64,
    /// Percentage growth per stage
    #[serde(default)]
    pub rampfactor: u64,
    /// Percentage of the current limit a day must deliver to count
    /// towards promotion
    #[serde(default)]
    pub threshold: u64,
    #[serde(default)]
    pub thresholddays: usize,
    /// Replaces the computed limit for specific stages
    #[serde(default)]
    pub dayoverrides: BTreeMap<u32, u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub limitcount: u32,
    #[serde(default)]
    pub afterlimit: AfterLimit,
    #[serde(default)]
    pub disabled: bool,

    /// Current stage per key; survives settings replacement
    #[serde(default)]
    pub increments: BTreeMap<LimitKey, u32>,
}

/// Rounds a limit to three significant figures at its order
/// of magnitude, so that 1234 becomes 1230 and 98765 becomes 98800.
pub fn nice_round(limit: i64) -> i64 {
    if limit <= 0 {
        return limit;
    }
    let lim = limit as f64;
    let factor = 10f64.powi(lim.log10().floor() as i32);
    (((lim / factor) * 100.0).round() / 100.0 * factor) as i64
}

fn ramp(base: i64, rampfactor: u64, stages: u32) -> i64 {
    let growth = rampfactor as f64 * 0.01;
    let mut lim = base;
    for _ in 0..stages {
        if lim >= MAX_LIMIT {
            break;
        }
        lim = lim.saturating_add((lim as f64 * growth) as i64);
        lim = nice_round(lim);
    }
    lim
}

impl Warmup {
    pub fn stage(&self, key: &LimitKey) -> u32 {
        self.increments.get(key).copied().unwrap_or(0)
    }

    /// The daily limit this warm-up imposes on `key`, or None when
    /// the key has ramped past the final stage under `afterlimit = policy`.
    pub fn current_limit(&self, key: &LimitKey) -> Option<u64> {
        let mut stage = self.stage(key);
        if stage > self.limitcount {
            match self.afterlimit {
                AfterLimit::Policy => return None,
                AfterLimit::Freeze => stage = self.limitcount,
            }
        }

        let limit = match self.dayoverrides.get(&stage) {
            Some(over) => (*over).min(MAX_LIMIT as u64) as i64,
            None => ramp(self.dailylimit.min(MAX_LIMIT as u64) as i64, self.rampfactor, stage),
        };
        Some(limit.clamp(0, MAX_LIMIT) as u64)
    }

    /// Advances the stage for `key`; stops one past `limitcount`
    pub fn add_increment(&mut self, key: &LimitKey) -> u32 {
        let bound = self.limitcount.saturating_add(1);
        let stage = self.increments.entry(key.clone()).or_insert(0);
        if *stage < bound {
            *stage += 1;
        }
        *stage
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.allips.iter().any(|candidate| candidate == ip)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains
            .split_whitespace()
            .any(|pattern| glob_match(pattern, domain))
            && !self
                .excludedomains
                .split_whitespace()
                .any(|pattern| glob_match(pattern, domain))
    }

    pub fn matches(&self, key: &LimitKey) -> bool {
        !self.disabled && self.has_ip(&key.ip) && self.has_domain(&key.destination)
    }

    /// Whether the most recent `thresholddays` entries of `history`
    /// (newest first) each delivered at least `threshold`% of the
    /// current limit.
    fn threshold_met(&self, key: &LimitKey, history: &VecDeque<u64>) -> bool {
        let limit = self.current_limit(key).unwrap_or(0);
        let threshold = (limit as f64 * self.threshold as f64 * 0.01) as u64;
        history
            .iter()
            .take(self.thresholddays)
            .take_while(|delivered| **delivered >= threshold)
            .count()
            >= self.thresholddays
    }
}

/// All warm-ups, in the order the management plane listed them.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct WarmupSet(OrderMap<String, Warmup>);

impl WarmupSet {
    pub fn new(warmups: OrderMap<String, Warmup>) -> Self {
        Self(warmups)
    }

    pub fn get(&self, id: &str) -> Option<&Warmup> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The warm-up governing `key`: the highest priority match,
    /// earliest listed among equals.
    pub fn select(&self, key: &LimitKey) -> Option<(&str, &Warmup)> {
        let mut best: Option<(&str, &Warmup)> = None;
        for (id, warmup) in self.0.iter() {
            if !warmup.matches(key) {
                continue;
            }
            match best {
                Some((_, current)) if current.priority.rank() >= warmup.priority.rank() => {}
                _ => best = Some((id.as_str(), warmup)),
            }
        }
        best
    }

    /// The warm-up daily limit for `key` and the id of the warm-up
    /// that imposes it.
    pub fn effective_limit(&self, key: &LimitKey) -> Option<(u64, &str)> {
        let (id, warmup) = self.select(key)?;
        Some((warmup.current_limit(key)?, id))
    }

    /// Evaluates promotion for every warm-up matching `key` against
    /// the delivered history, newest day first.
    pub fn promote(&mut self, key: &LimitKey, history: &VecDeque<u64>) {
        for (id, warmup) in self.0.iter_mut() {
            if !warmup.matches(key) || !warmup.threshold_met(key, history) {
                continue;
            }
            let stage = warmup.add_increment(key);
            tracing::info!("warm-up {id} promoted {key} to stage {stage}");
        }
    }

    /// Replaces the definitions; stage counters of warm-ups that keep
    /// their id carry over and warm-ups not listed are dropped.
    pub fn replace(&mut self, mut warmups: OrderMap<String, Warmup>) {
        for (id, warmup) in warmups.iter_mut() {
            if let Some(existing) = self.0.get_mut(id) {
                warmup.increments = std::mem::take(&mut existing.increments);
            }
        }
        self.0 = warmups;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn key() -> LimitKey {
        LimitKey::new("example.com", "10.0.0.1")
    }

    fn warmup(json: serde_json::Value) -> Warmup {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn nice_rounding_across_magnitudes() {
        let cases = [
            (5, 5),
            (101, 101),
            (999, 999),
            (1001, 1000),
            (1234, 1230),
            (12345, 12300),
            (19999, 20000),
            (98765, 98800),
            (123456, 123000),
            (999999, 1000000),
            (1234567, 1230000),
            (0, 0),
            (-5, -5),
        ];
        for (input, expected) in cases {
            assert_eq!(nice_round(input), expected, "nice_round({input})");
        }
    }

    #[test]
    fn ramp_schedules() {
        let stages = |base, factor, n| (0..n).map(|s| ramp(base, factor, s)).collect::<Vec<_>>();
        assert_eq!(stages(100, 20, 6), vec![100, 120, 144, 172, 206, 247]);
        assert_eq!(
            stages(1000, 50, 7),
            vec![1000, 1500, 2250, 3380, 5070, 7610, 11399]
        );
        assert_eq!(
            stages(50, 30, 9),
            vec![50, 65, 84, 109, 141, 183, 237, 308, 400]
        );
    }

    #[test]
    fn current_limit_stages_and_overrides() {
        let mut w = warmup(serde_json::json!({
            "allips": ["10.0.0.1"],
            "domains": "example.com",
            "dailylimit": 100,
            "rampfactor": 20,
            "limitcount": 3,
            "dayoverrides": {"1": 500},
        }));
        let key = key();
        assert_eq!(w.current_limit(&key), Some(100));
        w.add_increment(&key);
        assert_eq!(w.current_limit(&key), Some(500));
        w.add_increment(&key);
        assert_eq!(w.current_limit(&key), Some(144));

        for _ in 0..10 {
            w.add_increment(&key);
        }
        // bounded one past the final stage, frozen at the final limit
        assert_eq!(w.stage(&key), 4);
        assert_eq!(w.current_limit(&key), Some(172));

        w.afterlimit = AfterLimit::Policy;
        assert_eq!(w.current_limit(&key), None);
    }

    #[test]
    fn limit_is_capped() {
        let w = warmup(serde_json::json!({
            "dailylimit": 2_000_000_000u64,
            "rampfactor": 100,
            "limitcount": 10,
            "increments": {"example.com:10.0.0.1": 5},
        }));
        assert_eq!(w.current_limit(&key()), Some(i32::MAX as u64));
    }

    #[test]
    fn domain_matching() {
        let w = warmup(serde_json::json!({
            "allips": ["10.0.0.1", "10.0.0.2"],
            "domains": "gmail.com  *.yahoo.com\thotmail.*",
            "excludedomains": "mail.yahoo.com",
        }));
        assert!(w.matches(&LimitKey::new("gmail.com", "10.0.0.2")));
        assert!(w.matches(&LimitKey::new("uk.yahoo.com", "10.0.0.1")));
        assert!(w.matches(&LimitKey::new("hotmail.co.uk", "10.0.0.1")));
        assert!(!w.matches(&LimitKey::new("mail.yahoo.com", "10.0.0.1")));
        assert!(!w.matches(&LimitKey::new("gmail.com", "10.0.0.3")));

        let disabled = Warmup {
            disabled: true,
            ..w
        };
        assert!(!disabled.matches(&LimitKey::new("gmail.com", "10.0.0.2")));
    }

    #[test]
    fn priority_selection() {
        let base = serde_json::json!({
            "allips": ["10.0.0.1"],
            "domains": "*",
            "dailylimit": 10,
        });
        let with_priority = |p: &str, limit: u64| {
            let mut w = warmup(base.clone());
            w.priority = serde_json::from_value(serde_json::json!(p)).unwrap();
            w.dailylimit = limit;
            w
        };

        let mut map = OrderMap::new();
        map.insert("low".to_string(), with_priority("low", 1));
        map.insert("med".to_string(), with_priority("med", 2));
        map.insert("high-a".to_string(), with_priority("high", 3));
        map.insert("high-b".to_string(), with_priority("high", 4));
        map.insert("bogus".to_string(), with_priority("urgent", 5));
        let set = WarmupSet::new(map);

        assert_eq!(set.effective_limit(&key()), Some((3, "high-a")));
        assert_eq!(
            set.effective_limit(&LimitKey::new("example.com", "10.0.0.9")),
            None
        );
    }

    #[test]
    fn promotion_requires_consecutive_days() {
        let mut map = OrderMap::new();
        map.insert(
            "ramp".to_string(),
            warmup(serde_json::json!({
                "allips": ["10.0.0.1"],
                "domains": "example.com",
                "dailylimit": 100,
                "rampfactor": 20,
                "threshold": 90,
                "thresholddays": 2,
                "limitcount": 5,
            })),
        );
        let mut set = WarmupSet::new(map);
        let key = key();

        // only one qualifying day
        set.promote(&key, &VecDeque::from(vec![95]));
        assert_eq!(set.get("ramp").unwrap().stage(&key), 0);

        // the most recent day falls short
        set.promote(&key, &VecDeque::from(vec![89, 100, 100]));
        assert_eq!(set.get("ramp").unwrap().stage(&key), 0);

        set.promote(&key, &VecDeque::from(vec![90, 100, 3]));
        assert_eq!(set.get("ramp").unwrap().stage(&key), 1);

        // stage 1 limit is 120, so 90% is 108
        set.promote(&key, &VecDeque::from(vec![107, 120]));
        assert_eq!(set.get("ramp").unwrap().stage(&key), 1);
        set.promote(&key, &VecDeque::from(vec![108, 120]));
        assert_eq!(set.get("ramp").unwrap().stage(&key), 2);
    }

    #[test]
    fn replace_keeps_stage_counters() {
        let key = key();
        let mut old = OrderMap::new();
        old.insert(
            "keep".to_string(),
            Warmup {
                increments: btreemap! {key.clone() => 3},
                ..Default::default()
            },
        );
        old.insert("gone".to_string(), Warmup::default());
        let mut set = WarmupSet::new(old);

        let mut new = OrderMap::new();
        new.insert(
            "keep".to_string(),
            Warmup {
                dailylimit: 77,
                ..Default::default()
            },
        );
        new.insert("fresh".to_string(), Warmup::default());
        set.replace(new);

        assert_eq!(set.len(), 2);
        assert!(set.get("gone").is_none());
        let kept = set.get("keep").unwrap();
        assert_eq!(kept.dailylimit, 77);
        assert_eq!(kept.stage(&key), 3);
        assert_eq!(set.get("fresh").unwrap().stage(&key), 0);
    }
}
