//! Opaque ids embedded in outgoing mail so that inbound events
//! (opens, clicks, replies) can be attributed to the sink, profile
//! and IP that sent the message.
use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// 2018-07-30T00:00:00Z; suffixes count hours from here
const EPOCH_SECS: i64 = 1_532_908_800;
const ID_BYTES: usize = 12;

fn encode(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

/// The stable part of a tracking id. The owning sink is omitted
/// from the hash when empty.
pub fn tracking_id_base(sink_id: &str, profile: &str, ip: &str) -> String {
    let input = if sink_id.is_empty() {
        format!("{profile}:{ip}")
    } else {
        format!("{sink_id}:{profile}:{ip}")
    };
    let digest = Sha256::digest(input.as_bytes());
    encode(&digest[..ID_BYTES])
}

pub fn hours_since_epoch(now: DateTime<Utc>) -> i32 {
    let hours = (now.timestamp() - EPOCH_SECS).div_euclid(3600);
    hours.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

fn hour_suffix(hours: i32) -> String {
    encode(&hours.to_be_bytes())
}

fn decode_hours(suffix: &str) -> Option<i32> {
    let bytes = BASE32_NOPAD
        .decode(suffix.to_ascii_uppercase().as_bytes())
        .ok()?;
    let bytes: [u8; 4] = bytes.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrackingTarget {
    pub sink_id: String,
    pub profile: String,
    pub ip: String,
}

/// Maps id bases back to what they identify
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct TrackingIds(BTreeMap<String, TrackingTarget>);

impl TrackingIds {
    /// Rebuilds the table for every profile and IP, both for the
    /// local sink and for every sink in `sinks`.
    pub fn rebuild<'a, P>(profiles: P, ips: &[String], sinks: &[String]) -> Self
    where
        P: IntoIterator<Item = &'a str>,
    {
        let mut ids = BTreeMap::new();
        for profile in profiles {
            for ip in ips {
                for sink_id in std::iter::once("").chain(sinks.iter().map(String::as_str)) {
                    ids.insert(
                        tracking_id_base(sink_id, profile, ip),
                        TrackingTarget {
                            sink_id: sink_id.to_string(),
                            profile: profile.to_string(),
                            ip: ip.clone(),
                        },
                    );
                }
            }
        }
        Self(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves an id as produced by [`tracking_id`]. The hour
    /// suffix is optional.
    pub fn find(&self, id: &str) -> Option<(&TrackingTarget, Option<i32>)> {
        let (base, hours) = match id.split_once('-') {
            Some((base, suffix)) => (base, decode_hours(suffix)),
            None => (id, None),
        };
        let target = self.0.get(&base.to_ascii_lowercase())?;
        Some((target, hours))
    }
}

/// The id to embed in a message sent now
pub fn tracking_id(sink_id: &str, profile: &str, ip: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        tracking_id_base(sink_id, profile, ip),
        hour_suffix(hours_since_epoch(now))
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn epoch() {
        assert_eq!(
            Utc.with_ymd_and_hms(2018, 7, 30, 0, 0, 0).unwrap().timestamp(),
            EPOCH_SECS
        );
    }

    #[test]
    fn stable_ids() {
        assert_eq!(
            tracking_id_base("sink1", "p1", "10.0.0.1"),
            "5v6ymze7jtcf4gn7s6xq"
        );
        assert_eq!(tracking_id_base("", "p1", "10.0.0.1"), "dhk7blscxidowqspswja");

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(hours_since_epoch(now), 50458);
        assert_eq!(
            tracking_id("sink1", "p1", "10.0.0.1", now),
            "5v6ymze7jtcf4gn7s6xq-aaamkgq"
        );
    }

    #[test]
    fn find_resolves_ids() {
        let sinks = vec!["sink1".to_string(), "sink2".to_string()];
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let ids = TrackingIds::rebuild(["p1"], &ips, &sinks);
        assert_eq!(ids.len(), 6);

        let (target, hours) = ids.find("5v6ymze7jtcf4gn7s6xq-aaamkgq").unwrap();
        assert_eq!(
            target,
            &TrackingTarget {
                sink_id: "sink1".to_string(),
                profile: "p1".to_string(),
                ip: "10.0.0.1".to_string(),
            }
        );
        assert_eq!(hours, Some(50458));

        let (_, hours) = ids.find("5V6YMZE7JTCF4GN7S6XQ").unwrap();
        assert_eq!(hours, None);

        let (target, _) = ids.find("dhk7blscxidowqspswja-aaamkgq").unwrap();
        assert_eq!(target.sink_id, "");
        assert_eq!(target.profile, "p1");

        assert!(ids.find("aaaaaaaaaaaaaaaaaaaa-aaamkgq").is_none());
    }
}
