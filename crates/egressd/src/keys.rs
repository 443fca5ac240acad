use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the unit of admission control: one destination domain
/// as reached from one sending IP.
/// Persisted and reported in the `destination:ip` string form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LimitKey {
    pub destination: String,
    pub ip: String,
}

impl LimitKey {
    pub fn new<D: Into<String>, I: Into<String>>(destination: D, ip: I) -> Self {
        Self {
            destination: destination.into(),
            ip: ip.into(),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.destination, self.ip)
    }
}

impl TryFrom<String> for LimitKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        // The destination is a domain and cannot contain a colon,
        // but an IPv6 source address can, so split at the first one.
        match s.split_once(':') {
            Some((destination, ip)) => Ok(Self::new(destination, ip)),
            None => Err(format!("invalid limit key {s:?}: expected destination:ip")),
        }
    }
}

impl From<LimitKey> for String {
    fn from(key: LimitKey) -> String {
        key.to_string()
    }
}

/// Partitions the connection pool by sending IP and the provider
/// group of the destination's MX host, so that MX hosts sharing a
/// suffix share capacity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey {
    pub ip: String,
    pub mx_suffix: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the domain portion of an email address.
pub fn destination_of(email: &str) -> &str {
    match email.rfind('@') {
        Some(idx) => &email[idx + 1..],
        None => email,
    }
}
