//! Cached MX and address resolution for outbound delivery.
//!
//! [DnsCache] keeps one map per record kind. The first caller to miss
//! installs an in-flight marker and performs the lookup without holding
//! the map lock; concurrent callers for the same host wait for that
//! result to be published and then all observe the same value.
use async_trait::async_trait;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use parking_lot::Mutex;
use prometheus::IntCounterVec;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// How long a resolved answer, or a permanent failure, is cached.
pub const DEFAULT_TTL: Duration = Duration::from_secs(8 * 3600);
/// How long a transient failure is cached before another lookup
/// is attempted.
pub const DEFAULT_TRANSIENT_TTL: Duration = Duration::from_secs(60);

static LOOKUP_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "dns_cache_lookup_count",
        "how many times a dns cache lookup was initiated",
        &["kind"]
    )
    .unwrap()
});
static POPULATED_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "dns_cache_populated_count",
        "how many times a dns cache lookup went to the resolver",
        &["kind"]
    )
    .unwrap()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LookupError {
    pub message: String,
    /// When true, retrying the same name is not expected to succeed
    pub permanent: bool,
}

impl LookupError {
    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    fn from_resolve(name: &str, err: ResolveError) -> Self {
        if err.is_no_records_found() || err.is_nx_domain() {
            Self::permanent(format!("{name}: {err:#}"))
        } else {
            Self::transient(format!("{name}: {err:#}"))
        }
    }
}

/// Performs the actual network lookups on behalf of [DnsCache]
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Returns the exchange host names for `domain`, lowest
    /// preference first.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, LookupError>;

    /// Returns the IPv4 addresses for `host`.
    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Build a resolver from the system configuration
    pub fn from_system_conf() -> Result<Self, LookupError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|err| {
                LookupError::permanent(format!("reading system resolver config: {err:#}"))
            })?
            .build();
        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, LookupError> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|err| LookupError::from_resolve(domain, err))?;

        let mut records: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_lowercase().to_utf8();
                (mx.preference(), host.trim_end_matches('.').to_string())
            })
            .collect();
        records.sort();

        Ok(records.into_iter().map(|(_pref, host)| host).collect())
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        let lookup = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|err| LookupError::from_resolve(host, err))?;
        Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Mx,
    A,
}

impl LookupKind {
    fn label(self) -> &'static str {
        match self {
            Self::Mx => "MX",
            Self::A => "A",
        }
    }
}

struct Entry<V> {
    result: Result<Arc<V>, LookupError>,
    expires: Instant,
}

impl<V> Clone for Entry<V> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            expires: self.expires,
        }
    }
}

enum Next<V> {
    Wait(watch::Receiver<Option<Entry<V>>>),
    Fetch(watch::Sender<Option<Entry<V>>>),
}

enum Slot<V> {
    /// A lookup is in flight; the receiver yields `Some` once
    /// the result has been published.
    Pending(watch::Receiver<Option<Entry<V>>>),
    Ready(Entry<V>),
}

struct FlightMap<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
}

impl<V> Default for FlightMap<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the in-flight marker if the task performing the lookup
/// is dropped before it publishes a result, so that waiters can
/// take over rather than wait forever.
struct PendingGuard<'a, V> {
    map: &'a FlightMap<V>,
    host: &'a str,
    armed: bool,
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.map.slots.lock();
            if matches!(slots.get(self.host), Some(Slot::Pending(_))) {
                slots.remove(self.host);
            }
        }
    }
}

impl<V: Send + Sync + 'static> FlightMap<V> {
    async fn lookup<F, Fut>(
        &self,
        host: &str,
        ttl: Duration,
        transient_ttl: Duration,
        fetch: F,
    ) -> Result<Arc<V>, LookupError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, LookupError>>,
    {
        loop {
            let next = {
                let mut slots = self.slots.lock();
                match slots.get(host) {
                    Some(Slot::Ready(entry)) if entry.expires > Instant::now() => {
                        return entry.result.clone();
                    }
                    Some(Slot::Pending(rx)) => Next::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(host.to_string(), Slot::Pending(rx));
                        Next::Fetch(tx)
                    }
                }
            };

            let mut rx = match next {
                Next::Fetch(tx) => {
                    return self.populate(host, ttl, transient_ttl, tx, &fetch).await;
                }
                Next::Wait(rx) => rx,
            };

            let published = rx
                .wait_for(Option::is_some)
                .await
                .map(|value| value.clone());
            match published {
                Ok(Some(entry)) => return entry.result,
                // The task performing the lookup went away; its guard
                // cleared the marker, so go around and try again.
                _ => continue,
            }
        }
    }

    async fn populate<F, Fut>(
        &self,
        host: &str,
        ttl: Duration,
        transient_ttl: Duration,
        tx: watch::Sender<Option<Entry<V>>>,
        fetch: &F,
    ) -> Result<Arc<V>, LookupError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, LookupError>>,
    {
        let mut guard = PendingGuard {
            map: self,
            host,
            armed: true,
        };

        let result = fetch().await.map(Arc::new);
        let lifetime = match &result {
            Err(err) if !err.permanent => transient_ttl,
            _ => ttl,
        };
        let entry = Entry {
            result,
            expires: Instant::now() + lifetime,
        };

        self.slots
            .lock()
            .insert(host.to_string(), Slot::Ready(entry.clone()));
        guard.armed = false;
        tx.send_replace(Some(entry.clone()));

        entry.result
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Caches MX and A lookups with single-flight semantics.
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    ttl: Duration,
    transient_ttl: Duration,
    mx: FlightMap<Vec<String>>,
    a: FlightMap<Vec<IpAddr>>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            ttl: DEFAULT_TTL,
            transient_ttl: DEFAULT_TRANSIENT_TTL,
            mx: FlightMap::default(),
            a: FlightMap::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_transient_ttl(mut self, ttl: Duration) -> Self {
        self.transient_ttl = ttl;
        self
    }

    /// Returns the exchange hosts for `domain`.
    /// A domain without any MX records is a permanent failure.
    /// An address literal is returned as the sole exchange.
    pub async fn lookup_mx(&self, domain: &str) -> Result<Arc<Vec<String>>, LookupError> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return Err(LookupError::permanent("no such host"));
        }
        if let Some(literal) = parse_literal(&domain) {
            return Ok(Arc::new(vec![literal.to_string()]));
        }

        LOOKUP_COUNT
            .with_label_values(&[LookupKind::Mx.label()])
            .inc();
        let resolver = &self.resolver;
        let domain = domain.as_str();
        self.mx
            .lookup(domain, self.ttl, self.transient_ttl, || async move {
                POPULATED_COUNT
                    .with_label_values(&[LookupKind::Mx.label()])
                    .inc();
                tracing::trace!("looking up MX for {domain}");
                let hosts = resolver.resolve_mx(domain).await?;
                if hosts.is_empty() {
                    return Err(LookupError::permanent(format!(
                        "{domain}: no MX records for domain"
                    )));
                }
                tracing::trace!("{domain} has {} MX servers", hosts.len());
                Ok(hosts)
            })
            .await
    }

    /// Returns the addresses for `host`.
    /// An address literal resolves to itself.
    pub async fn lookup_ip(&self, host: &str) -> Result<Arc<Vec<IpAddr>>, LookupError> {
        let host = normalize(host);
        if host.is_empty() {
            return Err(LookupError::permanent("no such host"));
        }
        if let Some(literal) = parse_literal(&host) {
            return Ok(Arc::new(vec![literal]));
        }

        LOOKUP_COUNT
            .with_label_values(&[LookupKind::A.label()])
            .inc();
        let resolver = &self.resolver;
        let host = host.as_str();
        self.a
            .lookup(host, self.ttl, self.transient_ttl, || async move {
                POPULATED_COUNT
                    .with_label_values(&[LookupKind::A.label()])
                    .inc();
                tracing::trace!("looking up A for {host}");
                let addrs = resolver.resolve_ip(host).await?;
                if addrs.is_empty() {
                    return Err(LookupError::permanent(format!("{host}: no such host")));
                }
                tracing::trace!("IPs for {host}: {addrs:?}");
                Ok(addrs)
            })
            .await
    }

    /// Returns the hosts for `host` as strings, whichever the kind.
    pub async fn lookup(
        &self,
        host: &str,
        kind: LookupKind,
    ) -> Result<Arc<Vec<String>>, LookupError> {
        match kind {
            LookupKind::Mx => self.lookup_mx(host).await,
            LookupKind::A => {
                let addrs = self.lookup_ip(host).await?;
                Ok(Arc::new(addrs.iter().map(|a| a.to_string()).collect()))
            }
        }
    }

    /// Number of cached (or in-flight) entries for the given kind
    pub fn len(&self, kind: LookupKind) -> usize {
        match kind {
            LookupKind::Mx => self.mx.len(),
            LookupKind::A => self.a.len(),
        }
    }
}

fn normalize(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn parse_literal(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let host = host.strip_prefix("ipv6:").unwrap_or(host);
    host.parse().ok()
}
