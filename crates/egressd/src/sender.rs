//! The admission controller shared by every delivery.
//!
//! All pool, limiter, warm-up and tracking state lives behind a
//! single lock. Callers that cannot be admitted wait on a [`Notify`]
//! which every state change signals; DNS and SMTP I/O always happen
//! with the lock released.
use crate::accounting::{filter_message, Accounting, Event, EventType, StatType};
use crate::classify::{ConnResult, ResultKind};
use crate::keys::{destination_of, ConnId, ConnKey, LimitKey};
use crate::limits::{over_limit, DeferReason, SendLimits};
use crate::metrics::{BLOCKED_CALLERS, CONNECTIONS_OPENED, DEFERRALS, DYNAMIC_LIMIT_RESETS};
use crate::pool::{close_in_background, ConnPools, SenderConn};
use crate::settings::{MtaSettings, SettingsUpdate};
use crate::state::StateStore;
use crate::tracking::{self, TrackingIds, TrackingTarget};
use crate::warmup::WarmupSet;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use dns_resolver::{DnsCache, LookupError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Notify;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The message being delivered, as far as admission is concerned
pub trait Recipient: Send + Sync {
    fn email(&self) -> &str;
    fn campaign_id(&self) -> &str;
    /// Test sends are delivered but not counted in statistics
    fn is_test(&self) -> bool {
        false
    }
    /// Checked each time a blocked caller is woken
    fn is_canceled(&self) -> bool {
        false
    }
    /// When delivery of this message was first attempted
    fn first_attempt(&self) -> DateTime<Utc>;
}

#[derive(Debug, thiserror::Error)]
pub enum GetConnError {
    #[error("cannot find profile {0}")]
    UnknownProfile(String),
    #[error("message discarded")]
    Discarded,
    #[error("canceled")]
    Canceled,
    /// The exchanges for the destination could not be determined.
    /// Only a permanent failure ends delivery of the message.
    #[error("{message}")]
    Resolution {
        message: String,
        permanent: bool,
        lease: Lease,
    },
}

/// Identifies what an admission was charged against, so that the
/// outcome can be reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub profile: String,
    pub key: LimitKey,
    pub conn: Option<(ConnKey, ConnId)>,
}

/// An admitted delivery. The connection belongs to the caller until
/// it is handed back through [`Sender::process_result`].
#[derive(Debug)]
pub struct Grant {
    pub lease: Lease,
    pub conn: SenderConn,
    pub settings: Arc<MtaSettings>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LimitEntry {
    #[serde(rename = "s")]
    pub profile: String,
    #[serde(rename = "d")]
    pub destination: String,
    #[serde(rename = "i")]
    pub ip: String,
    #[serde(rename = "l")]
    pub limit: u64,
    #[serde(rename = "w", skip_serializing_if = "String::is_empty")]
    pub warmup: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub conn_key: ConnKey,
    pub idle: usize,
    pub busy: usize,
    pub dynamic_limit: usize,
}

/// One settings profile
#[derive(Serialize, Deserialize, Default)]
struct Mta {
    settings: Arc<MtaSettings>,
    #[serde(default)]
    limits: BTreeMap<LimitKey, SendLimits>,
    #[serde(default)]
    pauses: BTreeMap<LimitKey, bool>,
    #[serde(skip)]
    conns: ConnPools,
    /// Where the next IP scan starts
    #[serde(skip)]
    cursor: usize,
}

impl Mta {
    fn shutdown(&mut self) {
        for pool in self.conns.values_mut() {
            close_in_background(pool.drain_idle());
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct SenderState {
    #[serde(default)]
    sinkid: String,
    #[serde(default)]
    mtas: BTreeMap<String, Mta>,
    #[serde(default)]
    warmups: WarmupSet,
    #[serde(default)]
    trackingids: TrackingIds,
    #[serde(skip)]
    next_conn_id: u64,
    #[serde(skip)]
    last_save: Option<DateTime<Utc>>,
    #[serde(skip)]
    dirty: bool,
}

enum Attempt {
    Granted(Grant),
    NeedMx,
    Wait,
}

pub struct Sender {
    state: Mutex<SenderState>,
    available: Notify,
    dns: Arc<DnsCache>,
    accounting: Arc<Accounting>,
    store: Arc<StateStore>,
    clock: Clock,
    persist_min_interval: Duration,
}

impl Sender {
    pub fn new(dns: Arc<DnsCache>, accounting: Arc<Accounting>, store: Arc<StateStore>) -> Self {
        Self {
            state: Mutex::new(SenderState::default()),
            available: Notify::new(),
            dns,
            accounting,
            store,
            clock: Arc::new(Utc::now),
            persist_min_interval: Duration::milliseconds(200),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_persist_min_interval(mut self, interval: std::time::Duration) -> Self {
        if let Ok(interval) = Duration::from_std(interval) {
            self.persist_min_interval = interval;
        }
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Loads the persisted state, replacing whatever is held now.
    /// Returns false on a cold start.
    pub fn restore(&self) -> anyhow::Result<bool> {
        let Some(mut loaded) = self.store.load::<SenderState>()? else {
            return Ok(false);
        };
        for mta in loaded.mtas.values_mut() {
            Arc::make_mut(&mut mta.settings).prepare();
        }
        self.accounting.set_sink_id(&loaded.sinkid);
        tracing::info!(
            "restored state for {} profiles and {} warm-ups from {}",
            loaded.mtas.len(),
            loaded.warmups.len(),
            self.store.path().display()
        );
        *self.state.lock() = loaded;
        self.available.notify_waiters();
        Ok(true)
    }

    pub fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&*self.state.lock()).context("encoding sender state")
    }

    /// Writes the state synchronously; used at shutdown
    pub fn save_now(&self) -> anyhow::Result<()> {
        let data = self.snapshot()?;
        self.store.save_now(&data)?;
        let mut state = self.state.lock();
        state.last_save = Some(self.now());
        state.dirty = false;
        Ok(())
    }

    fn persist(&self, state: &mut SenderState, now: DateTime<Utc>) {
        match serde_json::to_vec(&*state) {
            Ok(data) => {
                self.store.submit(data);
                state.last_save = Some(now);
                state.dirty = false;
            }
            Err(err) => tracing::error!("encoding sender state: {err:#}"),
        }
    }

    fn persist_if_due(&self, state: &mut SenderState, now: DateTime<Utc>) {
        let due = match state.last_save {
            Some(last) => now - last >= self.persist_min_interval,
            None => true,
        };
        if due {
            self.persist(state, now);
        } else {
            state.dirty = true;
        }
    }

    pub fn sink_id(&self) -> String {
        self.state.lock().sinkid.clone()
    }

    pub fn settings(&self, profile: &str) -> Option<Arc<MtaSettings>> {
        self.state
            .lock()
            .mtas
            .get(profile)
            .map(|mta| mta.settings.clone())
    }

    /// Wakes every blocked caller so that it re-evaluates admission
    /// and its cancellation state.
    pub fn wakeup(&self) {
        self.available.notify_waiters();
    }

    /// Obtains a connection for delivering to `recipient` through
    /// `profile`, waiting until one of the profile's IPs may send.
    /// `mx_index` selects the exchange, in preference order.
    pub async fn get_conn(
        &self,
        profile: &str,
        recipient: &dyn Recipient,
        mx_index: usize,
    ) -> Result<Grant, GetConnError> {
        let destination = destination_of(recipient.email()).to_ascii_lowercase();
        let mut mx: Option<Result<Arc<Vec<String>>, LookupError>> = None;
        let mut blocked = None;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before examining the state so that a change
            // made after we look cannot be missed.
            notified.as_mut().enable();

            let attempt = {
                let mut state = self.state.lock();
                let now = self.now();
                self.try_acquire(
                    &mut state,
                    profile,
                    &destination,
                    recipient,
                    mx_index,
                    mx.as_ref(),
                    now,
                )?
            };

            match attempt {
                Attempt::Granted(grant) => return Ok(grant),
                Attempt::NeedMx => {
                    mx = Some(self.dns.lookup_mx(&destination).await);
                }
                Attempt::Wait => {
                    if blocked.is_none() {
                        BLOCKED_CALLERS.inc();
                        blocked = Some(scopeguard::guard((), |_| BLOCKED_CALLERS.dec()));
                    }
                    notified.await;
                    if recipient.is_canceled() {
                        return Err(GetConnError::Canceled);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_acquire(
        &self,
        state: &mut SenderState,
        profile: &str,
        destination: &str,
        recipient: &dyn Recipient,
        mx_index: usize,
        mx: Option<&Result<Arc<Vec<String>>, LookupError>>,
        now: DateTime<Utc>,
    ) -> Result<Attempt, GetConnError> {
        let SenderState {
            mtas,
            warmups,
            next_conn_id,
            ..
        } = state;
        let mta = mtas
            .get_mut(profile)
            .ok_or_else(|| GetConnError::UnknownProfile(profile.to_string()))?;
        let settings = mta.settings.clone();

        let ips = settings.candidate_ips(destination, |key| {
            mta.limits.get(key).map_or(0, |limits| limits.send_count)
        });
        if ips.is_empty() {
            return Ok(Attempt::Wait);
        }

        let start = mta.cursor % ips.len();
        for offset in 0..ips.len() {
            let idx = (start + offset) % ips.len();
            let ip = &ips[idx];
            let key = LimitKey::new(destination, ip.as_str());

            match mta.pauses.get(&key) {
                Some(true) => return Err(GetConnError::Discarded),
                Some(false) => continue,
                None => {}
            }

            let limits = mta.limits.entry(key.clone()).or_default();
            if limits.is_deferred(now) {
                continue;
            }

            let hosts = match mx {
                None => return Ok(Attempt::NeedMx),
                Some(Ok(hosts)) if mx_index < hosts.len() => hosts.clone(),
                Some(result) => {
                    let (message, permanent) = match result {
                        Err(err) => (err.message.clone(), err.permanent),
                        Ok(_) => (
                            "failed to connect to any servers listed in MX record".to_string(),
                            true,
                        ),
                    };
                    tracing::debug!(
                        ip = %ip,
                        permanent,
                        "DNS error for {}: {message}",
                        recipient.email()
                    );
                    if !recipient.is_test() {
                        let (kind, email) = if permanent {
                            self.accounting.add_stat(StatType::Soft, profile, &key, false);
                            (EventType::Soft, recipient.email())
                        } else {
                            // counted when the caller reports the connection error
                            (EventType::Err, "")
                        };
                        self.accounting.emit(Event {
                            email: email.to_string(),
                            campaign_id: recipient.campaign_id().to_string(),
                            profile: profile.to_string(),
                            ip: ip.clone(),
                            domain: destination.to_string(),
                            message: filter_message(&message, recipient.email(), ip, ""),
                            ..Event::new(kind)
                        });
                        if permanent {
                            limits.record_sent(false);
                        }
                    }
                    return Err(GetConnError::Resolution {
                        message,
                        permanent,
                        lease: Lease {
                            profile: profile.to_string(),
                            key,
                            conn: None,
                        },
                    });
                }
            };

            let mx_host = &hosts[mx_index];
            let conn_key = ConnKey {
                ip: ip.clone(),
                mx_suffix: settings.mx_suffix(mx_host),
            };
            let pool = mta.conns.entry(conn_key.clone()).or_default();

            if over_limit(
                &key,
                &settings,
                warmups,
                limits,
                pool.busy_count() as u64,
                now,
            ) {
                continue;
            }

            let conn = match pool.checkout_idle(mx_host, now) {
                Some(conn) => conn,
                None if pool.can_grow() => {
                    *next_conn_id += 1;
                    let conn = SenderConn::new(ConnId(*next_conn_id), ip, mx_host, now);
                    pool.checkout_new(&conn);
                    CONNECTIONS_OPENED.with_label_values(&[profile]).inc();
                    conn
                }
                None => continue,
            };

            limits.last_attempt = Some(now);
            mta.cursor = idx + 1;
            return Ok(Attempt::Granted(Grant {
                lease: Lease {
                    profile: profile.to_string(),
                    key,
                    conn: Some((conn_key, conn.id)),
                },
                conn,
                settings,
            }));
        }

        Ok(Attempt::Wait)
    }

    /// Hands back the connection of a lease together with the verdict
    /// on the attempt, updating deferrals, counters and the pool size.
    pub fn process_result(
        &self,
        lease: &Lease,
        conn: Option<SenderConn>,
        result: &ConnResult,
        is_test: bool,
    ) {
        let mut state = self.state.lock();
        let now = self.now();

        let Some(mta) = state.mtas.get_mut(&lease.profile) else {
            // the profile was removed while the delivery was underway
            close_in_background(conn.into_iter().collect());
            self.available.notify_waiters();
            return;
        };
        let settings = mta.settings.clone();
        let key = &lease.key;

        let mut pool = match &lease.conn {
            Some((conn_key, id)) => match mta.conns.get_mut(conn_key) {
                Some(pool) => {
                    pool.checkin(*id, conn);
                    Some((pool, conn_key))
                }
                None => {
                    close_in_background(conn.into_iter().collect());
                    None
                }
            },
            None => {
                close_in_background(conn.into_iter().collect());
                None
            }
        };

        let limits = mta.limits.entry(key.clone()).or_default();
        if let Some(reason) = &result.defer {
            let was_deferred = limits.is_deferred(now);
            if let Some(secs) = limits.apply_defer(reason, settings.wait_secs(reason), now) {
                if result.log_defer {
                    self.accounting
                        .set_defer(&lease.profile, key, &result.message, secs);
                }
                if !was_deferred {
                    tracing::info!(
                        ip = %key.ip,
                        reason = %reason,
                        "deferred {} for {secs} seconds",
                        key.destination
                    );
                    DEFERRALS.with_label_values(&[&lease.profile]).inc();
                }
            }
        }

        let deferred = limits.is_deferred(now);
        if deferred {
            if let Some((pool, _)) = pool.as_mut() {
                close_in_background(pool.drain_idle());
            }
        }

        if let Some(stat) = result.stat {
            if !is_test {
                self.accounting.add_stat(stat, &lease.profile, key, deferred);
            }
        }

        if !result.retry {
            let delivered = result.kind == ResultKind::Delivered;
            limits.record_sent(delivered);
            if delivered {
                limits.defer_count = 0;
                if let Some((pool, conn_key)) = pool.as_mut() {
                    if !deferred && pool.grow(settings.num_conns(&conn_key.mx_suffix)) {
                        tracing::trace!(
                            ip = %key.ip,
                            "connection limit for {} now {}",
                            key.destination,
                            pool.dynamic_limit()
                        );
                    }
                }
            }
        } else if let Some((pool, _)) = pool.as_mut() {
            if pool.reset_limit() {
                DYNAMIC_LIMIT_RESETS.inc();
                tracing::trace!(ip = %key.ip, "reset connection limit for {} to 1", key.destination);
            }
        }

        self.persist_if_due(&mut state, now);
        drop(state);
        self.available.notify_waiters();
    }

    /// Replaces the sending policy. Profiles missing from the update
    /// are shut down; counters and warm-up stages of the others
    /// carry over.
    pub fn set_settings(&self, update: SettingsUpdate) {
        let SettingsUpdate {
            sinkid,
            mtasettings,
            ippauses,
            warmups,
            forcestart,
            ipdomains,
            allips,
            allsinks,
        } = update;

        let mut state = self.state.lock();
        let now = self.now();
        self.accounting.set_sink_id(&sinkid);
        state.sinkid = sinkid;

        let profiles: BTreeSet<String> = mtasettings.keys().cloned().collect();
        for (id, mut settings) in mtasettings {
            if !ipdomains.is_empty() {
                settings.ipdomains = ipdomains.clone();
            }
            settings.prepare();

            let mta = state.mtas.entry(id.clone()).or_default();
            mta.settings = Arc::new(settings);
            mta.pauses = ippauses
                .iter()
                .filter(|pause| pause.settingsid == id)
                .map(|pause| (pause.key(), pause.discard))
                .collect();
            for force in forcestart.iter().filter(|force| force.settingsid == id) {
                if let Some(limits) = mta.limits.get_mut(&force.key()) {
                    limits.defer_until = None;
                    tracing::info!("force started {}", force.key());
                }
            }
        }

        state.mtas.retain(|id, mta| {
            if profiles.contains(id) {
                return true;
            }
            tracing::info!("removing profile {id}");
            mta.shutdown();
            false
        });

        state.warmups.replace(warmups);
        let tracking_ids =
            TrackingIds::rebuild(state.mtas.keys().map(String::as_str), &allips, &allsinks);
        state.trackingids = tracking_ids;

        self.persist(&mut state, now);
        drop(state);
        self.available.notify_waiters();
    }

    /// One pass of the idle reaper: expires deferrals, applies rate
    /// deferrals when enabled, persists pending changes and closes
    /// idle connections. Returns true if blocked callers were woken.
    pub fn sweep(&self, idle_timeout: Duration, rate_deferral: bool, minute_elapsed: bool) -> bool {
        let mut state = self.state.lock();
        let now = self.now();
        let idle_cutoff = now - idle_timeout;
        let mut expired = false;
        let mut rate_deferred = false;

        let SenderState { mtas, warmups, .. } = &mut *state;
        for (profile, mta) in mtas.iter_mut() {
            let settings = mta.settings.clone();
            let check_rate = rate_deferral && settings.ratedefer && minute_elapsed;

            for (key, limits) in mta.limits.iter_mut() {
                if limits.expire_defer(now) {
                    tracing::trace!("deferral of {key} expired");
                    expired = true;
                } else if check_rate
                    && (limits.defer_until.is_none() || limits.defer_reason != DeferReason::Rate)
                    && !over_limit(key, &settings, warmups, limits, 0, now)
                {
                    if let Some(secs) = limits.check_delivery_rate(&settings, now) {
                        let msg = format!(
                            "Rate deferral: failed to deliver {} messages in {} minutes",
                            settings.ratedefertarget, settings.ratedefercheckmins
                        );
                        self.accounting.set_defer(profile, key, &msg, secs);
                        tracing::info!(
                            ip = %key.ip,
                            "deferred {} for {secs} seconds (send rate too low)",
                            key.destination
                        );
                        DEFERRALS.with_label_values(&[profile]).inc();
                        rate_deferred = true;
                    }
                }
            }

            for pool in mta.conns.values_mut() {
                close_in_background(pool.trim(idle_cutoff));
            }
        }

        if rate_deferred || state.dirty {
            self.persist(&mut state, now);
        }
        drop(state);

        let wake = expired || minute_elapsed;
        if wake {
            self.available.notify_waiters();
        }
        wake
    }

    /// The daily limit of every known key that has one
    pub fn limits_report(&self) -> Vec<LimitEntry> {
        let state = self.state.lock();
        let mut entries = vec![];
        for (profile, mta) in &state.mtas {
            for key in mta.limits.keys() {
                let (limit, warmup) = match state.warmups.effective_limit(key) {
                    Some((limit, id)) => (Some(limit), id.to_string()),
                    None => (mta.settings.ip_limit(key), String::new()),
                };
                if let Some(limit) = limit {
                    entries.push(LimitEntry {
                        profile: profile.clone(),
                        destination: key.destination.clone(),
                        ip: key.ip.clone(),
                        limit,
                        warmup,
                    });
                }
            }
        }
        entries
    }

    /// The tracking id to embed in a message sent through `ip`, or
    /// None if the profile is not known.
    pub fn tracking_id(&self, sink_id: &str, profile: &str, ip: &str) -> Option<String> {
        let state = self.state.lock();
        if !state.mtas.contains_key(profile) {
            return None;
        }
        Some(tracking::tracking_id(sink_id, profile, ip, self.now()))
    }

    pub fn find_tracking_id(&self, id: &str) -> Option<(TrackingTarget, Option<i32>)> {
        let state = self.state.lock();
        state
            .trackingids
            .find(id)
            .map(|(target, hours)| (target.clone(), hours))
    }

    /// A copy of the counters of one key
    pub fn limits(&self, profile: &str, key: &LimitKey) -> Option<SendLimits> {
        let state = self.state.lock();
        state.mtas.get(profile)?.limits.get(key).cloned()
    }

    pub fn pool_status(&self, profile: &str) -> Vec<PoolStatus> {
        let state = self.state.lock();
        let Some(mta) = state.mtas.get(profile) else {
            return vec![];
        };
        mta.conns
            .iter()
            .map(|(conn_key, pool)| PoolStatus {
                conn_key: conn_key.clone(),
                idle: pool.idle_count(),
                busy: pool.busy_count(),
                dynamic_limit: pool.dynamic_limit(),
            })
            .collect()
    }

    /// Closes every idle connection of every profile
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for mta in state.mtas.values_mut() {
            mta.shutdown();
        }
        drop(state);
        self.available.notify_waiters();
    }
}
