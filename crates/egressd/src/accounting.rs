//! Delivery events and per key statistics destined for the
//! management plane.
//!
//! Producers never block: events travel over a bounded channel and
//! are discarded, and counted, when it is full. The [`EventShipper`]
//! task on the other end merges, batches and posts them.
use crate::keys::LimitKey;
use crate::lifecycle::ShutdownSubscription;
use crate::metrics::EVENTS_DROPPED;
use crate::state::write_atomic;
use crate::upstream::{ReportKind, Upstream};
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc::{error::TrySendError, Receiver, Sender};

/// Ordinary events kept for a later attempt while the upstream
/// is failing; beyond this the oldest are discarded.
const MAX_RETAINED_EVENTS: usize = 100_000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Send,
    Err,
    Defer,
    Soft,
    Hard,
    Canceled,
    Discarded,
}

impl EventType {
    /// Counted events are merged into one record per distinct content
    fn is_counted(self) -> bool {
        matches!(self, Self::Send | Self::Err | Self::Defer)
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "t")]
    pub kind: EventType,
    #[serde(rename = "e", default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    pub campaign_id: String,
    #[serde(rename = "s", default, skip_serializing_if = "String::is_empty")]
    pub profile: String,
    #[serde(rename = "i", default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(rename = "d", default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(rename = "m", default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "n", default, skip_serializing_if = "is_zero")]
    pub count: u64,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            email: String::new(),
            campaign_id: String::new(),
            profile: String::new(),
            ip: String::new(),
            domain: String::new(),
            message: String::new(),
            count: 0,
        }
    }

    fn same_content(&self, other: &Event) -> bool {
        self.kind == other.kind
            && self.email == other.email
            && self.campaign_id == other.campaign_id
            && self.profile == other.profile
            && self.ip == other.ip
            && self.domain == other.domain
            && self.message == other.message
    }
}

static GMAIL_ID: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r" [a-z0-9\-]+\.[0-9]+ - gsmtp$").unwrap());

/// Removes recipient specific details from a server response so
/// that identical failures merge into one counted event.
pub fn filter_message(msg: &str, email: &str, ip: &str, mx_host: &str) -> String {
    let msg = msg.strip_prefix("short response: ").unwrap_or(msg);
    if msg == "EOF" || msg == "[EOF]" {
        return "Connection closed by server".to_string();
    }

    let mut msg = GMAIL_ID.replace(msg, " <gmailid> - gsmtp").into_owned();
    if !email.is_empty() {
        msg = msg.replace(email, "<to email>");
    }
    if !ip.is_empty() {
        msg = msg.replace(ip, "<ip>");
    }
    if !mx_host.is_empty() {
        msg = msg.replace(mx_host, "<mx host>");
    }
    if let Some((local, _)) = email.split_once('@') {
        if !local.is_empty() {
            msg = msg.replace(local, "<username>");
        }
    }
    msg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    Send,
    Soft,
    Hard,
    Err,
}

/// Counters for one (profile, key), split by whether the key was
/// deferred when the outcome was recorded.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IpStats {
    pub send: u64,
    pub soft: u64,
    pub hard: u64,
    pub err: u64,
    pub defermsg: String,
    pub deferlen: u64,
    pub dsend: u64,
    pub dsoft: u64,
    pub dhard: u64,
    pub derr: u64,
}

impl IpStats {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct IpStatsMsg {
    pub settingsid: String,
    pub key: LimitKey,
    #[serde(flatten)]
    pub stats: IpStats,
}

pub struct Accounting {
    tx: Sender<Event>,
    stats: Mutex<BTreeMap<(String, LimitKey), IpStats>>,
    dropped: AtomicU64,
    sink_id: RwLock<String>,
}

impl Accounting {
    /// Returns the accounting handle and the receiving end for
    /// the [`EventShipper`].
    pub fn new(capacity: usize) -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let accounting = Arc::new(Self {
            tx,
            stats: Mutex::new(BTreeMap::new()),
            dropped: AtomicU64::new(0),
            sink_id: RwLock::new(String::new()),
        });
        (accounting, rx)
    }

    pub fn sink_id(&self) -> String {
        self.sink_id.read().clone()
    }

    pub fn set_sink_id(&self, sink_id: &str) {
        *self.sink_id.write() = sink_id.to_string();
    }

    /// Queues an event for shipping. When the channel is full the
    /// event is discarded rather than waiting for room.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EVENTS_DROPPED.inc();
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("event shipper has stopped; discarding {event:?}");
            }
        }
    }

    /// Number of events discarded since the last call
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    pub fn add_stat(&self, stat: StatType, profile: &str, key: &LimitKey, deferred: bool) {
        let mut stats = self.stats.lock();
        let entry = stats
            .entry((profile.to_string(), key.clone()))
            .or_default();
        let counter = match (stat, deferred) {
            (StatType::Send, false) => &mut entry.send,
            (StatType::Soft, false) => &mut entry.soft,
            (StatType::Hard, false) => &mut entry.hard,
            (StatType::Err, false) => &mut entry.err,
            (StatType::Send, true) => &mut entry.dsend,
            (StatType::Soft, true) => &mut entry.dsoft,
            (StatType::Hard, true) => &mut entry.dhard,
            (StatType::Err, true) => &mut entry.derr,
        };
        *counter += 1;
    }

    /// Records the most recent deferral of a key
    pub fn set_defer(&self, profile: &str, key: &LimitKey, msg: &str, secs: u64) {
        let mut stats = self.stats.lock();
        let entry = stats
            .entry((profile.to_string(), key.clone()))
            .or_default();
        entry.defermsg = msg.to_string();
        entry.deferlen = secs;
    }

    /// Returns the non-empty entries and zeroes them
    pub fn take_stats(&self) -> Vec<IpStatsMsg> {
        let mut stats = self.stats.lock();
        let mut result = vec![];
        for ((profile, key), entry) in stats.iter_mut() {
            if entry.is_empty() {
                continue;
            }
            result.push(IpStatsMsg {
                settingsid: profile.clone(),
                key: key.clone(),
                stats: std::mem::take(entry),
            });
        }
        result
    }
}

/// Events accumulated between posts
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub statevents: Vec<Event>,
}

impl EventBatch {
    pub fn push(&mut self, mut event: Event) {
        if event.kind.is_counted() {
            if let Some(existing) = self
                .statevents
                .iter_mut()
                .rev()
                .find(|existing| existing.same_content(&event))
            {
                existing.count += 1;
                return;
            }
            event.count = 1;
            self.statevents.push(event);
        } else {
            event.count = 1;
            self.events.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.statevents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub saved_events_path: Option<PathBuf>,
}

pub struct EventShipper {
    rx: Receiver<Event>,
    accounting: Arc<Accounting>,
    upstream: Arc<dyn Upstream>,
    config: ShipperConfig,
}

impl EventShipper {
    pub fn new(
        rx: Receiver<Event>,
        accounting: Arc<Accounting>,
        upstream: Arc<dyn Upstream>,
        config: ShipperConfig,
    ) -> Self {
        Self {
            rx,
            accounting,
            upstream,
            config,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownSubscription) {
        let mut batch = EventBatch {
            events: self.load_saved(),
            ..Default::default()
        };
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        // While the upstream is failing, only the ticker retries
        let mut retrying = false;

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => {
                            batch.push(event);
                            if !retrying && batch.len() >= self.config.batch_size {
                                retrying = !self.flush(&mut batch).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        retrying = !self.flush(&mut batch).await;
                    }
                }
                _ = shutdown.shutting_down() => break,
            }
        }

        while let Ok(event) = self.rx.try_recv() {
            batch.push(event);
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
    }

    /// Posts the batch. On failure the individual events are kept
    /// and spilled to disk, and false is returned.
    async fn flush(&self, batch: &mut EventBatch) -> bool {
        let dropped = self.accounting.take_dropped();
        if dropped > 0 {
            tracing::warn!("{dropped} accounting events were discarded because the queue was full");
        }

        let body = match serde_json::to_value(&*batch) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!("encoding events: {err:#}");
                *batch = EventBatch::default();
                return true;
            }
        };

        let sink_id = self.accounting.sink_id();
        match self.upstream.post(ReportKind::Events, &sink_id, body).await {
            Ok(()) => {
                tracing::debug!(
                    "logged {} events, {} statevents",
                    batch.events.len(),
                    batch.statevents.len()
                );
                *batch = EventBatch::default();
                self.remove_saved();
                true
            }
            Err(err) => {
                tracing::error!("logging events: {err:#}");
                // Counted events are only statistics; keep the
                // individual records for the next attempt.
                batch.statevents.clear();
                let excess = batch.events.len().saturating_sub(MAX_RETAINED_EVENTS);
                if excess > 0 {
                    batch.events = batch.events.split_off(excess);
                    tracing::warn!("discarded {excess} retained events");
                }
                self.spill(&batch.events).await;
                false
            }
        }
    }

    fn load_saved(&self) -> Vec<Event> {
        let Some(path) = &self.config.saved_events_path else {
            return vec![];
        };
        let result = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|data| {
                serde_json::from_slice::<Vec<Event>>(&data)
                    .with_context(|| format!("parsing {}", path.display()))
            });
        match result {
            Ok(events) => {
                tracing::info!("loaded {} saved events", events.len());
                self.remove_saved();
                events
            }
            Err(err) => {
                if path.exists() {
                    tracing::error!("{err:#}");
                    self.remove_saved();
                }
                vec![]
            }
        }
    }

    async fn spill(&self, events: &[Event]) {
        let Some(path) = &self.config.saved_events_path else {
            return;
        };
        if events.is_empty() {
            return;
        }
        let data = match serde_json::to_vec(events) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("encoding events: {err:#}");
                return;
            }
        };
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic(&target, &data))
            .await
            .context("joining event writer")
            .and_then(|result| result);
        if let Err(err) = result {
            tracing::error!("saving events to {}: {err:#}", path.display());
        }
    }

    fn remove_saved(&self) {
        if let Some(path) = &self.config.saved_events_path {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("removing {}: {err:#}", path.display());
                }
            }
        }
    }
}
