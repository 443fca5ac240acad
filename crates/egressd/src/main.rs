use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dns_resolver::{DnsCache, HickoryResolver};
use egressd::accounting::{Accounting, EventShipper, ShipperConfig};
use egressd::classify::{classify_failure, DeliveryError};
use egressd::config::DaemonConfig;
use egressd::lifecycle::{wait_for_signal, LifeCycle, ShutdownSubscription};
use egressd::queue_status::QueueStatus;
use egressd::reaper::{run_reaper, ReaperConfig};
use egressd::reporting::{run_reporting, ReportIntervals, Reporter};
use egressd::sender::Sender;
use egressd::settings::{MtaSettings, SettingsUpdate};
use egressd::state::StateStore;
use egressd::upstream::{DiscardUpstream, HttpUpstream, Upstream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "egressd=info,dns_resolver=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(about = "bulk outbound mail delivery daemon")]
struct Opt {
    /// Configuration file to load. Built-in defaults apply when
    /// omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    #[command(subcommand)]
    cmd: Option<SubCommand>,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Run the daemon. This is the default.
    Run,
    /// Show how a server reply would be treated, using the
    /// configured bounce rules
    Classify {
        /// The reply text, eg: "550 5.1.1 user unknown"
        reply: Vec<String>,
    },
    /// Look up which sink, profile and IP a tracking id belongs to,
    /// using the persisted state
    FindTrackingId { id: String },
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let (non_blocking, _non_blocking_flusher);
    let log_writer = if let Some(log_dir) = &opts.diag_log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
        (non_blocking, _non_blocking_flusher) = tracing_appender::non_blocking(file_appender);
        BoxMakeWriter::new(non_blocking)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(
            EnvFilter::try_from_env("EGRESSD_LOG")
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = match &opts.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    match opts.cmd.unwrap_or(SubCommand::Run) {
        SubCommand::Run => run_daemon(config).await,
        SubCommand::Classify { reply } => classify(&config, &reply.join(" ")),
        SubCommand::FindTrackingId { id } => find_tracking_id(&config, &id),
    }
}

fn classify(config: &DaemonConfig, reply: &str) -> anyhow::Result<()> {
    let classifier = config.bounce_classifier()?;
    let settings = match &config.settings_path {
        Some(path) => SettingsUpdate::load(path)?
            .mtasettings
            .into_values()
            .next()
            .unwrap_or_default(),
        None => MtaSettings::default(),
    };

    let error = DeliveryError::from_text(reply, false);
    if let DeliveryError::Reply { reply, .. } = &error {
        println!("class: {:?}", classifier.classify_reply(reply));
    }
    let result = classify_failure(&classifier, &settings, &error, true);
    println!("outcome: {:?}", result.kind);
    println!("retry: {}", result.retry);
    if let Some(defer) = &result.defer {
        println!("defer: {defer}");
    }
    Ok(())
}

fn find_tracking_id(config: &DaemonConfig, id: &str) -> anyhow::Result<()> {
    let sender = Sender::new(
        Arc::new(DnsCache::new(Arc::new(HickoryResolver::from_system_conf()?))),
        Accounting::new(1).0,
        StateStore::new(config.state_path.clone()),
    );
    if !sender.restore()? {
        anyhow::bail!("no state found at {}", config.state_path.display());
    }
    match sender.find_tracking_id(id) {
        Some((target, hours)) => {
            println!("sink: {}", target.sink_id);
            println!("profile: {}", target.profile);
            println!("ip: {}", target.ip);
            if let Some(hours) = hours {
                println!("hours since epoch: {hours}");
            }
            Ok(())
        }
        None => anyhow::bail!("unknown tracking id {id}"),
    }
}

fn apply_settings(sender: &Sender, path: &Path) -> anyhow::Result<()> {
    let update = SettingsUpdate::load(path)?;
    tracing::info!(
        "applying settings for {} profiles from {}",
        update.mtasettings.len(),
        path.display()
    );
    sender.set_settings(update);
    Ok(())
}

async fn reload_on_hangup(
    sender: Arc<Sender>,
    path: PathBuf,
    mut shutdown: ShutdownSubscription,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    if let Err(err) = apply_settings(&sender, &path) {
                        tracing::error!("reloading settings: {err:#}");
                    }
                }
                _ = shutdown.shutting_down() => break,
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (sender, path);
        shutdown.shutting_down().await;
    }
    Ok(())
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    let life = LifeCycle::new();

    let resolver = HickoryResolver::from_system_conf()?;
    let dns = Arc::new(DnsCache::new(Arc::new(resolver)).with_ttl(config.dns_ttl));
    let (accounting, events) = Accounting::new(config.event_channel_capacity);
    let store = StateStore::new(config.state_path.clone());
    let sender = Arc::new(
        Sender::new(dns, accounting.clone(), store.clone())
            .with_persist_min_interval(config.persist_min_interval),
    );

    match sender.restore() {
        Ok(true) => {}
        Ok(false) => tracing::info!(
            "no state at {}, starting fresh",
            config.state_path.display()
        ),
        Err(err) => tracing::error!("{err:#}; starting with empty state"),
    }
    if let Some(path) = &config.settings_path {
        apply_settings(&sender, path)?;
    }

    let upstream: Arc<dyn Upstream> = match &config.upstream_url {
        Some(url) => Arc::new(HttpUpstream::new(url, &config.access_key)?),
        None => {
            tracing::warn!("no upstream_url configured; events and reports will be discarded");
            Arc::new(DiscardUpstream)
        }
    };

    let mut tasks = vec![];
    tasks.push(tokio::spawn(store.clone().run_writer(life.subscribe())));
    tasks.push(tokio::spawn(
        EventShipper::new(
            events,
            accounting.clone(),
            upstream.clone(),
            ShipperConfig {
                batch_size: config.event_batch_size,
                flush_interval: config.event_flush_interval,
                saved_events_path: config.saved_events_path.clone(),
            },
        )
        .run(life.subscribe()),
    ));
    tasks.push(tokio::spawn(run_reaper(
        sender.clone(),
        ReaperConfig {
            interval: config.reaper_interval,
            idle_timeout: config.idle_timeout,
            rate_deferral: config.rate_deferral,
        },
        life.subscribe(),
    )));
    let reporter = Arc::new(Reporter::new(
        sender.clone(),
        accounting.clone(),
        Arc::new(QueueStatus::default()),
        upstream,
    ));
    tasks.push(tokio::spawn(run_reporting(
        reporter,
        ReportIntervals {
            stats: config.stats_interval,
            queue: config.queue_interval,
            limits: config.limits_interval,
        },
        life.subscribe(),
    )));
    let reload = config
        .settings_path
        .clone()
        .map(|path| tokio::spawn(reload_on_hangup(sender.clone(), path, life.subscribe())));

    tracing::info!("egressd started");
    wait_for_signal().await?;

    life.request_shutdown();
    sender.shutdown();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!("background task failed: {err:#}");
        }
    }
    if let Some(reload) = reload {
        match reload.await {
            Ok(Err(err)) => tracing::error!("{err:#}"),
            Err(err) => tracing::error!("settings reload task failed: {err:#}"),
            Ok(Ok(())) => {}
        }
    }

    sender.save_now().context("saving state at shutdown")?;
    tracing::info!("shutdown complete");
    Ok(())
}
