use prometheus::{IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

pub static CONNECTIONS_OPENED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "egressd_connections_opened_total",
        "number of pooled connections created, by profile",
        &["profile"]
    )
    .unwrap()
});

pub static DEFERRALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "egressd_deferrals_total",
        "number of times a destination and IP pair was deferred, by profile",
        &["profile"]
    )
    .unwrap()
});

pub static DYNAMIC_LIMIT_RESETS: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "egressd_dynamic_limit_resets_total",
        "number of times a connection pool collapsed back to one connection"
    )
    .unwrap()
});

pub static EVENTS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "egressd_accounting_events_dropped_total",
        "accounting events discarded because the shipping channel was full"
    )
    .unwrap()
});

pub static BLOCKED_CALLERS: LazyLock<IntGauge> = LazyLock::new(|| {
    prometheus::register_int_gauge!(
        "egressd_blocked_callers",
        "number of deliveries waiting for a connection to become available"
    )
    .unwrap()
});

/// Totals per metric family in the default registry, summed over
/// label values. Histograms and summaries are left out.
pub fn totals() -> Vec<(String, f64)> {
    use prometheus::proto::MetricType;

    prometheus::default_registry()
        .gather()
        .into_iter()
        .filter_map(|mf| {
            let total: f64 = match mf.get_field_type() {
                MetricType::COUNTER => mf
                    .get_metric()
                    .iter()
                    .map(|m| m.get_counter().value())
                    .sum(),
                MetricType::GAUGE => mf
                    .get_metric()
                    .iter()
                    .map(|m| m.get_gauge().value())
                    .sum(),
                _ => return None,
            };
            Some((mf.get_name().to_string(), total))
        })
        .collect()
}

pub fn log_totals() {
    let summary = totals()
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ");
    if !summary.is_empty() {
        tracing::info!("metrics: {summary}");
    }
}
