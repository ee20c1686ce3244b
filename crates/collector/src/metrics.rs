use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static REPORT_QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REPORT_QUERY_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static DIRECTORY_PAGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LOGINS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static OVERLOAD_SIGNALS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static COOLDOWNS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn report_queries_total() -> &'static IntCounterVec {
    REPORT_QUERIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "hometax_report_queries_total",
                    "Report queries by category and outcome.",
                ),
                &["category", "outcome"],
            )
            .expect("create hometax_report_queries_total"),
        )
    })
}

fn report_query_duration_seconds() -> &'static HistogramVec {
    REPORT_QUERY_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "hometax_report_query_duration_seconds",
                    "Report query duration in seconds, pacing sleeps included.",
                )
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
                &["category"],
            )
            .expect("create hometax_report_query_duration_seconds"),
        )
    })
}

fn directory_pages_total() -> &'static IntCounterVec {
    DIRECTORY_PAGES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "hometax_directory_pages_total",
                    "Client directory pages fetched.",
                ),
                &["outcome"],
            )
            .expect("create hometax_directory_pages_total"),
        )
    })
}

fn logins_total() -> &'static IntCounterVec {
    LOGINS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("hometax_logins_total", "Session establishment attempts."),
                &["outcome"],
            )
            .expect("create hometax_logins_total"),
        )
    })
}

fn overload_signals_total() -> &'static IntCounter {
    OVERLOAD_SIGNALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "hometax_overload_signals_total",
                "Responses carrying an overload notice.",
            )
            .expect("create hometax_overload_signals_total"),
        )
    })
}

fn cooldowns_total() -> &'static IntCounter {
    COOLDOWNS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new("hometax_cooldowns_total", "Overload cooldown sleeps taken.")
                .expect("create hometax_cooldowns_total"),
        )
    })
}

pub fn observe_report_query(category: &str, outcome: &str, duration: Duration) {
    report_queries_total()
        .with_label_values(&[category, outcome])
        .inc();
    report_query_duration_seconds()
        .with_label_values(&[category])
        .observe(duration.as_secs_f64());
}

pub fn observe_directory_page(outcome: &str) {
    directory_pages_total().with_label_values(&[outcome]).inc();
}

pub fn observe_login(outcome: &str) {
    logins_total().with_label_values(&[outcome]).inc();
}

pub fn observe_overload() {
    overload_signals_total().inc();
}

pub fn observe_cooldown() {
    cooldowns_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = overload_signals_total();
    let _ = cooldowns_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
