//! Statsd metrics for memo caches.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro. Until a client is configured
//! via [`configure`] or [`configure_statsd`], emitting a metric does nothing at all.
use std::cell::Cell;
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, MetricSink, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

thread_local! {
    static CURRENT_CLIENT: Cell<Option<&'static MetricsClient>> = Cell::new(METRICS_CLIENT.get());
}

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,

    /// Tags sent with every metric, in addition to the ones given at the call site.
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Creates a client prefixing all metrics with `prefix`, and sending them to `sink`.
    pub fn new<S>(prefix: &str, sink: S, default_tags: BTreeMap<String, String>) -> Self
    where
        S: MetricSink + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            default_tags,
        }
    }

    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.default_tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &Self::Target {
        &self.statsd_client
    }
}

/// Sets up metrics as described by the `metrics` section of the config.
///
/// Returns `false` if no statsd server is configured.
pub fn configure(config: &Metrics) -> Result<bool> {
    let Some(ref statsd) = config.statsd else {
        return Ok(false);
    };
    configure_statsd(&config.prefix, statsd, config.custom_tags.clone())?;
    Ok(true)
}

/// Tell the metrics system to report to statsd.
///
/// Only the first successful call installs a client, later calls are ignored with a warning.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {}", addr);
    }

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    if METRICS_CLIENT
        .set(MetricsClient::new(prefix, sink, tags))
        .is_err()
    {
        tracing::warn!("A statsd client was already configured");
    }
    Ok(())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part
/// the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    match CURRENT_CLIENT.with(Cell::get) {
        Some(client) => f(client),
        None => Default::default(),
    }
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    // counters
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.count_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // gauges
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.gauge_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};

    // timers
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.time_with_tags($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

/// Captures the metrics emitted on the current thread, for as long as it is alive.
#[cfg(test)]
pub(crate) struct CapturedMetrics {
    lines: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
    previous: Option<&'static MetricsClient>,
}

#[cfg(test)]
impl CapturedMetrics {
    pub fn start() -> Self {
        #[derive(Clone)]
        struct CaptureSink(std::sync::Arc<std::sync::Mutex<Vec<String>>>);

        impl MetricSink for CaptureSink {
            fn emit(&self, metric: &str) -> std::io::Result<usize> {
                self.0.lock().unwrap().push(metric.to_owned());
                Ok(metric.len())
            }
        }

        let lines = std::sync::Arc::default();
        let sink = CaptureSink(std::sync::Arc::clone(&lines));
        let tags = BTreeMap::from([("env".to_owned(), "test".to_owned())]);
        // one small leak per test, so the client can live in the thread-local
        let client: &'static MetricsClient =
            Box::leak(Box::new(MetricsClient::new("test", sink, tags)));
        let previous = CURRENT_CLIENT.with(|current| current.replace(Some(client)));

        Self { lines, previous }
    }

    /// The captured metric lines, in statsd format.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// The captured lines of the metric called `name`.
    pub fn named(&self, name: &str) -> Vec<String> {
        let prefix = format!("test.{name}:");
        self.lines()
            .into_iter()
            .filter(|line| line.starts_with(&prefix))
            .collect()
    }
}

#[cfg(test)]
impl Drop for CapturedMetrics {
    fn drop(&mut self) {
        CURRENT_CLIENT.with(|current| current.set(self.previous));
    }
}
