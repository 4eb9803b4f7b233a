use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use memo_cache::config::Logging;
use memo_cache::logging::{init_json_logging, init_logging};
use memo_cache::metrics;

#[derive(Debug, Default)]
pub struct Config {
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub udp_sink: Option<UdpSink>,
}

/// Sets up tracing and metrics for the stresstest.
///
/// With `config.tracing`, logs are printed as configured in `logging`. Otherwise all the tracing
/// machinery is still active, but its output is discarded.
pub fn init(config: Config, logging: &Logging) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.tracing {
        init_logging(logging);
    } else {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void, in the format used in production:
        init_json_logging("INFO,memo_cache=DEBUG", || NoopWriter);
    }

    if config.metrics {
        let (port, udp_sink) = udp_sink()?;
        guard.udp_sink = Some(udp_sink);

        let host = format!("127.0.0.1:{port}");

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd("memo", host, tags)?;
    }

    Ok(guard)
}

pub type UdpSink = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Binds a local UDP socket, returning its port and a future that swallows everything sent to it.
fn udp_sink() -> Result<(u16, UdpSink)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    let sink: UdpSink = Box::pin(async move {
        let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
            return;
        };
        let mut buf = [0u8; 1024];
        loop {
            if listener.recv(&mut buf).await.is_err() {
                break;
            }
        }
    });

    Ok((port, sink))
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
