use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::Result;
use concordance_service::config::Config as ServiceConfig;
use concordance_service::{logging, metrics};

#[derive(Debug)]
pub struct Config<'a> {
    /// The service configuration, providing the logging, metrics and sentry settings.
    pub service: &'a ServiceConfig,
    /// Enable tracing with all events being discarded, instead of the configured logging.
    pub tracing: bool,
    /// Send metrics to a local sink, unless a statsd server is configured.
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Where metrics are reported to.
#[derive(Debug, PartialEq, Eq)]
enum MetricsTarget<'a> {
    /// The statsd server from the service configuration.
    Statsd(&'a str),
    /// A local sink discarding everything.
    LocalSink,
    Disabled,
}

fn metrics_target<'a>(service: &'a ServiceConfig, local_sink: bool) -> MetricsTarget<'a> {
    match service.metrics.statsd {
        Some(ref statsd) => MetricsTarget::Statsd(statsd),
        None if local_sink => MetricsTarget::LocalSink,
        None => MetricsTarget::Disabled,
    }
}

/// Sets up sentry, logging and metrics.
///
/// Must be called before any other threads are started.
pub fn init(config: Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.service.sentry_dsn.is_some() {
        guard.sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: config.service.sentry_dsn.clone(),
            ..Default::default()
        }));
    }

    if config.tracing {
        // SAFETY: as documented, no other threads are running yet.
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO", || NoopWriter);
    } else {
        // SAFETY: as documented, no other threads are running yet.
        unsafe { logging::init_logging(config.service) };
    }

    match metrics_target(config.service, config.metrics) {
        MetricsTarget::Statsd(statsd) => {
            let metrics_config = &config.service.metrics;
            metrics::configure_statsd(
                &metrics_config.prefix,
                statsd,
                metrics_config.custom_tags.clone(),
            )?;
        }
        MetricsTarget::LocalSink => {
            let addr = SocketAddr::from(([127, 0, 0, 1], 0));
            let listener = UdpSocket::bind(addr)?;
            listener.set_nonblocking(true)?;
            let socket = listener.local_addr()?;

            guard.udp_sink = Some(Box::pin(async move {
                let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                    return;
                };
                let mut buf = Vec::with_capacity(1024);
                loop {
                    buf.clear();
                    if listener.recv_buf(&mut buf).await.is_err() {
                        break;
                    }
                }
            }));

            let host = format!("127.0.0.1:{}", socket.port());

            // have some default tags, just to be closer to the real world config
            let mut tags = BTreeMap::new();
            tags.insert("host".into(), "stresstest".into());
            tags.insert("env".into(), "stresstest".into());

            metrics::configure_statsd(&config.service.metrics.prefix, host, tags)?;
        }
        MetricsTarget::Disabled => {}
    }

    Ok(guard)
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
