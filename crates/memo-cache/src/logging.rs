use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, Logging};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             memo_cache=DEBUG,\
             memo_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             moka=DEBUG,\
             memo_cache=TRACE,\
             memo_stress=TRACE"
        }
    }
}

/// Initializes logging for applications using the memo cache.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration.
pub fn init_logging(config: &Logging) {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match (config.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => {
                init_json_logging(&rust_log, std::io::stdout);
                return;
            }
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    // Errors become Sentry events, warnings and infos are kept as breadcrumbs.
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Initializes JSON line logging to the given writer.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_levels() {
        assert_eq!(get_rust_log(LevelFilter::OFF), "");
        assert!(get_rust_log(LevelFilter::DEBUG).contains("memo_cache=DEBUG"));
        assert!(get_rust_log(LevelFilter::TRACE).contains("memo_cache=TRACE"));

        for level in [
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ] {
            assert!(EnvFilter::try_new(get_rust_log(level)).is_ok());
        }
    }
}
