use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Install the global subscriber. Logs go to stderr so that stdout carries
/// only the run report. `RUST_LOG` overrides the default `info` level.
pub fn setup_logging(json: bool) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder().with_env_filter(filter).with_writer(std::io::stderr).with_target(false);
    let subscriber: Box<dyn Subscriber + Send + Sync> = match json {
        true => Box::new(builder.json().flatten_event(true).finish()),
        false => Box::new(builder.compact().finish()),
    };
    tracing::subscriber::set_global_default(subscriber)
}
