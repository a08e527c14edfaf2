use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` takes precedence over `debug`.
pub fn init(debug: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug));
  // a second install (tests, embedding) keeps the first subscriber
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init();
}

fn default_filter(debug: bool) -> EnvFilter {
  let level = if debug { "debug" } else { "info" };
  EnvFilter::new(format!("chatrelay={level},tower_http={level},warn"))
}
