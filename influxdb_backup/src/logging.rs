//! Log initialisation.
//!
//! The filter comes from `LOG_FILTER` when set, otherwise from the number of
//! `-v` flags: `-v` info, `-vv` debug (with the HTTP internals quietened),
//! `-vvv` trace.

use tracing_subscriber::EnvFilter;

pub fn init_logging(log_verbose_count: u8) -> Result<(), String> {
    let filter = match std::env::var("LOG_FILTER") {
        Ok(filter) if !filter.is_empty() => filter,
        _ => match log_verbose_count {
            0 => "warn".to_string(),
            1 => "info".to_string(),
            2 => "debug,hyper::proto::h1=info,h2=info,reqwest=info".to_string(),
            _ => "trace,hyper::proto::h1=info,h2=info,reqwest=info".to_string(),
        },
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .try_init()
        .map_err(|e| e.to_string())
}
