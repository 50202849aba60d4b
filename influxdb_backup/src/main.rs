//! Entrypoint of the InfluxDB per-field backup binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::path::PathBuf;

use influxdb_backup::{
    get_runtime, load_dotenv, logging::init_logging, runner, ReturnCode, VERSION_STRING,
};

#[derive(Debug, clap::Parser)]
#[clap(
    name = "influxdb_backup",
    version = &VERSION_STRING[..],
    about = "Per-field incremental backup for InfluxDB 1.x",
    long_about = r#"Per-field incremental backup for InfluxDB 1.x

Each (measurement, field) pair is an independent backup unit: its resume
point is derived from the destination database itself, so concurrent fields
can never contaminate each other's watermarks.

Examples:
    # Run every configuration in a directory, one process each:
    influxdb_backup --config /etc/influxdb_backup/

    # Run a single configuration with info logging:
    influxdb_backup --config plant_a.yaml -v

    # Check a configuration and the endpoints without copying anything:
    influxdb_backup --config plant_a.yaml --validate-only

Exit codes: 0 success, 2 invalid configuration, 3 at least one field
failed, 4 endpoint unreachable after retries.
"#
)]
struct Config {
    /// Log filter short-hand.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper::proto::h1=info,h2=info'
    ///
    /// -vvv 'trace,hyper::proto::h1=info,h2=info'
    ///
    /// Overrides LOG_FILTER.
    #[clap(
        short = 'v',
        long = "--verbose",
        multiple_occurrences = true,
        takes_value = false,
        parse(from_occurrences)
    )]
    log_verbose_count: u8,

    /// One configuration file, or a directory of them
    #[clap(short, long, env = "INFLUXDB_BACKUP_CONFIG")]
    config: PathBuf,

    /// Load the configuration, check connectivity and enumerate the work
    /// plan, then exit without copying anything
    #[clap(long)]
    validate_only: bool,

    #[clap(long)]
    /// Set the maximum number of threads to use. Defaults to the number of
    /// cores on the system
    num_threads: Option<usize>,
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = get_runtime(config.num_threads)?;
    tokio_runtime.block_on(async move {
        if let Err(e) = init_logging(config.log_verbose_count) {
            eprintln!("Initializing logs failed: {}", e);
            std::process::exit(1);
        }

        let code = runner::run(&config.config, config.validate_only, config.log_verbose_count).await;
        if code != ReturnCode::Success {
            std::process::exit(code as i32);
        }
    });

    Ok(())
}
