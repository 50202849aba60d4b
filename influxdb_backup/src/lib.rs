#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! The `influxdb_backup` binary: CLI, runtime bootstrap and multi-config
//! fan-out around the [`backup_core`] engine.

use dotenv::dotenv;
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

pub mod logging;
pub mod runner;

pub static VERSION_STRING: Lazy<String> = Lazy::new(|| {
    format!(
        "{}, revision {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("UNKNOWN"),
        option_env!("GIT_HASH").unwrap_or("UNKNOWN")
    )
});

/// Process exit codes. `0` is implicit success; everything else tells a
/// supervisor what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    /// A configuration failed to load or validate. Never retried.
    ConfigInvalid = 2,
    /// At least one field failed; its watermark is unchanged.
    FieldsFailed = 3,
    /// An endpoint never answered within the startup retry budget.
    Unreachable = 4,
}

impl ReturnCode {
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            2 => Some(Self::ConfigInvalid),
            3 => Some(Self::FieldsFailed),
            4 => Some(Self::Unreachable),
            _ => None,
        }
    }

    /// Folds two codes into the one the parent process should exit with:
    /// config errors dominate, then unreachable endpoints, then failures.
    pub fn fold(self, other: Self) -> Self {
        let rank = |code: Self| match code {
            Self::ConfigInvalid => 3,
            Self::Unreachable => 2,
            Self::FieldsFailed => 1,
            Self::Success => 0,
        };
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

/// Creates the tokio runtime for the backup process.
///
/// if num_threads is none, uses the default scheduler
/// otherwise, creates a scheduler with the number of threads
pub fn get_runtime(num_threads: Option<usize>) -> Result<Runtime, std::io::Error> {
    // NOTE: no log macros will work here!
    //
    // That means use eprintln!() instead of error!() and so on. The log
    // emitter requires a running tokio runtime and is initialised after this
    // function.

    use tokio::runtime::Builder;
    let kind = std::io::ErrorKind::Other;
    match num_threads {
        None => Runtime::new(),
        Some(num_threads) => {
            println!(
                "Setting number of threads to '{}' per command line request",
                num_threads
            );

            match num_threads {
                0 => {
                    let msg = format!(
                        "Invalid num-threads: '{}' must be greater than zero",
                        num_threads
                    );
                    Err(std::io::Error::new(kind, msg))
                }
                1 => Builder::new_current_thread().enable_all().build(),
                _ => Builder::new_multi_thread()
                    .enable_all()
                    .worker_threads(num_threads)
                    .build(),
            }
        }
    }
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
pub fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenv::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {}", e);
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_fold_prefers_config_errors() {
        use ReturnCode::*;
        assert_eq!(Success.fold(Success), Success);
        assert_eq!(Success.fold(FieldsFailed), FieldsFailed);
        assert_eq!(FieldsFailed.fold(Unreachable), Unreachable);
        assert_eq!(Unreachable.fold(ConfigInvalid), ConfigInvalid);
        assert_eq!(ConfigInvalid.fold(FieldsFailed), ConfigInvalid);
    }

    #[test]
    fn exit_codes_round_trip() {
        for code in [0, 2, 3, 4] {
            let parsed = ReturnCode::from_exit_code(code).unwrap();
            assert_eq!(parsed as i32, code);
        }
        assert!(ReturnCode::from_exit_code(1).is_none());
    }
}
