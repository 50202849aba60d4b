//! Running configurations: one in-process, or a directory of them fanned out
//! as child OS processes so a crash in one cannot take down the others.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{error, info, warn};

use backup_config::BackupConfig;
use backup_core::{orchestrator, Orchestrator, ShutdownFlag};
use influxdb1_client::ClientBuilder;

use crate::ReturnCode;

/// Entry point behind the CLI: a single file runs in this process, a
/// directory becomes one child process per configuration file.
pub async fn run(path: &Path, validate_only: bool, log_verbose_count: u8) -> ReturnCode {
    let files = match backup_config::discover(path) {
        Ok(files) => files,
        Err(error) => {
            eprintln!("{}", error);
            return ReturnCode::ConfigInvalid;
        }
    };

    if path.is_dir() {
        run_children(&files, validate_only, log_verbose_count).await
    } else {
        run_config_file(&files[0], validate_only).await
    }
}

/// Fans out one child process per configuration file and folds their exit
/// codes: config errors dominate, then unreachable endpoints, then failed
/// fields.
async fn run_children(
    files: &[std::path::PathBuf],
    validate_only: bool,
    log_verbose_count: u8,
) -> ReturnCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            eprintln!("cannot determine own executable path: {}", error);
            return ReturnCode::ConfigInvalid;
        }
    };

    let children = files.iter().map(|file| {
        let exe = exe.clone();
        async move {
            let mut command = tokio::process::Command::new(&exe);
            command.arg("--config").arg(file);
            if validate_only {
                command.arg("--validate-only");
            }
            for _ in 0..log_verbose_count {
                command.arg("-v");
            }
            let status = command.status().await;
            (file.clone(), status)
        }
    });

    let mut worst = ReturnCode::Success;
    for (file, status) in join_all(children).await {
        let code = match status {
            Ok(status) if status.success() => ReturnCode::Success,
            Ok(status) => {
                let code = status
                    .code()
                    .and_then(ReturnCode::from_exit_code)
                    .unwrap_or(ReturnCode::FieldsFailed);
                warn!(config = %file.display(), code = code as i32, "configuration failed");
                code
            }
            Err(error) => {
                error!(config = %file.display(), error = %error, "failed to launch child process");
                ReturnCode::FieldsFailed
            }
        };
        worst = worst.fold(code);
    }
    worst
}

/// Runs one configuration in this process.
pub async fn run_config_file(path: &Path, validate_only: bool) -> ReturnCode {
    let config = match BackupConfig::load(path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{}", error);
            return ReturnCode::ConfigInvalid;
        }
    };

    let source = match endpoint_client(
        &config,
        &config.source.url,
        config.source.ssl,
        config.source.verify_ssl,
        &config.source.user,
        &config.source.password,
    ) {
        Ok(client) => client,
        Err(error) => {
            eprintln!("cannot construct source client: {}", error);
            return ReturnCode::ConfigInvalid;
        }
    };
    let destination = match endpoint_client(
        &config,
        &config.destination.url,
        config.destination.ssl,
        config.destination.verify_ssl,
        &config.destination.user,
        &config.destination.password,
    ) {
        Ok(client) => client,
        Err(error) => {
            eprintln!("cannot construct destination client: {}", error);
            return ReturnCode::ConfigInvalid;
        }
    };

    let shutdown = ShutdownFlag::new();
    spawn_signal_listener(shutdown.clone());

    let name = config.name.clone();
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(source),
        Arc::new(destination),
        shutdown,
    );

    if validate_only {
        return validate(&orchestrator, &name).await;
    }

    match orchestrator.run().await {
        Ok(report) => {
            println!("{}", report.to_table());
            if report.has_failures() {
                ReturnCode::FieldsFailed
            } else {
                ReturnCode::Success
            }
        }
        Err(error) => {
            error!(config = %name, error = %error, "backup run failed");
            return_code_for(&error)
        }
    }
}

/// Steps 1–5 only: load, construct, ping, create destination databases,
/// resolve the catalog. Prints the work plan and exits.
async fn validate(orchestrator: &Orchestrator, name: &str) -> ReturnCode {
    if let Err(error) = orchestrator.connect().await {
        error!(config = %name, error = %error, "validation failed");
        return return_code_for(&error);
    }
    let now_ns = backup_config::to_nanos(&Utc::now()).unwrap_or(i64::MAX);
    match orchestrator.plan(now_ns).await {
        Ok(plans) => {
            for plan in &plans {
                println!(
                    "{} -> {}: {} field(s), {} obsolete",
                    plan.source_db,
                    plan.destination_db,
                    plan.catalog.fields.len(),
                    plan.catalog.obsolete.len()
                );
            }
            info!(config = %name, databases = plans.len(), "configuration is valid");
            ReturnCode::Success
        }
        Err(error) => {
            error!(config = %name, error = %error, "validation failed");
            return_code_for(&error)
        }
    }
}

fn return_code_for(error: &orchestrator::Error) -> ReturnCode {
    if error.is_unreachable() {
        ReturnCode::Unreachable
    } else if matches!(error, orchestrator::Error::Config { .. }) {
        ReturnCode::ConfigInvalid
    } else {
        ReturnCode::FieldsFailed
    }
}

fn endpoint_client(
    config: &BackupConfig,
    url: &str,
    ssl: bool,
    verify_ssl: bool,
    user: &str,
    password: &str,
) -> influxdb1_client::Result<influxdb1_client::Client> {
    ClientBuilder::new(url)
        .ssl(ssl)
        .verify_ssl(verify_ssl)
        .credentials(user, password)
        .timeout(config.options.timeout())
        .retries(config.options.retries)
        .retry_delay(config.options.retry_delay())
        .build()
}

fn spawn_signal_listener(shutdown: ShutdownFlag) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining in-flight work");
        shutdown.set();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
