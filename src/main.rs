// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
// Main executable of detd
// we do not want to panic or exit, see explanation in main()
#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::panic_in_result_fn,
        clippy::expect_used,
        clippy::exit,
        clippy::unwrap_used,
        clippy::indexing_slicing,
        clippy::modulo_arithmetic, // % 0 panics - use checked_rem
        clippy::integer_division,  // / 0 panics - use checked_div
        clippy::unreachable,
        clippy::unwrap_in_result,
    )
)]
extern crate detd;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use detd::configuration::ServiceSettings;
use detd::manager::Manager;
use detd::service::Service;
use detd::sysconf::{Effector, ShellCommandRunner};
use detd::sysinfo::NetlinkSystemInfo;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the service socket
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Path of the single-instance lock file
    #[arg(long, value_name = "PATH")]
    lock_file: Option<PathBuf>,

    /// Serve up to this many connections in parallel
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Append log output to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// YAML configuration file; command line options take precedence
    #[arg(value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
/// Main function of `detd`
///
/// # Errors
/// Will return `Err` if any error occurs that can not be handled.
/// Usually this should only happen during initialization, but
/// not when errors occur handling a certain request. In that case,
/// the error is sent back to the requesting client, but the program
/// does not crash to stay responsive and in a consistent state.
/// The exception is an interface left inconsistent by a failed
/// rollback, which is quarantined until the service is restarted.
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_file.as_deref())?;

    let mut settings = match &cli.config {
        Some(path) => ServiceSettings::read(
            File::open(path).with_context(|| format!("Opening {}", path.display()))?,
        )?,
        None => ServiceSettings::default(),
    };

    if let Some(socket) = cli.socket {
        settings.socket_path = socket;
    }
    if let Some(lock_file) = cli.lock_file {
        settings.lock_path = lock_file;
    }
    if let Some(workers) = cli.workers {
        settings.workers = workers;
    }

    let manager = Arc::new(Manager::new(
        Arc::new(NetlinkSystemInfo::new()),
        Effector::new(Arc::new(ShellCommandRunner::new())),
    ));

    let service = Service::bind(manager, &settings)?;
    info!("detd listening on {}", settings.socket_path.display());

    tokio::select! {
        result = service.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

fn init_logging(log_file: Option<&std::path::Path>) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();

    if let Some(path) = log_file {
        let file = File::options()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Opening log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
