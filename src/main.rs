#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if,
    clippy::too_many_arguments
)]
pub(crate) mod admin;
pub(crate) mod attachment;
pub(crate) mod commands;
mod config;
pub(crate) mod db;
pub(crate) mod error;
pub(crate) mod fetcher;
pub(crate) mod ingest;
pub(crate) mod maintenance;
pub(crate) mod message;
pub(crate) mod notifier;
pub(crate) mod policy;
pub(crate) mod rate_limiter;
pub(crate) mod service;
pub(crate) mod smtp_client;
pub(crate) mod storage;
pub(crate) mod templates;
pub(crate) mod tracker;
pub(crate) mod utils;

use commands::Command;
use config::Config;
use env_logger::Env;
use service::Service;
use std::env;
use std::process;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const MODES: [&str; 3] = ["serve", "once", "maintenance"];

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <config_file> <mode> [args...]",
            args.first().unwrap_or(&"mailintake".to_string())
        );
        eprintln!("  mode: serve, once or maintenance, or one of");
        eprintln!("{}", commands::USAGE);
        process::exit(1);
    }

    let Some(config_path) = args.get(1) else {
        unreachable!("args length checked above")
    };
    let Some(mode) = args.get(2) else {
        unreachable!("args length checked above")
    };

    let command = if MODES.contains(&mode.as_str()) {
        None
    } else {
        match Command::parse(mode, args.get(3..).unwrap_or_default()) {
            Ok(command) => Some(command),
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("  mode must be one of {}, or one of", MODES.join(", "));
                eprintln!("{}", commands::USAGE);
                process::exit(1);
            }
        }
    };

    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    let service = match Service::build(&config).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Some(command) = command {
        let result = command.run(&service.admin()).await;
        service.close().await;
        match result {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    match mode.as_str() {
        "once" => match service.run_once().await {
            Ok(report) => log::info!(
                "{} messages, {} uploads, {} attachments rejected, {} denied, {} errors",
                report.messages,
                report.uploads,
                report.rejected_attachments,
                report.denied,
                report.errors
            ),
            Err(e) => {
                eprintln!("Poll cycle failed: {}", e);
                process::exit(1);
            }
        },
        "maintenance" => match service.run_maintenance().await {
            Ok(report) => log::info!(
                "Removed {} rate records, {} rejected uploads, {} files, {} cached domains",
                report.rate_records,
                report.rejected_uploads,
                report.files_removed,
                report.cache_entries
            ),
            Err(e) => {
                eprintln!("Maintenance failed: {}", e);
                process::exit(1);
            }
        },
        _ => {
            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Cannot listen for Ctrl-C: {e}");
                    return;
                }
                log::info!("Shutting down");
                shutdown.cancel();
            });
            service.serve(cancel).await;
        }
    }
}
