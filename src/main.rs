//! gog_client — command line downloader for a GOG game library.
//!
//! What this binary does:
//! - Logs in with the OAuth authorization-code flow (--login) and keeps
//!   the refresh token under the user config directory.
//! - Lists the owned products in several formats (--list).
//! - Downloads installers, extras, patches and language packs with a
//!   parallel worker pool, resuming partial transfers (--download).
//! - Verifies and repairs files against per-file XML sidecars (--repair,
//!   --check-status).
//! - Installs builds from the content system, chunk by chunk, falling
//!   back to parsing the installer binary as a synthetic repository on
//!   platforms the content system doesn't serve (--galaxy-install).
//! - Synchronizes cloud saves (--cloud-sync and friends).
//!
//! Environment and logs:
//! - Uses env_logger; run with RUST_LOG=debug for transport detail.
//! - Exit code 0 on success, 1 on fatal errors; partial download
//!   failures set bit 0.

mod api;
mod blacklist;
mod catalog;
mod cloud;
mod config;
mod downloader;
mod engine;
mod http;
mod models;
mod orphan;
mod paths;
mod plan;
mod token;
mod utils;
mod verify;
mod zip;

use anyhow::Result;
use clap::Parser;

use config::Config;
use downloader::{parse_product_arg, Downloader};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = config::Args::parse();
    let cfg = Config::from_args(args);

    // No graceful cancellation: partial files and .~incomplete leftovers
    // are picked up by the next run.
    let _ = ctrlc::set_handler(|| {
        eprintln!("\nInterrupted. Partial downloads will be resumed on the next run.");
        std::process::exit(1);
    });

    match run(cfg).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cfg: Config) -> Result<i32> {
    let downloader = Downloader::new(cfg.clone())?;
    let mut exit_code = 0;
    let mut ran_verb = false;

    if cfg.args.login {
        downloader.login().await?;
        return Ok(0);
    }

    if cfg.args.update_cache {
        downloader.ensure_login().await?;
        downloader.update_cache().await?;
        ran_verb = true;
    }

    if cfg.args.update_check {
        downloader.ensure_login().await?;
        downloader.update_check().await?;
        ran_verb = true;
    }

    if cfg.args.list {
        downloader.ensure_login().await?;
        downloader.list().await?;
        ran_verb = true;
    }

    if !cfg.args.download_file.is_empty() {
        downloader.ensure_login().await?;
        exit_code |= downloader.download_file_ids().await?;
        ran_verb = true;
    }

    if cfg.args.repair {
        downloader.ensure_login().await?;
        exit_code |= downloader.repair().await?;
        ran_verb = true;
    } else if cfg.args.download {
        downloader.ensure_login().await?;
        exit_code |= downloader.download().await?;
        ran_verb = true;
    }

    if cfg.args.check_status {
        downloader.ensure_login().await?;
        downloader.check_status().await?;
        ran_verb = true;
    }

    if let Some(orphan_regex) = &cfg.args.check_orphans {
        downloader.ensure_login().await?;
        downloader.check_orphans(orphan_regex).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.galaxy_show_builds {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        downloader.galaxy_show_builds(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.galaxy_install {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        exit_code |= downloader.galaxy_install(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_show {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        downloader.cloud_show(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_show_local {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        downloader.cloud_show_local(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_download {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        exit_code |= downloader.cloud_download(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_upload {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        exit_code |= downloader.cloud_upload(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_sync {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        exit_code |= downloader.cloud_sync(&product, build).await?;
        ran_verb = true;
    }

    if let Some(arg) = &cfg.args.cloud_delete {
        downloader.ensure_login().await?;
        let (product, build) = parse_product_arg(arg);
        exit_code |= downloader.cloud_delete(&product, build).await?;
        ran_verb = true;
    }

    if !ran_verb {
        eprintln!("Nothing to do. See --help for the available commands.");
        return Ok(1);
    }

    Ok(exit_code)
}
