//! lpx_server - HTTP export service over the session store

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use lpx::api::{ApiConfig, ApiServer};
use lpx::config::LpxConfig;
use lpx::Store;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding one subdirectory per capture session.
    #[arg(short = 's', long, env = "LPX_STORAGE_ROOT")]
    storage_dir: Option<PathBuf>,
    /// Listen address.
    #[arg(long, env = "LPX_API_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = LpxConfig::load()?;
    if let Some(dir) = args.storage_dir {
        config.storage_root = dir;
    }
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let store = Arc::new(Store::open(&config.storage_root)?);
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        export_chunk_bytes: config.export_chunk_bytes,
    };
    let api_handle = ApiServer::new(api_config, store.clone()).spawn()?;
    log::info!(
        "export api listening on {}, serving {}",
        api_handle.addr,
        store.root().display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("lpx_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;
    Ok(())
}
