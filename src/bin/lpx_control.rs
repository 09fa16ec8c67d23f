//! lpx_control - train-triggered capture daemon
//!
//! Reads sensor lines from stdin (`in` when a train approaches, `leave` when
//! it has passed) and records one session per train into the storage root.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use lpx::config::LpxConfig;
use lpx::controller::{parse_sensor_line, Controller, SensorEvent};
use lpx::{ingest, Recorder, Store};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding one subdirectory per capture session.
    #[arg(short = 's', long, env = "LPX_STORAGE_ROOT")]
    storage_dir: Option<PathBuf>,
    /// Frame source: `stub://<name>` or a local directory of frames.
    #[arg(short = 'd', long, env = "LPX_SOURCE_URL")]
    device: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = LpxConfig::load()?;
    if let Some(dir) = args.storage_dir {
        config.storage_root = dir;
    }
    if let Some(device) = args.device {
        config.source.url = device;
    }

    std::fs::create_dir_all(&config.storage_root)?;
    let store = Arc::new(Store::open(&config.storage_root)?);
    log::info!(
        "lpx_control: storing sessions under {}, source {}",
        store.root().display(),
        config.source.url
    );

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(SensorEvent::Shutdown);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    std::thread::Builder::new()
        .name("lpx-sensor".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let event = match line {
                    Ok(line) => match parse_sensor_line(&line) {
                        Some(event) => event,
                        None => {
                            log::warn!("lpx_control: unknown sensor input {:?}", line.trim());
                            continue;
                        }
                    },
                    Err(err) => SensorEvent::Fault(format!("sensor read failed: {err}")),
                };
                let last = matches!(event, SensorEvent::Fault(_) | SensorEvent::Shutdown);
                if tx.send(event).is_err() || last {
                    return;
                }
            }
            let _ = tx.send(SensorEvent::Shutdown);
        })?;

    let source_settings = config.source.clone();
    let mut controller = Controller::new(Recorder::new(store), move || {
        ingest::open_source(&source_settings)
    });
    controller.run(rx)?;
    log::info!("lpx_control: stopped");
    Ok(())
}
