//! EtherNet/IP driver service binary
//!
//! Loads one device descriptor, connects and polls it on a fixed cadence,
//! printing status and value events. The binary plays the host scheduler:
//! it owns the poll timer and the connect-retry cadence; the driver never
//! retries by itself.
//!
//! This build drives the in-tree simulator backend. A production host
//! embeds [`enipsrv::device::EnipDevice`] with its own transport factory
//! instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enip_link::PlcValue;
use enipsrv::device::EnipDevice;
use enipsrv::sim::{SimBackend, SimFactory};
use enipsrv::DeviceEvent;

#[derive(Parser, Debug)]
#[command(name = "enipsrv", about = "EtherNet/IP device driver service")]
struct Args {
    /// Device descriptor file (YAML or JSON)
    #[arg(short, long, env = "ENIPSRV_CONFIG", default_value = "config/device.yaml")]
    config: PathBuf,

    /// Poll cadence in milliseconds
    #[arg(long, env = "ENIPSRV_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    /// Log filter, e.g. "info" or "enipsrv=debug"
    #[arg(long, env = "ENIPSRV_LOG", default_value = "info")]
    log: String,

    /// Write daily-rotated log files into this directory instead of stderr
    #[arg(long, env = "ENIPSRV_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info"));
    // kept alive for the lifetime of the process so the writer flushes
    let _log_guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "enipsrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        },
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        },
    };

    let config = enipsrv::config::load_from_file(&args.config)
        .with_context(|| format!("loading device config from {}", args.config.display()))?;
    if !config.enabled {
        warn!("device '{}' is disabled, exiting", config.name);
        return Ok(());
    }
    info!(
        "device '{}': {} tags, {} io modules",
        config.name,
        config.tags.len(),
        config.modules.len()
    );

    // Simulator backend; seed something readable for symbolic tags.
    let backend = SimBackend::new();
    for tag in config.tags.values() {
        if matches!(tag.source, enipsrv::TagSource::Symbolic { .. }) {
            backend.set_tag(tag.address.clone(), PlcValue::Integer(0));
        }
    }
    for module in config.modules.values() {
        backend.set_input_image(module.input.instance, vec![0u8; module.input.size as usize]);
    }
    let factory = Arc::new(SimFactory::new(backend));

    let (events, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let device = Arc::new(EnipDevice::new(config, events, factory));

    // Event printer
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                DeviceEvent::Status { id, status } => info!("[{id}] status: {status}"),
                DeviceEvent::Values { id, values } => {
                    info!("[{id}] {} values", values.len());
                    for record in values {
                        info!("  {} = {}", record.id, record.value);
                    }
                },
            }
        }
    });

    // Host-style scheduler loop: poll when connected, reconnect otherwise.
    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_interval_ms.max(100)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if device.is_connected() {
                    if let Err(err) = device.poll().await {
                        warn!("poll failed: {err}");
                    }
                } else if let Err(err) = device.connect().await {
                    warn!("connect failed, retrying on next tick: {err}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    if let Err(err) = device.disconnect().await {
        warn!("disconnect error: {err}");
    }
    Ok(())
}
