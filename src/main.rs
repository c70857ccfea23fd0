//! magpie - IRC bot connection core.
//!
//! Connects to the configured network, logs inbound traffic, and keeps the
//! connection alive until interrupted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use magpie::config::Config;
use magpie::dispatch::Dispatch;
use magpie::driver::{SocketDriver, Status};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Minimal dispatch layer: logs every inbound line and queues nothing
/// outbound. A real deployment hangs the command registry off this seam.
struct LogDispatch {
    outbound: VecDeque<String>,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatch for LogDispatch {
    type Msg = String;

    fn take_outbound(&mut self) -> Option<String> {
        self.outbound.pop_front()
    }

    fn feed_inbound(&mut self, msg: String) {
        info!(line = %msg, "inbound");
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    fn encode(&mut self, msg: &String, dst: &mut BytesMut) {
        dst.extend_from_slice(msg.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    fn reset_session(&mut self) {
        self.outbound.clear();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn connection_closed(&mut self) {
        info!("connection closed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "failed to load config");
        e
    })?;
    info!(
        network = %config.network.name,
        servers = config.network.servers.len(),
        "starting magpie"
    );

    let shutting_down = Arc::new(AtomicBool::new(false));
    let dispatch = LogDispatch {
        outbound: VecDeque::new(),
        shutting_down: shutting_down.clone(),
    };
    let mut driver = SocketDriver::new(config.shared(), dispatch)?;

    let interrupt = shutting_down.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.store(true, Ordering::Relaxed);
        }
    });

    driver.connect().await?;
    let mut dying = false;
    while driver.status() != Status::Closed {
        // The interrupt is noticed within one poll interval.
        if shutting_down.load(Ordering::Relaxed) && !dying {
            info!("interrupt received, shutting down");
            driver.die();
            dying = true;
        }
        if driver.fire_due().await? {
            continue;
        }
        driver.tick().await?;
    }

    Ok(())
}
