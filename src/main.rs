//! Argus camera broker daemon
//!
//! Opens every configured virtual camera through the broker, drains the frames
//! each client receives and logs a state dump until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(feature = "v4l2"))]
use argus::hardware::VirtualCameraProvider;
#[cfg(not(feature = "v4l2"))]
use argus::VirtualCameraConfig;
use argus::{Broker, ChannelSink, ClientSession, Config, DumpTarget, SinkMessage};
use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DUMP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Argus launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    let broker = build_broker(config)?;

    let mut clients = Vec::new();
    for camera in broker.camera_list()? {
        match open_and_drain(&broker, &camera.id) {
            Ok(client) => clients.push(client),
            Err(e) => error!("{}: {}", camera.id, e),
        }
    }
    info!(
        "Serving {} clients on {} devices",
        clients.len(),
        broker.active_devices().len()
    );

    let mut ticker = tokio::time::interval(DUMP_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for line in broker.dump(DumpTarget::All).lines() {
                    info!("{}", line);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    info!("Argus shutting down");
    for client in &clients {
        broker.close_client(client)?;
    }
    broker.shutdown();
    Ok(())
}

#[cfg(feature = "v4l2")]
fn build_broker(config: Config) -> argus::Result<Broker> {
    let provider = argus::hardware::V4l2Provider::new(Default::default());
    Broker::builder(provider).config(config).build()
}

#[cfg(not(feature = "v4l2"))]
fn build_broker(mut config: Config) -> argus::Result<Broker> {
    if config.hardware.cameras.is_empty() {
        warn!("No cameras configured, using one default virtual camera");
        config.hardware.cameras.push(VirtualCameraConfig {
            id: "virtual0".into(),
            stream: Default::default(),
        });
    }
    let provider = VirtualCameraProvider::new(&config.hardware);
    Broker::builder(provider).config(config).build()
}

/// Open a client on `id` and return every frame it receives right away
fn open_and_drain(broker: &Broker, id: &str) -> argus::Result<Arc<ClientSession>> {
    let client = broker.open_client(id)?;
    let (sink, rx) = ChannelSink::new();
    client.start_stream(Arc::new(sink))?;

    let weak = Arc::downgrade(&client);
    let label = id.to_string();
    tokio::spawn(async move {
        while let Ok(message) = rx.recv_async().await {
            match message {
                SinkMessage::Frames(frames) => {
                    let Some(client) = weak.upgrade() else { break };
                    if let Err(e) = client.done_with_frames(&frames) {
                        debug!("{}: {}", label, e);
                    }
                }
                SinkMessage::Event(event) => debug!("{}: {:?}", label, event),
            }
        }
        debug!("{}: frame drain finished", label);
    });
    Ok(client)
}
