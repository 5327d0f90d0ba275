//! marketflow daemon
//!
//! Loads `.env`, builds the runtime from `MARKETFLOW_*` variables and runs
//! until Ctrl+C.
//!
//! Usage:
//!   cargo run --release --bin marketflow
//!
//! Logging follows `RUST_LOG` (e.g. `RUST_LOG=info`).

use dotenv::dotenv;
use log::{error, info};
use marketflow::connector::ConnectorRegistry;
use marketflow::{CoreConfig, Runtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    info!("🚀 marketflow {}", env!("CARGO_PKG_VERSION"));

    let config = match CoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("   ├─ Bus backend: {:?}", config.bus.backend);
    info!("   ├─ Storage backend: {:?}", config.storage.backend);
    info!("   ├─ Connectors: {}", config.connectors.instances.len());
    if config.streaming.enabled {
        info!("   └─ Streaming: ws://{}", config.streaming.bind_addr);
    } else {
        info!("   └─ Streaming: disabled");
    }

    let registry = ConnectorRegistry::with_builtin()?;
    let mut runtime = Runtime::build(config, registry)?;

    if let Err(e) = runtime.start().await {
        error!("❌ Startup failed: {}", e);
        return Err(e.into());
    }

    info!("✅ Running (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutdown requested");
    runtime.shutdown().await;
    info!("✅ Stopped");

    Ok(())
}
