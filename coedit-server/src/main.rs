use log::{error, info};

use coedit_collab::{ServerConfig, SessionGateway};

#[tokio::main]
async fn main() {
    env_logger::init();

    info!("Starting coedit server...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    if let Some(ttl) = config.room_idle_ttl {
        info!("Rooms without members are evicted after {}s", ttl.as_secs());
    }

    let gateway = SessionGateway::new(config);

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!("Gateway stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = gateway.stats().await;
            info!(
                "Shutting down: {} connections served, {} rooms in memory",
                stats.total_connections, stats.active_rooms
            );
        }
    }
}
