use sandshark::station::auth::{AllowAnyToken, TokenResolver, Userbase};
use sandshark::station::persist::{FileTelemetryStore, NoopTelemetryStore, TelemetryStore};
use sandshark::{create_router, logging, Station, StationConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let _guard = logging::init("base_station");

    let config = StationConfig::from_env();

    let resolver: Arc<dyn TokenResolver> = if config.require_auth {
        match Userbase::load(&config.userbase_path) {
            Ok(userbase) => Arc::new(userbase),
            Err(e) => {
                tracing::error!(path = %config.userbase_path, error = %e, "Failed to load userbase");
                std::process::exit(1);
            }
        }
    } else {
        warn!("Authentication disabled, accepting any token");
        Arc::new(AllowAnyToken)
    };

    let store: Arc<dyn TelemetryStore> = match &config.data_dir {
        Some(dir) => {
            info!(dir = %dir, "Persisting telemetry");
            Arc::new(FileTelemetryStore::new(dir))
        }
        None => Arc::new(NoopTelemetryStore),
    };

    let bind_addr = config.bind_addr.clone();
    let station = Station::new(config, resolver, store);
    let app = create_router(station);

    info!("starting base station on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
