use sandshark::logging;
use sandshark::rover::camera::CameraController;
use sandshark::rover::serial_bridge::SerialBridge;
use sandshark::rover::{gps, stats, RoverSession, Upstream};
use sandshark::RoverConfig;
use tracing::info;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let _guard = logging::init("rover_control");

    let config = match RoverConfig::from_env() {
        Ok(config) => config,
        Err(_) => {
            tracing::error!("ROVER_TOKEN must be set");
            std::process::exit(1);
        }
    };

    let (upstream, outbound) = Upstream::channel();
    let bridge = SerialBridge::new(
        upstream.clone(),
        config.serial_port.clone(),
        config.serial_baud,
    );
    let camera = CameraController::new(config.camera_streamer.clone());

    tokio::spawn(bridge.clone().run());
    tokio::spawn(bridge.clone().run_heartbeat());
    tokio::spawn(gps::run(config.clone(), upstream.clone()));
    tokio::spawn(stats::run(upstream.clone()));

    let session = RoverSession::new(config, bridge, camera, upstream, outbound);

    info!("starting rover control");
    tokio::select! {
        _ = session.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
