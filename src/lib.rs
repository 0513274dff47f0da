pub mod config;
pub mod logging;
pub mod protocol;
pub mod rover;
pub mod station;

pub use config::{RoverConfig, StationConfig};
pub use station::router::create_router;
pub use station::Station;
pub use rover::RoverSession;
