pub mod config;
pub mod error;
pub mod event_bus;
pub mod session;
pub mod types;

pub use config::WayfinderConfig;
pub use error::{FlowError, FlowResult};
