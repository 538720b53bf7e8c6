pub mod connection_settings;
pub mod meter;
pub mod polling;
pub mod session;

pub use connection_settings::*;
