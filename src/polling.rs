pub mod engine;
pub mod host;
pub mod watchdog;

pub use engine::*;
pub use host::*;
pub use watchdog::*;
