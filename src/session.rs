pub mod client;
pub mod discovery;
pub mod error;
pub mod responses;

pub use client::*;
pub use discovery::*;
pub use error::*;
pub use responses::*;
