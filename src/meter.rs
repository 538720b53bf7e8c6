pub mod capability;
pub mod metrics;
pub mod reading;
pub mod state;
pub mod validator;

pub use capability::*;
pub use metrics::*;
pub use reading::*;
pub use state::*;
pub use validator::*;
