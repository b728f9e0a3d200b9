pub mod config;
pub mod errors;
pub mod types;

pub use config::{CaptureConfig, RefreshPolicy, SyncPolicy};
pub use errors::DmacamError;
pub use types::*;
