pub mod error;
pub mod proto;
pub mod signal;
pub mod telemetry;

pub use error::{Error, Kind};
