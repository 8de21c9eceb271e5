pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod message;

pub use error::{ConcordError, EventBusError, Result};
