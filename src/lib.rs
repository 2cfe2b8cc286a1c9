pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod health;
pub mod history;
pub mod scheduler;
pub mod shutdown;
pub mod snapshot;
pub mod standings;
pub mod storage;

pub use controller::{AutomationController, AutomationState};
pub use error::{EngineError, Result};
