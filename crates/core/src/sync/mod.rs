//! Sync orchestration: progress model, bulk import engine, and scheduler.

mod adapters;
mod import_engine;
mod progress_model;
mod scheduler;
mod sync_state_model;

pub use adapters::*;
pub use import_engine::*;
pub use progress_model::*;
pub use scheduler::*;
pub use sync_state_model::*;
