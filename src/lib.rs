//! Bulk photo-export migration with Live Photo reconstruction and
//! memory-aware batch import.

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod library;
pub mod logging;
pub mod media;
pub mod memory;
pub mod pairing;
pub mod pipeline;
pub mod reconstruct;

pub use error::{PipelineError, Result};
