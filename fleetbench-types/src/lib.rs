//! Types shared between the coordinator and its workers.
//!
//! The coordinator sends a [`StageDefinition`] to every worker and receives exactly one
//! [`Acknowledgement`] per worker in return. Both types are plain serde data so they can cross
//! process boundaries unchanged.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod ack;
mod error;
pub mod stage;

pub use ack::{AckError, AckErrorKind, AckPayload, Acknowledgement, IterationResult};
pub use error::{ConfigError, ConfigResult};
pub use stage::{StageDefinition, StageKind};

/// Zero-based index of a worker within the fleet.
pub type WorkerIndex = usize;
