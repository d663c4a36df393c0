//! Error types for the domain decomposition engine.
//!
//! Configuration problems surface once at construction; protocol and
//! consistency violations indicate that paired ranks disagree on the
//! decomposition state and are unrecoverable.

use crate::comm::CommError;
use crate::model::Pid;
use thiserror::Error;

/// Errors raised by the decomposition engine and migration hooks.
#[derive(Debug, Error)]
pub enum Error {
    /// The node grid does not tile the communicator.
    #[error(
        "specified node grid has {grid_cells} cells but the communicator has {comm_size} ranks"
    )]
    NodeGridMismatch { grid_cells: usize, comm_size: usize },

    /// Paired ranks disagree on the communication cell structure or
    /// payload sizes. This breaks the decomposition invariant and the run
    /// must abort.
    #[error("ghost communication protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    /// A particle was inserted with a position outside this rank's
    /// domain.
    #[error("particle {pid} is not inside this rank's domain")]
    OutOfDomain { pid: Pid },

    /// The topology says a particle must be resolvable on this rank, but
    /// it is absent.
    #[error("particle {pid} does not exist here: {detail}")]
    MissingParticle { pid: Pid, detail: String },

    /// Underlying transport failure.
    #[error(transparent)]
    Comm(#[from] CommError),
}

impl Error {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            detail: detail.into(),
        }
    }

    pub fn missing_particle(pid: Pid, detail: impl Into<String>) -> Self {
        Error::MissingParticle {
            pid,
            detail: detail.into(),
        }
    }
}
