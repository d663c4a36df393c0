//! Collective communication capability.
//!
//! All cross-rank coordination in this crate goes through the
//! [`Collective`] trait, injected at construction time so the engine and
//! the topology manager can run against an in-process transport in tests
//! as well as a real multi-process communicator. Every exchange is a
//! blocking send/receive pair or a blocking collective; there are no
//! timeouts — a hang indicates a caller-level protocol bug.

mod buffer;
mod local;

pub use buffer::{InBuffer, OutBuffer};
pub use local::LocalCollective;

use std::fmt;
use thiserror::Error;

/// Message tags distinguishing the crate's wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Particle migration during a resort pass.
    Migration,
    /// Per-cell ghost counts (sizes-first pass).
    GhostSizes,
    /// Ghost particle state.
    GhostData,
    /// Ghost force payloads.
    GhostForces,
    /// Scalar reduction round.
    Reduce,
    /// Variable-length all-gather round.
    Gather,
    /// One-to-all broadcast round.
    Broadcast,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Migration => "migration",
            Tag::GhostSizes => "ghost-sizes",
            Tag::GhostData => "ghost-data",
            Tag::GhostForces => "ghost-forces",
            Tag::Reduce => "reduce",
            Tag::Gather => "gather",
            Tag::Broadcast => "broadcast",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised by transports and wire decoding.
#[derive(Debug, Error)]
pub enum CommError {
    /// A peer endpoint is gone; the run cannot continue.
    #[error("communication with rank {peer} failed: channel disconnected")]
    Disconnected { peer: usize },

    /// A message arrived with an unexpected tag, meaning two ranks
    /// disagree about the protocol step they are in.
    #[error("protocol violation: expected {expected} message from rank {from}, got {got}")]
    TagMismatch { from: usize, expected: Tag, got: Tag },

    /// A wire stream ended before the expected payload was read.
    #[error("truncated wire stream: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// At least one rank reported an error during an aggregated check;
    /// every rank fails together with the combined diagnostic.
    #[error("aggregated failure across ranks: {0}")]
    Aggregated(String),
}

/// Injected communicator capability.
///
/// Implementations must be deadlock-free for the call patterns in this
/// crate: point-to-point sends never block (buffered), receives block
/// until the matching message arrives, and collectives are entered by
/// every rank in the same order.
pub trait Collective {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send(&self, to: usize, tag: Tag, data: &[u8]) -> Result<(), CommError>;
    fn recv(&self, from: usize, tag: Tag) -> Result<Vec<u8>, CommError>;

    /// Sum of one `i64` contribution per rank, identical on every rank.
    fn all_reduce_sum(&self, value: i64) -> Result<i64, CommError>;

    /// Logical OR of one flag per rank, identical on every rank.
    fn all_reduce_or(&self, value: bool) -> Result<bool, CommError>;

    /// Gathers every rank's payload; the result is indexed by rank and
    /// identical on every rank.
    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CommError>;

    /// Broadcasts `data` from `root`; every rank returns the root's bytes.
    fn broadcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, CommError>;
}

/// Communicator-wide error agreement.
///
/// Each rank contributes its local error messages (possibly none). If any
/// rank reported one, every rank returns [`CommError::Aggregated`] with
/// the combined per-rank diagnostic, so a data-dependent failure aborts
/// the whole run consistently instead of leaving ranks in different
/// states.
pub fn check_aggregated(comm: &dyn Collective, errors: &[String]) -> Result<(), CommError> {
    let payload = errors.join("; ");
    let gathered = comm.all_gather(payload.as_bytes())?;
    let mut combined = String::new();
    for (rank, bytes) in gathered.iter().enumerate() {
        if !bytes.is_empty() {
            if !combined.is_empty() {
                combined.push_str("; ");
            }
            combined.push_str(&format!("rank {}: {}", rank, String::from_utf8_lossy(bytes)));
        }
    }
    if combined.is_empty() {
        Ok(())
    } else {
        Err(CommError::Aggregated(combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_check_passes_when_clean() {
        let comm = LocalCollective::single();
        assert!(check_aggregated(&comm, &[]).is_ok());
    }

    #[test]
    fn aggregated_check_reports_local_errors() {
        let comm = LocalCollective::single();
        let errs = vec!["particle 42 missing".to_string()];
        let result = check_aggregated(&comm, &errs);
        match result {
            Err(CommError::Aggregated(msg)) => assert!(msg.contains("particle 42 missing")),
            other => panic!("expected aggregated error, got {:?}", other),
        }
    }
}
