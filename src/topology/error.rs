//! Error types for the topology manager.
//!
//! Nearly every runtime failure here is a consistency violation: the
//! synchronization protocol depends on every rank holding byte-identical
//! replicated state, so a detected divergence aborts the run instead of
//! attempting a local repair.

use crate::comm::CommError;
use crate::model::{Pid, TypeId};
use crate::storage::Error as StorageError;
use crate::tuples::Error as TupleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A graph edge references a particle without a residue assignment.
    #[error("residue id for particle {pid} not found")]
    MissingResidue { pid: Pid },

    /// A particle appeared twice in the gathered residue assignments.
    #[error("residue id for particle {pid} already set")]
    ResidAlreadySet { pid: Pid },

    /// Residue id 0 is reserved as "unassigned".
    #[error("particle {pid} has residue id 0")]
    ResidZero { pid: Pid },

    #[error("molecule id for particle {pid} not found")]
    MissingMolecule { pid: Pid },

    /// An edge connects particles of two different molecules, which
    /// cannot happen in a consistent graph.
    #[error(
        "edge {pid1}-{pid2} connects two different molecules ({mid1} and {mid2})"
    )]
    MoleculeMismatch {
        pid1: Pid,
        pid2: Pid,
        mid1: Pid,
        mid2: Pid,
    },

    #[error("tried to remove edge {pid1}-{pid2} which does not exist")]
    UnknownEdge { pid1: Pid, pid2: Pid },

    #[error("graph node {pid} not found")]
    UnknownNode { pid: Pid },

    #[error("residue edge {rid1}-{rid2} not found in the residue graph")]
    UnknownResidueEdge { rid1: Pid, rid2: Pid },

    #[error("residue {rid} has no member set")]
    MissingResidueSet { rid: Pid },

    #[error("molecule {mid} has no member set")]
    MissingMoleculeSet { mid: Pid },

    /// A bond must be removable through a registered pair list.
    #[error(
        "no pair list registered for bond {pid1}-{pid2} of types {type1}-{type2}"
    )]
    MissingTupleRegistration {
        pid1: Pid,
        pid2: Pid,
        type1: TypeId,
        type2: TypeId,
    },

    /// Two ranks reported different distances for the same
    /// (root, particle) update request.
    #[error(
        "conflicting neighbor distances for root {root} and particle {pid}: {existing} vs {incoming}"
    )]
    MergeAmbiguity {
        root: Pid,
        pid: Pid,
        existing: i64,
        incoming: i64,
    },

    /// More than one registered rule is applicable to one particle at one
    /// distance.
    #[error("multiple property updates match particle {pid} at distance {distance}")]
    AmbiguousPropertyUpdate { pid: Pid, distance: i64 },

    /// Rules are registered for this particle's type at this distance but
    /// none is applicable to its current state.
    #[error("no applicable property update for particle {pid} at distance {distance}")]
    NoApplicableRule { pid: Pid, distance: i64 },

    #[error("local property change for type {type_id} already defined differently")]
    DuplicateLocalRule { type_id: TypeId },

    /// The replicated graph diverged between ranks.
    #[error("graphs not synchronized: local edge count {local}, root edge count {root}")]
    Desynchronized { local: i64, root: i64 },

    #[error("topology initialization received {received} particles, expected {expected}")]
    InitializationMismatch { received: i64, expected: i64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tuples(#[from] TupleError),

    #[error(transparent)]
    Comm(#[from] CommError),
}
