//! A pure Rust library for distributed-memory molecular dynamics domain
//! decomposition and bonded-topology bookkeeping. It partitions particles
//! spatially across ranks, migrates them as they move, replicates ghost
//! images across domain boundaries, and keeps a globally consistent
//! bonded-connectivity graph (particles, residues, molecules) under
//! concurrent rank-local bond edits.
//!
//! # Features
//!
//! - **Domain decomposition** — node/cell grid partition of a periodic
//!   box, convergent real-particle migration along the three axes, and
//!   sizes-first ghost exchange with reverse-order force collection
//! - **Fixed tuple lists** — one generic arity-parameterized store for
//!   bonded pairs/triples/quadruples (optionally lambda-weighted), with
//!   idempotent insertion and tuple ownership that migrates atomically
//!   with the canonical particle
//! - **Topology manager** — a bond graph replicated identically on every
//!   rank, residue/molecule partition maintenance with split and merge,
//!   angle/dihedral/1-4 regeneration, and distance-conditioned property
//!   propagation
//! - **Injected transport** — all coordination goes through the
//!   [`Collective`] capability; an in-process channel transport
//!   ([`LocalCollective`]) drives multi-rank tests without a real
//!   communicator
//!
//! # Quick Start
//!
//! ```
//! use domdec::{
//!     DomainDecomposition, FixedPairList, LocalCollective, Particle, SystemConfig,
//!     TopologyManager,
//! };
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let comm: Rc<dyn domdec::Collective> = Rc::new(LocalCollective::single());
//! let config = SystemConfig {
//!     box_l: [10.0, 10.0, 10.0],
//!     node_grid: [1, 1, 1],
//!     cell_grid: [2, 2, 2],
//! };
//! let mut dd = DomainDecomposition::new(&config, Rc::clone(&comm))?;
//!
//! // two bonded particles in one residue
//! for (pid, x) in [(1, 1.0), (2, 2.0)] {
//!     let mut p = Particle::new(pid, [x, 5.0, 5.0]);
//!     p.res_id = 1;
//!     dd.add_particle(p)?;
//! }
//! let bonds = Rc::new(RefCell::new(FixedPairList::new()));
//! bonds.borrow_mut().iadd(&dd, [1, 2])?;
//!
//! let mut topology = TopologyManager::new(Rc::clone(&comm));
//! topology.observe(&bonds);
//! topology.initialize(&dd)?;
//! topology.exchange_data(&mut dd)?;
//!
//! assert!(topology.is_particle_connected(1, 2));
//! assert!(topology.is_same_molecule(1, 2));
//!
//! // a full decomposition round keeps tuple ownership and ghosts fresh
//! dd.decompose(&mut [&mut *bonds.borrow_mut()])?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Module Organization
//!
//! - [`model`] — particles, cells, and the node/cell grid geometry
//! - [`comm`] — the [`Collective`] transport capability, wire buffers,
//!   and the in-process transport
//! - [`storage`] — the domain decomposition engine and migration hooks
//! - [`tuples`] — generic fixed tuple lists and their events
//! - [`topology`] — the replicated graph and the topology manager
//! - [`config`] — TOML-deserializable system configuration
//!
//! # Data Types
//!
//! - [`Particle`] — particle record with position, momentum, force,
//!   bookkeeping ids and the ghost flag
//! - [`NodeGrid`] / [`CellGrid`] — immutable geometric partition
//!   descriptors
//! - [`DomainDecomposition`] — per-rank particle store and exchange
//!   engine
//! - [`FixedPairList`] / [`FixedTripleList`] / [`FixedQuadrupleList`] —
//!   bonded tuple stores (plus lambda-weighted aliases)
//! - [`TopologyManager`] — replicated topology state and per-step
//!   synchronization
//! - [`ParticleUpdate`] — conditional property-override rule
//! - [`Graph`] — arena-backed undirected graph with BFS utilities

pub mod comm;
pub mod config;
pub mod model;
pub mod storage;
pub mod topology;
pub mod tuples;

pub use comm::{Collective, CommError, InBuffer, LocalCollective, OutBuffer, Tag};
pub use config::SystemConfig;
pub use model::{Cell, CellGrid, CellSlot, NodeGrid, Particle, Pid, TypeId};
pub use storage::{DomainDecomposition, MigrationHooks};
pub use topology::{Graph, ParticleUpdate, TopologyManager};
pub use tuples::{
    EventKind, FixedPairLambdaList, FixedPairList, FixedQuadrupleLambdaList, FixedQuadrupleList,
    FixedTripleLambdaList, FixedTripleList, FixedTupleList, TupleEvent,
};

pub use config::Error as ConfigError;
pub use storage::Error as StorageError;
pub use topology::Error as TopologyError;
pub use tuples::Error as TupleError;
