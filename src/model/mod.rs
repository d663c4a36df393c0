pub mod cell;
pub mod grid;
pub mod particle;

pub use cell::{Cell, CellSlot, NeighborCell};
pub use grid::{fold_coordinate, CellGrid, NodeGrid, ROUND_ERROR};
pub use particle::{Particle, Pid, TypeId};
