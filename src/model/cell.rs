use super::particle::Particle;

/// A spatial bucket of particles.
///
/// A cell is purely a spatial index: it owns no particles in the
/// distributed sense. Real-particle membership is recomputed on every
/// resort; ghost membership on every ghost exchange.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    pub particles: Vec<Particle>,
}

/// Compact locator of a particle inside the cell array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellSlot {
    pub cell: usize,
    pub slot: usize,
}

/// Static link from an inner cell to one of its up to 26 neighbors.
///
/// `taken` marks neighbors with a smaller cell index, so pair loops can
/// visit each cell pair once.
#[derive(Debug, Clone, Copy)]
pub struct NeighborCell {
    pub cell: usize,
    pub taken: bool,
}
