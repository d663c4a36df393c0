//! Domain decomposition engine.
//!
//! Each rank owns one sub-box of the periodic simulation box, stores its
//! real particles in an inner cell grid surrounded by a one-cell ghost
//! frame, and keeps the decomposition consistent through three neighbor
//! exchange protocols:
//!
//! - **Resort** ([`DomainDecomposition::resort_real_particles`]) migrates
//!   real particles whose coordinates left this rank's slab, one axis at
//!   a time, until every rank reports a clean pass.
//! - **Ghost exchange** ([`DomainDecomposition::exchange_ghosts`] /
//!   [`DomainDecomposition::update_ghosts`]) replicates boundary
//!   particles into neighbor ghost frames, shifted by the periodic image
//!   offset.
//! - **Force collection** ([`DomainDecomposition::collect_ghost_forces`])
//!   reduces forces accumulated on ghost copies back onto the owning
//!   real particles, running the axes in reverse so corner contributions
//!   funnel home exactly once.
//!
//! Bonded-tuple bookkeeping rides along through [`MigrationHooks`]: the
//! hooks serialize tuple ownership into the same migration messages as
//! the particles themselves, so a tuple record moves atomically with its
//! canonical particle.

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error, info, trace};

use crate::comm::{Collective, CommError, InBuffer, OutBuffer, Tag};
use crate::config::SystemConfig;
use crate::model::{
    fold_coordinate, Cell, CellGrid, CellSlot, NeighborCell, NodeGrid, Particle, Pid, ROUND_ERROR,
};

/// Observer of particle migration, implemented by the fixed tuple lists.
///
/// `before_send` and `after_recv` run inside the migration protocol and
/// must read/write the wire buffer in the same order on every rank;
/// `on_particles_changed` runs after any resort or ghost exchange to
/// re-resolve cached particle locations.
pub trait MigrationHooks {
    fn before_send(&mut self, departing: &[Particle], buf: &mut OutBuffer);
    fn after_recv(&mut self, arrived: &[Particle], buf: &mut InBuffer) -> Result<(), CommError>;
    fn on_particles_changed(&mut self, store: &DomainDecomposition) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GhostPass {
    Exchange,
    Update,
    Forces,
}

#[derive(Debug, Default, Clone)]
struct CommCellLists {
    reals: Vec<usize>,
    ghosts: Vec<usize>,
}

/// Per-rank particle store and decomposition engine.
pub struct DomainDecomposition {
    comm: Rc<dyn Collective>,
    node_grid: NodeGrid,
    cell_grid: CellGrid,
    cells: Vec<Cell>,
    real_cells: Vec<usize>,
    ghost_cells: Vec<usize>,
    neighbor_cells: Vec<Vec<NeighborCell>>,
    comm_cells: Vec<CommCellLists>,
    real_index: HashMap<Pid, CellSlot>,
    ghost_index: HashMap<Pid, CellSlot>,
}

impl DomainDecomposition {
    pub fn new(config: &SystemConfig, comm: Rc<dyn Collective>) -> Result<Self, Error> {
        let node_grid = NodeGrid::new(config.node_grid, comm.rank(), config.box_l);
        if node_grid.cell_count() != comm.size() {
            return Err(Error::NodeGridMismatch {
                grid_cells: node_grid.cell_count(),
                comm_size: comm.size(),
            });
        }

        let my_left = [
            node_grid.my_left(0),
            node_grid.my_left(1),
            node_grid.my_left(2),
        ];
        let my_right = [
            node_grid.my_right(0),
            node_grid.my_right(1),
            node_grid.my_right(2),
        ];
        let cell_grid = CellGrid::new(config.cell_grid, my_left, my_right);

        info!(
            "node grid = {}x{}x{}, cell grid = {}x{}x{}, local box {:?} - {:?}",
            config.node_grid[0],
            config.node_grid[1],
            config.node_grid[2],
            config.cell_grid[0],
            config.cell_grid[1],
            config.cell_grid[2],
            my_left,
            my_right
        );

        let mut dd = Self {
            comm,
            node_grid,
            cells: vec![Cell::default(); cell_grid.frame_cell_count()],
            real_cells: Vec::with_capacity(cell_grid.inner_cell_count()),
            ghost_cells: Vec::new(),
            neighbor_cells: vec![Vec::new(); cell_grid.frame_cell_count()],
            comm_cells: vec![CommCellLists::default(); 6],
            real_index: HashMap::new(),
            ghost_index: HashMap::new(),
            cell_grid,
        };
        dd.mark_cells();
        dd.init_cell_neighbors();
        dd.prepare_ghost_communication()?;

        debug!(
            "total cells = {}, real cells = {}, ghost cells = {}",
            dd.cells.len(),
            dd.real_cells.len(),
            dd.ghost_cells.len()
        );
        Ok(dd)
    }

    fn mark_cells(&mut self) {
        self.real_cells.clear();
        self.ghost_cells.clear();
        for o in 0..self.cell_grid.frame_size(2) {
            for n in 0..self.cell_grid.frame_size(1) {
                for m in 0..self.cell_grid.frame_size(0) {
                    let idx = self.cell_grid.index(m, n, o);
                    if self.cell_grid.is_inner(m, n, o) {
                        self.real_cells.push(idx);
                    } else {
                        self.ghost_cells.push(idx);
                    }
                }
            }
        }
    }

    fn init_cell_neighbors(&mut self) {
        for o in self.cell_grid.inner_begin(2)..self.cell_grid.inner_end(2) {
            for n in self.cell_grid.inner_begin(1)..self.cell_grid.inner_end(1) {
                for m in self.cell_grid.inner_begin(0)..self.cell_grid.inner_end(0) {
                    let idx = self.cell_grid.index(m, n, o);
                    let mut neighbors = Vec::with_capacity(26);
                    for p in o - 1..=o + 1 {
                        for q in n - 1..=n + 1 {
                            for r in m - 1..=m + 1 {
                                if p == o && q == n && r == m {
                                    continue;
                                }
                                let other = self.cell_grid.index(r, q, p);
                                neighbors.push(NeighborCell {
                                    cell: other,
                                    taken: other < idx,
                                });
                            }
                        }
                    }
                    self.neighbor_cells[idx] = neighbors;
                }
            }
        }
    }

    fn fill_cells(&self, left: [usize; 3], right: [usize; 3]) -> Result<Vec<usize>, Error> {
        let mut total = 1usize;
        for i in 0..3 {
            if left[i] > self.cell_grid.frame_size(i)
                || right[i] > self.cell_grid.frame_size(i)
                || left[i] >= right[i]
            {
                return Err(Error::protocol(format!(
                    "wrong communication cell range specified internally: {:?}-{:?}",
                    left, right
                )));
            }
            total *= right[i] - left[i];
        }
        let mut cells = Vec::with_capacity(total);
        for a in left[0]..right[0] {
            for b in left[1]..right[1] {
                for c in left[2]..right[2] {
                    cells.push(self.cell_grid.index(a, b, c));
                }
            }
        }
        Ok(cells)
    }

    fn prepare_ghost_communication(&mut self) -> Result<(), Error> {
        let width = self.cell_grid.frame_width();
        for coord in 0..3 {
            let mut left = [0usize; 3];
            let mut right = [0usize; 3];
            // Perpendicular extents: axes already processed contribute
            // their full ghost frame, later axes only the inner slab, so
            // corner data funnels hop by hop.
            for offset in 1..=2 {
                let other = (coord + offset) % 3;
                if other < coord {
                    left[other] = 0;
                    right[other] = self.cell_grid.frame_size(other);
                } else {
                    left[other] = self.cell_grid.inner_begin(other);
                    right[other] = self.cell_grid.inner_end(other);
                }
            }
            for lr in 0..2 {
                let dir = 2 * coord + lr;

                if lr == 0 {
                    left[coord] = self.cell_grid.inner_begin(coord);
                    right[coord] = self.cell_grid.inner_begin(coord) + width;
                } else {
                    left[coord] = self.cell_grid.inner_end(coord) - width;
                    right[coord] = self.cell_grid.inner_end(coord);
                }
                self.comm_cells[dir].reals = self.fill_cells(left, right)?;

                if lr == 0 {
                    left[coord] = self.cell_grid.inner_end(coord);
                    right[coord] = self.cell_grid.inner_end(coord) + width;
                } else {
                    left[coord] = self.cell_grid.inner_begin(coord) - width;
                    right[coord] = self.cell_grid.inner_begin(coord);
                }
                self.comm_cells[dir].ghosts = self.fill_cells(left, right)?;
            }
        }
        Ok(())
    }

    // ---- particle store ----

    /// Inserts a real particle, which must lie inside this rank's domain
    /// after folding into the periodic box.
    pub fn add_particle(&mut self, mut particle: Particle) -> Result<(), Error> {
        for axis in 0..3 {
            fold_coordinate(
                &mut particle.position,
                &mut particle.image,
                axis,
                self.node_grid.box_l(axis),
            );
        }
        let cell = self
            .cell_grid
            .map_position_checked(particle.position)
            .ok_or(Error::OutOfDomain { pid: particle.id })?;
        particle.ghost = false;
        self.append_indexed(cell, particle);
        Ok(())
    }

    pub fn lookup_real(&self, pid: Pid) -> Option<&Particle> {
        self.real_index.get(&pid).map(|slot| self.particle(*slot))
    }

    pub fn lookup_real_mut(&mut self, pid: Pid) -> Option<&mut Particle> {
        let slot = *self.real_index.get(&pid)?;
        Some(self.particle_mut(slot))
    }

    /// Resolves a pid to any local copy, preferring the real particle
    /// over ghost images.
    pub fn lookup_local(&self, pid: Pid) -> Option<&Particle> {
        self.lookup_real(pid)
            .or_else(|| self.ghost_index.get(&pid).map(|slot| self.particle(*slot)))
    }

    pub fn lookup_local_mut(&mut self, pid: Pid) -> Option<&mut Particle> {
        let slot = *self
            .real_index
            .get(&pid)
            .or_else(|| self.ghost_index.get(&pid))?;
        Some(self.particle_mut(slot))
    }

    /// Slot of any local copy, preferring the real particle.
    pub fn lookup_local_slot(&self, pid: Pid) -> Option<CellSlot> {
        self.real_index
            .get(&pid)
            .or_else(|| self.ghost_index.get(&pid))
            .copied()
    }

    pub fn lookup_real_slot(&self, pid: Pid) -> Option<CellSlot> {
        self.real_index.get(&pid).copied()
    }

    #[inline]
    pub fn particle(&self, slot: CellSlot) -> &Particle {
        &self.cells[slot.cell].particles[slot.slot]
    }

    #[inline]
    pub fn particle_mut(&mut self, slot: CellSlot) -> &mut Particle {
        &mut self.cells[slot.cell].particles[slot.slot]
    }

    pub fn real_particle_count(&self) -> usize {
        self.real_index.len()
    }

    /// Iterates this rank's real particles.
    pub fn real_particles(&self) -> impl Iterator<Item = &Particle> {
        self.real_cells
            .iter()
            .flat_map(move |&idx| self.cells[idx].particles.iter())
    }

    /// Applies `f` to every real particle on this rank.
    pub fn for_each_real_mut(&mut self, mut f: impl FnMut(&mut Particle)) {
        for i in 0..self.real_cells.len() {
            let idx = self.real_cells[i];
            for p in &mut self.cells[idx].particles {
                f(p);
            }
        }
    }

    pub fn ghost_particles(&self) -> impl Iterator<Item = &Particle> {
        self.ghost_cells
            .iter()
            .flat_map(move |&idx| self.cells[idx].particles.iter())
    }

    pub fn cell_particles(&self, cell: usize) -> &[Particle] {
        &self.cells[cell].particles
    }

    /// Static 26-neighborhood of an inner cell.
    pub fn cell_neighbors(&self, cell: usize) -> &[NeighborCell] {
        &self.neighbor_cells[cell]
    }

    pub fn real_cells(&self) -> &[usize] {
        &self.real_cells
    }

    pub fn node_grid(&self) -> &NodeGrid {
        &self.node_grid
    }

    pub fn cell_grid(&self) -> &CellGrid {
        &self.cell_grid
    }

    pub fn comm(&self) -> &Rc<dyn Collective> {
        &self.comm
    }

    fn append_indexed(&mut self, cell: usize, particle: Particle) {
        let slot = CellSlot {
            cell,
            slot: self.cells[cell].particles.len(),
        };
        if particle.ghost {
            // the first ghost image wins; lookups prefer reals anyway
            self.ghost_index.entry(particle.id).or_insert(slot);
        } else {
            self.real_index.insert(particle.id, slot);
        }
        self.cells[cell].particles.push(particle);
    }

    /// Removes the particle at `slot`, patching the index entry of the
    /// element swapped into its place.
    fn take_indexed(&mut self, slot: CellSlot) -> Particle {
        let particle = self.cells[slot.cell].particles.swap_remove(slot.slot);
        if particle.ghost {
            self.ghost_index.remove(&particle.id);
        } else {
            self.real_index.remove(&particle.id);
        }
        if slot.slot < self.cells[slot.cell].particles.len() {
            let moved = &self.cells[slot.cell].particles[slot.slot];
            let moved_id = moved.id;
            let index = if moved.ghost {
                &mut self.ghost_index
            } else {
                &mut self.real_index
            };
            if let Some(entry) = index.get_mut(&moved_id) {
                if entry.cell == slot.cell {
                    *entry = slot;
                }
            }
        }
        particle
    }

    fn move_indexed(&mut self, from: CellSlot, to_cell: usize) {
        let particle = self.take_indexed(from);
        self.append_indexed(to_cell, particle);
    }

    // ---- resort ----

    /// Drops all ghost images; real particles are untouched.
    pub fn invalidate_ghosts(&mut self) {
        for &idx in &self.ghost_cells {
            self.cells[idx].particles.clear();
        }
        self.ghost_index.clear();
    }

    /// Migrates real particles to the ranks owning their current
    /// (folded) positions and sorts them into their true cells.
    ///
    /// After convergence every real particle sits in exactly one cell on
    /// exactly one rank; particles are never duplicated or lost. A NaN
    /// coordinate is logged as an error and the particle stays where it
    /// is instead of being retried forever.
    pub fn resort_real_particles(
        &mut self,
        hooks: &mut [&mut dyn MigrationHooks],
    ) -> Result<(), Error> {
        debug!("starting real-particle resort");
        self.invalidate_ghosts();

        loop {
            let mut finished: i64 = 1;

            for coord in 0..3 {
                if self.node_grid.size(coord) > 1 {
                    let mut send_left: Vec<Particle> = Vec::new();
                    let mut send_right: Vec<Particle> = Vec::new();

                    let my_left = self.cell_grid.my_left(coord);
                    let my_right = self.cell_grid.my_right(coord);

                    for ci in 0..self.real_cells.len() {
                        let cell_idx = self.real_cells[ci];
                        let mut p = 0;
                        while p < self.cells[cell_idx].particles.len() {
                            let coordinate = self.cells[cell_idx].particles[p].position[coord];
                            let slot = CellSlot {
                                cell: cell_idx,
                                slot: p,
                            };
                            if coordinate - my_left < -ROUND_ERROR {
                                trace!(
                                    "sending particle {} left along axis {}",
                                    self.cells[cell_idx].particles[p].id,
                                    coord
                                );
                                send_left.push(self.take_indexed(slot));
                            } else if coordinate - my_right >= ROUND_ERROR {
                                trace!(
                                    "sending particle {} right along axis {}",
                                    self.cells[cell_idx].particles[p].id,
                                    coord
                                );
                                send_right.push(self.take_indexed(slot));
                            } else if coord == 2 {
                                if !self.sort_into_final_cell(cell_idx, p, &mut finished) {
                                    p += 1;
                                }
                            } else {
                                p += 1;
                            }
                        }
                    }

                    let left = self.node_grid.neighbor(2 * coord);
                    let right = self.node_grid.neighbor(2 * coord + 1);
                    let recv_left;
                    let recv_right;
                    if self.node_grid.position(coord) % 2 == 0 {
                        self.send_particles(send_left, left, hooks)?;
                        recv_right = self.recv_particles(right, hooks)?;
                        self.send_particles(send_right, right, hooks)?;
                        recv_left = self.recv_particles(left, hooks)?;
                    } else {
                        recv_right = self.recv_particles(right, hooks)?;
                        self.send_particles(send_left, left, hooks)?;
                        recv_left = self.recv_particles(left, hooks)?;
                        self.send_particles(send_right, right, hooks)?;
                    }

                    if self.append_received(recv_left, 2 * coord) && coord == 2 {
                        finished = 0;
                    }
                    if self.append_received(recv_right, 2 * coord + 1) && coord == 2 {
                        finished = 0;
                    }
                } else {
                    // single rank along this axis: fold instead of sending
                    let box_len = self.node_grid.box_l(coord);
                    for ci in 0..self.real_cells.len() {
                        let cell_idx = self.real_cells[ci];
                        let mut p = 0;
                        while p < self.cells[cell_idx].particles.len() {
                            {
                                let part = &mut self.cells[cell_idx].particles[p];
                                fold_coordinate(&mut part.position, &mut part.image, coord, box_len);
                            }
                            if coord == 2 {
                                if !self.sort_into_final_cell(cell_idx, p, &mut finished) {
                                    p += 1;
                                }
                            } else {
                                p += 1;
                            }
                        }
                    }
                }
            }

            let done = self.comm.all_reduce_sum(finished)?;
            if done == self.comm.size() as i64 {
                break;
            }
            debug!("resort not yet globally converged, taking another round");
        }

        debug!("finished exchanging particles");
        Ok(())
    }

    /// Returns `true` if the particle at (`cell_idx`, `p`) was moved to a
    /// different cell (so the caller must re-examine slot `p`).
    fn sort_into_final_cell(&mut self, cell_idx: usize, p: usize, finished: &mut i64) -> bool {
        let position = self.cells[cell_idx].particles[p].position;
        let pid = self.cells[cell_idx].particles[p].id;
        match self.cell_grid.map_position_checked(position) {
            Some(target) if target != cell_idx => {
                self.move_indexed(
                    CellSlot {
                        cell: cell_idx,
                        slot: p,
                    },
                    target,
                );
                true
            }
            Some(_) => false,
            None => {
                if position.iter().any(|x| x.is_nan()) {
                    error!(
                        "particle {} has moved to outer space (one or more coordinates are NaN)",
                        pid
                    );
                } else {
                    debug!(
                        "particle {} @ {:?} is not inside the node domain after neighbor \
                         exchange, taking another loop",
                        pid, position
                    );
                    *finished = 0;
                }
                false
            }
        }
    }

    fn send_particles(
        &self,
        list: Vec<Particle>,
        to: usize,
        hooks: &mut [&mut dyn MigrationHooks],
    ) -> Result<(), Error> {
        let mut buf = OutBuffer::new();
        buf.write_i64(list.len() as i64);
        for p in &list {
            pack_migration(&mut buf, p);
        }
        for hook in hooks.iter_mut() {
            hook.before_send(&list, &mut buf);
        }
        self.comm.send(to, Tag::Migration, buf.as_bytes())?;
        Ok(())
    }

    fn recv_particles(
        &self,
        from: usize,
        hooks: &mut [&mut dyn MigrationHooks],
    ) -> Result<Vec<Particle>, Error> {
        let bytes = self.comm.recv(from, Tag::Migration)?;
        let mut buf = InBuffer::new(bytes);
        let n = buf.read_i64()?;
        let mut list = Vec::with_capacity(n.max(0) as usize);
        for _ in 0..n {
            list.push(unpack_migration(&mut buf)?);
        }
        for hook in hooks.iter_mut() {
            hook.after_recv(&list, &mut buf)?;
        }
        Ok(list)
    }

    /// Folds boundary crossings and inserts received particles; returns
    /// whether any landed outside this rank's domain.
    fn append_received(&mut self, list: Vec<Particle>, dir: usize) -> bool {
        let coord = dir / 2;
        let fold = self.node_grid.boundary(dir) != 0;
        let box_len = self.node_grid.box_l(coord);
        let mut outlier = false;
        for mut p in list {
            if fold {
                fold_coordinate(&mut p.position, &mut p.image, coord, box_len);
                trace!("folded coordinate {} of particle {}", coord, p.id);
            }
            let (cell, outside) = self.cell_grid.map_position_checked_and_clipped(p.position);
            outlier |= outside;
            p.ghost = false;
            self.append_indexed(cell, p);
        }
        outlier
    }

    // ---- ghost communication ----

    /// Full ghost (re)creation: sizes-first protocol carrying complete
    /// particle state, marking received copies as ghosts. Any ghosts
    /// from a previous exchange are dropped first.
    pub fn exchange_ghosts(&mut self) -> Result<(), Error> {
        self.invalidate_ghosts();
        self.do_ghost_communication(GhostPass::Exchange)
    }

    /// Refreshes ghost positions and velocities in place.
    pub fn update_ghosts(&mut self) -> Result<(), Error> {
        self.do_ghost_communication(GhostPass::Update)
    }

    /// Reduces ghost force contributions back into the owning real
    /// particles, running the axes in reverse exchange order.
    pub fn collect_ghost_forces(&mut self) -> Result<(), Error> {
        self.do_ghost_communication(GhostPass::Forces)
    }

    /// One full decomposition round: resort, ghost rebuild, and hook
    /// refresh.
    pub fn decompose(&mut self, hooks: &mut [&mut dyn MigrationHooks]) -> Result<(), Error> {
        self.resort_real_particles(hooks)?;
        self.exchange_ghosts()?;
        for hook in hooks.iter_mut() {
            hook.on_particles_changed(self)?;
        }
        Ok(())
    }

    fn do_ghost_communication(&mut self, pass: GhostPass) -> Result<(), Error> {
        debug!("ghost communication pass {:?}", pass);
        for step in 0..3 {
            // Inverted processing order when collecting forces: corner
            // contributions hop back through the same intermediate nodes
            // they were forwarded through.
            let coord = if pass == GhostPass::Forces { 2 - step } else { step };
            for lr in 0..2 {
                let dir = 2 * coord + lr;
                let mut shift = [0.0; 3];
                if pass != GhostPass::Forces {
                    shift[coord] =
                        self.node_grid.boundary(dir) as f64 * self.node_grid.box_l(coord);
                }
                if self.node_grid.size(coord) == 1 {
                    self.ghost_pass_local(dir, shift, pass)?;
                } else {
                    self.ghost_pass_remote(dir, coord, lr, shift, pass)?;
                }
            }
        }
        Ok(())
    }

    fn ghost_pass_local(&mut self, dir: usize, shift: [f64; 3], pass: GhostPass) -> Result<(), Error> {
        let reals = self.comm_cells[dir].reals.clone();
        let ghosts = self.comm_cells[dir].ghosts.clone();
        if reals.len() != ghosts.len() {
            return Err(Error::protocol(format!(
                "send/recv cell structure mismatch during local copy in direction {}",
                dir
            )));
        }
        for (&r, &g) in reals.iter().zip(&ghosts) {
            match pass {
                GhostPass::Exchange => {
                    let copies: Vec<Particle> = self.cells[r]
                        .particles
                        .iter()
                        .map(|p| {
                            let mut ghost = p.clone();
                            for i in 0..3 {
                                ghost.position[i] += shift[i];
                            }
                            ghost.ghost = true;
                            ghost
                        })
                        .collect();
                    self.cells[g].particles.clear();
                    for ghost in copies {
                        self.append_indexed(g, ghost);
                    }
                }
                GhostPass::Update => {
                    if self.cells[r].particles.len() != self.cells[g].particles.len() {
                        return Err(Error::protocol(format!(
                            "ghost cell {} holds {} particles but its paired real cell {} holds {}",
                            g,
                            self.cells[g].particles.len(),
                            r,
                            self.cells[r].particles.len()
                        )));
                    }
                    let state: Vec<([f64; 3], [f64; 3])> = self.cells[r]
                        .particles
                        .iter()
                        .map(|p| (p.position, p.velocity))
                        .collect();
                    for (ghost, (position, velocity)) in
                        self.cells[g].particles.iter_mut().zip(state)
                    {
                        for i in 0..3 {
                            ghost.position[i] = position[i] + shift[i];
                        }
                        ghost.velocity = velocity;
                    }
                }
                GhostPass::Forces => {
                    if self.cells[r].particles.len() != self.cells[g].particles.len() {
                        return Err(Error::protocol(format!(
                            "ghost cell {} holds {} particles but its paired real cell {} holds {}",
                            g,
                            self.cells[g].particles.len(),
                            r,
                            self.cells[r].particles.len()
                        )));
                    }
                    let forces: Vec<[f64; 3]> =
                        self.cells[g].particles.iter().map(|p| p.force).collect();
                    for (real, force) in self.cells[r].particles.iter_mut().zip(forces) {
                        for i in 0..3 {
                            real.force[i] += force[i];
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn ghost_pass_remote(
        &mut self,
        dir: usize,
        coord: usize,
        lr: usize,
        shift: [f64; 3],
        pass: GhostPass,
    ) -> Result<(), Error> {
        let opposite = 2 * coord + (1 - lr);
        let even = self.node_grid.position(coord) % 2 == 0;

        // ghost data flows real -> ghost along `dir`; forces flow back
        let (send_to, recv_from) = if pass == GhostPass::Forces {
            (self.node_grid.neighbor(opposite), self.node_grid.neighbor(dir))
        } else {
            (self.node_grid.neighbor(dir), self.node_grid.neighbor(opposite))
        };

        if pass == GhostPass::Exchange {
            let sizes: Vec<i64> = self.comm_cells[dir]
                .reals
                .iter()
                .map(|&c| self.cells[c].particles.len() as i64)
                .collect();
            let mut out = OutBuffer::new();
            out.write_i64s(&sizes);
            let bytes =
                self.parity_exchange(even, send_to, recv_from, Tag::GhostSizes, out.into_bytes())?;
            let recv_sizes = InBuffer::new(bytes).read_i64s()?;
            if recv_sizes.len() != self.comm_cells[dir].ghosts.len() {
                return Err(Error::protocol(format!(
                    "received {} ghost cell sizes for {} ghost cells in direction {}",
                    recv_sizes.len(),
                    self.comm_cells[dir].ghosts.len(),
                    dir
                )));
            }

            let mut out = OutBuffer::new();
            for &c in &self.comm_cells[dir].reals {
                for p in &self.cells[c].particles {
                    pack_ghost_full(&mut out, p, shift);
                }
            }
            let bytes =
                self.parity_exchange(even, send_to, recv_from, Tag::GhostData, out.into_bytes())?;
            let mut buf = InBuffer::new(bytes);
            let ghosts = self.comm_cells[dir].ghosts.clone();
            for (&g, &n) in ghosts.iter().zip(&recv_sizes) {
                self.cells[g].particles.clear();
                for _ in 0..n {
                    let ghost = unpack_ghost_full(&mut buf)?;
                    self.append_indexed(g, ghost);
                }
            }
        } else if pass == GhostPass::Update {
            let mut out = OutBuffer::new();
            for &c in &self.comm_cells[dir].reals {
                out.write_i64(self.cells[c].particles.len() as i64);
                for p in &self.cells[c].particles {
                    for i in 0..3 {
                        out.write_f64(p.position[i] + shift[i]);
                    }
                    for i in 0..3 {
                        out.write_f64(p.velocity[i]);
                    }
                }
            }
            let bytes =
                self.parity_exchange(even, send_to, recv_from, Tag::GhostData, out.into_bytes())?;
            let mut buf = InBuffer::new(bytes);
            let ghosts = self.comm_cells[dir].ghosts.clone();
            for &g in &ghosts {
                let n = buf.read_i64()? as usize;
                if n != self.cells[g].particles.len() {
                    return Err(Error::protocol(format!(
                        "ghost cell {} holds {} particles but the paired rank sent {}",
                        g,
                        self.cells[g].particles.len(),
                        n
                    )));
                }
                for slot in 0..n {
                    let mut position = [0.0; 3];
                    let mut velocity = [0.0; 3];
                    for i in 0..3 {
                        position[i] = buf.read_f64()?;
                    }
                    for i in 0..3 {
                        velocity[i] = buf.read_f64()?;
                    }
                    let ghost = &mut self.cells[g].particles[slot];
                    ghost.position = position;
                    ghost.velocity = velocity;
                }
            }
        } else {
            let mut out = OutBuffer::new();
            for &c in &self.comm_cells[dir].ghosts {
                out.write_i64(self.cells[c].particles.len() as i64);
                for p in &self.cells[c].particles {
                    for i in 0..3 {
                        out.write_f64(p.force[i]);
                    }
                }
            }
            let bytes =
                self.parity_exchange(even, send_to, recv_from, Tag::GhostForces, out.into_bytes())?;
            let mut buf = InBuffer::new(bytes);
            let reals = self.comm_cells[dir].reals.clone();
            for &r in &reals {
                let n = buf.read_i64()? as usize;
                if n != self.cells[r].particles.len() {
                    return Err(Error::protocol(format!(
                        "real cell {} holds {} particles but the paired rank sent {} forces",
                        r,
                        self.cells[r].particles.len(),
                        n
                    )));
                }
                for slot in 0..n {
                    let mut force = [0.0; 3];
                    for i in 0..3 {
                        force[i] = buf.read_f64()?;
                    }
                    let real = &mut self.cells[r].particles[slot];
                    for i in 0..3 {
                        real.force[i] += force[i];
                    }
                }
            }
        }
        Ok(())
    }

    fn parity_exchange(
        &self,
        even: bool,
        send_to: usize,
        recv_from: usize,
        tag: Tag,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, CommError> {
        if even {
            self.comm.send(send_to, tag, &bytes)?;
            self.comm.recv(recv_from, tag)
        } else {
            let received = self.comm.recv(recv_from, tag)?;
            self.comm.send(send_to, tag, &bytes)?;
            Ok(received)
        }
    }
}

fn pack_migration(buf: &mut OutBuffer, p: &Particle) {
    buf.write_i64(p.id);
    buf.write_i64(p.type_id);
    buf.write_i64(p.state);
    buf.write_i64(p.res_id);
    buf.write_f64(p.mass);
    buf.write_f64(p.q);
    buf.write_f64(p.lambda);
    for i in 0..3 {
        buf.write_f64(p.position[i]);
    }
    for i in 0..3 {
        buf.write_f64(p.velocity[i]);
    }
    for i in 0..3 {
        buf.write_f64(p.force[i]);
    }
    for i in 0..3 {
        buf.write_i64(p.image[i]);
    }
}

fn unpack_migration(buf: &mut InBuffer) -> Result<Particle, CommError> {
    let id = buf.read_i64()?;
    let type_id = buf.read_i64()?;
    let state = buf.read_i64()?;
    let res_id = buf.read_i64()?;
    let mass = buf.read_f64()?;
    let q = buf.read_f64()?;
    let lambda = buf.read_f64()?;
    let mut position = [0.0; 3];
    let mut velocity = [0.0; 3];
    let mut force = [0.0; 3];
    let mut image = [0i64; 3];
    for i in 0..3 {
        position[i] = buf.read_f64()?;
    }
    for i in 0..3 {
        velocity[i] = buf.read_f64()?;
    }
    for i in 0..3 {
        force[i] = buf.read_f64()?;
    }
    for i in 0..3 {
        image[i] = buf.read_i64()?;
    }
    Ok(Particle {
        id,
        type_id,
        mass,
        q,
        lambda,
        state,
        res_id,
        position,
        image,
        velocity,
        force,
        ghost: false,
    })
}

fn pack_ghost_full(buf: &mut OutBuffer, p: &Particle, shift: [f64; 3]) {
    buf.write_i64(p.id);
    buf.write_i64(p.type_id);
    buf.write_i64(p.state);
    buf.write_i64(p.res_id);
    buf.write_f64(p.mass);
    buf.write_f64(p.q);
    buf.write_f64(p.lambda);
    for i in 0..3 {
        buf.write_f64(p.position[i] + shift[i]);
    }
    for i in 0..3 {
        buf.write_f64(p.velocity[i]);
    }
    for i in 0..3 {
        buf.write_i64(p.image[i]);
    }
}

fn unpack_ghost_full(buf: &mut InBuffer) -> Result<Particle, CommError> {
    let id = buf.read_i64()?;
    let type_id = buf.read_i64()?;
    let state = buf.read_i64()?;
    let res_id = buf.read_i64()?;
    let mass = buf.read_f64()?;
    let q = buf.read_f64()?;
    let lambda = buf.read_f64()?;
    let mut position = [0.0; 3];
    let mut velocity = [0.0; 3];
    let mut image = [0i64; 3];
    for i in 0..3 {
        position[i] = buf.read_f64()?;
    }
    for i in 0..3 {
        velocity[i] = buf.read_f64()?;
    }
    for i in 0..3 {
        image[i] = buf.read_i64()?;
    }
    Ok(Particle {
        id,
        type_id,
        mass,
        q,
        lambda,
        state,
        res_id,
        position,
        image,
        velocity,
        force: [0.0; 3],
        ghost: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCollective;

    fn single_rank_store(cell_grid: [usize; 3]) -> DomainDecomposition {
        let config = SystemConfig {
            box_l: [4.0, 4.0, 4.0],
            node_grid: [1, 1, 1],
            cell_grid,
        };
        DomainDecomposition::new(&config, Rc::new(LocalCollective::single())).unwrap()
    }

    #[test]
    fn construction_marks_cells() {
        let dd = single_rank_store([2, 2, 2]);
        assert_eq!(dd.real_cells().len(), 8);
        assert_eq!(dd.cells.len(), 64);
        assert_eq!(dd.ghost_cells.len(), 56);
        for &cell in dd.real_cells() {
            assert_eq!(dd.cell_neighbors(cell).len(), 26);
        }
    }

    #[test]
    fn node_grid_mismatch_is_fatal() {
        let config = SystemConfig {
            box_l: [4.0, 4.0, 4.0],
            node_grid: [2, 1, 1],
            cell_grid: [2, 2, 2],
        };
        let result = DomainDecomposition::new(&config, Rc::new(LocalCollective::single()));
        assert!(matches!(result, Err(Error::NodeGridMismatch { .. })));
    }

    #[test]
    fn add_and_lookup_particles() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.add_particle(Particle::new(2, [3.5, 3.5, 3.5])).unwrap();
        assert_eq!(dd.real_particle_count(), 2);
        assert_eq!(dd.lookup_real(1).unwrap().position, [0.5, 0.5, 0.5]);
        assert!(dd.lookup_real(3).is_none());
        assert!(dd.lookup_local(2).is_some());
    }

    #[test]
    fn add_folds_into_the_box() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [4.5, -0.5, 1.0])).unwrap();
        let p = dd.lookup_real(1).unwrap();
        assert!((p.position[0] - 0.5).abs() < 1e-12);
        assert!((p.position[1] - 3.5).abs() < 1e-12);
        assert_eq!(p.image, [1, -1, 0]);
    }

    #[test]
    fn resort_moves_particles_to_their_cells() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        // displace across the cell boundary and past the box edge
        dd.lookup_real_mut(1).unwrap().position = [2.5, 0.5, 4.5];
        dd.resort_real_particles(&mut []).unwrap();
        let p = dd.lookup_real(1).unwrap();
        assert!((p.position[2] - 0.5).abs() < 1e-12);
        let expected = dd.cell_grid.map_position_checked(p.position).unwrap();
        let slot = dd.lookup_real_slot(1).unwrap();
        assert_eq!(slot.cell, expected);
        assert_eq!(dd.real_particle_count(), 1);
    }

    #[test]
    fn nan_positions_are_kept_not_lost() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.lookup_real_mut(1).unwrap().position = [f64::NAN, 0.5, 0.5];
        dd.resort_real_particles(&mut []).unwrap();
        assert_eq!(dd.real_particle_count(), 1);
    }

    #[test]
    fn corner_particle_gets_seven_periodic_images() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.exchange_ghosts().unwrap();
        let images: Vec<&Particle> = dd.ghost_particles().filter(|p| p.id == 1).collect();
        assert_eq!(images.len(), 7);
        for ghost in &images {
            assert!(ghost.ghost);
            for i in 0..3 {
                let delta = ghost.position[i] - 0.5;
                assert!(delta.abs() < 1e-12 || (delta - 4.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn update_ghosts_propagates_positions() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.exchange_ghosts().unwrap();
        {
            let p = dd.lookup_real_mut(1).unwrap();
            p.position = [0.6, 0.5, 0.5];
            p.velocity = [1.0, 0.0, 0.0];
        }
        dd.update_ghosts().unwrap();
        for ghost in dd.ghost_particles().filter(|p| p.id == 1) {
            let delta = ghost.position[0] - 0.6;
            assert!(delta.abs() < 1e-12 || (delta - 4.0).abs() < 1e-12);
            assert_eq!(ghost.velocity, [1.0, 0.0, 0.0]);
        }
    }

    #[test]
    fn ghost_forces_reduce_onto_the_real_particle() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.exchange_ghosts().unwrap();
        // pretend a kernel pushed on every image
        let ghost_slots: Vec<CellSlot> = dd
            .ghost_cells
            .iter()
            .flat_map(|&c| {
                (0..dd.cells[c].particles.len()).map(move |s| CellSlot { cell: c, slot: s })
            })
            .collect();
        for slot in ghost_slots {
            if dd.particle(slot).id == 1 {
                dd.particle_mut(slot).force = [1.0, 0.0, 0.0];
            }
        }
        dd.collect_ghost_forces().unwrap();
        let p = dd.lookup_real(1).unwrap();
        assert!((p.force[0] - 7.0).abs() < 1e-12);
    }

    #[test]
    fn invalidate_ghosts_clears_images() {
        let mut dd = single_rank_store([2, 2, 2]);
        dd.add_particle(Particle::new(1, [0.5, 0.5, 0.5])).unwrap();
        dd.exchange_ghosts().unwrap();
        assert!(dd.ghost_particles().count() > 0);
        dd.invalidate_ghosts();
        assert_eq!(dd.ghost_particles().count(), 0);
        assert!(dd.lookup_local(1).is_some());
    }

    #[test]
    fn checked_mapping_rejects_points_outside_the_local_domain() {
        let config = SystemConfig {
            box_l: [8.0, 4.0, 4.0],
            node_grid: [1, 1, 1],
            cell_grid: [2, 2, 2],
        };
        let mut dd =
            DomainDecomposition::new(&config, Rc::new(LocalCollective::single())).unwrap();
        assert!(dd.cell_grid.map_position_checked([9.0, 1.0, 1.0]).is_none());
        dd.add_particle(Particle::new(1, [1.0, 1.0, 1.0])).unwrap();
    }
}
