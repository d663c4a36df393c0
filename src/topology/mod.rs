//! Distributed bonded-topology manager.
//!
//! The manager maintains a bond graph replicated identically on every
//! rank, together with its residue-level projection and the partition of
//! particles into molecules (connected components of residues). Local
//! edits — bond creation/removal events from observed tuple lists,
//! property-change requests, neighbor-distance updates — are only queued
//! between synchronization points; [`TopologyManager::exchange_data`]
//! gathers the queues from every rank once per step, merges them with
//! set-union semantics and applies them everywhere, so the replicated
//! structures never diverge.
//!
//! Derived angle/dihedral/1-4 tuples are regenerated from the graph after
//! every edit round and registered into the tuple lists pre-registered
//! for the matching particle-type combinations.

mod error;
mod graph;
mod properties;

pub use error::Error;
pub use graph::Graph;
pub use properties::ParticleUpdate;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crossbeam_channel::{unbounded, Receiver};
use log::{debug, warn};

use crate::comm::{Collective, CommError, InBuffer, OutBuffer};
use crate::model::{Pid, TypeId};
use crate::storage::DomainDecomposition;
use crate::tuples::{
    EventKind, FixedPairList, FixedQuadrupleList, FixedTripleList, TupleEvent,
};

type PairKey = (TypeId, TypeId);
type TripleKey = (TypeId, TypeId, TypeId);
type QuadrupleKey = (TypeId, TypeId, TypeId, TypeId);

fn canonical_edge(a: Pid, b: Pid) -> (Pid, Pid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn canonical_triple(end1: Pid, mid: Pid, end2: Pid) -> [Pid; 3] {
    if end1 <= end2 {
        [end1, mid, end2]
    } else {
        [end2, mid, end1]
    }
}

fn canonical_quadruple(q: [Pid; 4]) -> [Pid; 4] {
    let mut rev = q;
    rev.reverse();
    if q <= rev {
        q
    } else {
        rev
    }
}

#[derive(Debug, Default)]
struct MergedEdits {
    distance_updates: BTreeMap<(Pid, Pid), i64>,
    new_edges: BTreeSet<(Pid, Pid)>,
    removed_edges: BTreeSet<(Pid, Pid)>,
    property_changes: BTreeSet<Pid>,
}

/// Replicated topology state and the per-step synchronization protocol.
pub struct TopologyManager {
    comm: Rc<dyn Collective>,

    graph: Graph,
    res_graph: Graph,
    residues: BTreeMap<Pid, BTreeSet<Pid>>,
    molecules: BTreeMap<Pid, BTreeSet<Pid>>,
    pid_rid: HashMap<Pid, Pid>,
    pid_mid: HashMap<Pid, Pid>,
    max_mol_id: Pid,

    pair_lists: Vec<Rc<RefCell<FixedPairList>>>,
    tuple_map: HashMap<PairKey, Rc<RefCell<FixedPairList>>>,
    tuple14_map: HashMap<PairKey, Rc<RefCell<FixedPairList>>>,
    triples: Vec<Rc<RefCell<FixedTripleList>>>,
    triple_map: HashMap<TripleKey, Rc<RefCell<FixedTripleList>>>,
    quadruples: Vec<Rc<RefCell<FixedQuadrupleList>>>,
    quadruple_map: HashMap<QuadrupleKey, Rc<RefCell<FixedQuadrupleList>>>,
    update_angles: bool,
    update_dihedrals: bool,
    update_14_pairs: bool,

    events: Vec<Receiver<TupleEvent<2>>>,

    new_edges: Vec<(Pid, Pid)>,
    removed_edges: Vec<(Pid, Pid)>,
    nb_distance_particles: Vec<i64>,
    nb_edge_removal_roots: Vec<Pid>,
    property_change_pids: Vec<Pid>,
    dirty: bool,

    local_rules: HashMap<TypeId, ParticleUpdate>,
    distance_rules: HashMap<i64, Vec<(TypeId, ParticleUpdate)>>,
    nb_distances: BTreeSet<i64>,
    max_nb_distance: i64,
    bond_removal_rules: HashMap<TypeId, HashMap<i64, HashSet<(TypeId, TypeId)>>>,
    max_bond_nb_distance: i64,
}

impl TopologyManager {
    pub fn new(comm: Rc<dyn Collective>) -> Self {
        Self {
            comm,
            graph: Graph::new(),
            res_graph: Graph::new(),
            residues: BTreeMap::new(),
            molecules: BTreeMap::new(),
            pid_rid: HashMap::new(),
            pid_mid: HashMap::new(),
            max_mol_id: 0,
            pair_lists: Vec::new(),
            tuple_map: HashMap::new(),
            tuple14_map: HashMap::new(),
            triples: Vec::new(),
            triple_map: HashMap::new(),
            quadruples: Vec::new(),
            quadruple_map: HashMap::new(),
            update_angles: false,
            update_dihedrals: false,
            update_14_pairs: false,
            events: Vec::new(),
            new_edges: Vec::new(),
            removed_edges: Vec::new(),
            nb_distance_particles: Vec::new(),
            nb_edge_removal_roots: Vec::new(),
            property_change_pids: Vec::new(),
            dirty: true,
            local_rules: HashMap::new(),
            distance_rules: HashMap::new(),
            nb_distances: BTreeSet::new(),
            max_nb_distance: 0,
            bond_removal_rules: HashMap::new(),
            max_bond_nb_distance: 0,
        }
    }

    // ---- registration ----

    /// Observes a pair list: its add/remove events feed the pending-edit
    /// queues. Observed lists also contribute their bonds at
    /// initialization.
    pub fn observe(&mut self, list: &Rc<RefCell<FixedPairList>>) {
        let (tx, rx) = unbounded();
        list.borrow_mut().subscribe(tx);
        self.events.push(rx);
        self.pair_lists.push(Rc::clone(list));
    }

    /// Registers a pair list for bonds between the given types; the
    /// manager updates it (bond removal, storage refresh) but does not
    /// take edits from it.
    pub fn register_tuple(&mut self, list: &Rc<RefCell<FixedPairList>>, t1: TypeId, t2: TypeId) {
        self.pair_lists.push(Rc::clone(list));
        self.tuple_map.insert((t1, t2), Rc::clone(list));
        self.tuple_map.insert((t2, t1), Rc::clone(list));
    }

    /// Registers a pair list receiving regenerated 1-4 pairs for the
    /// given end-member types.
    pub fn register_14_tuple(&mut self, list: &Rc<RefCell<FixedPairList>>, t1: TypeId, t2: TypeId) {
        self.tuple14_map.insert((t1, t2), Rc::clone(list));
        self.tuple14_map.insert((t2, t1), Rc::clone(list));
        self.update_14_pairs = true;
    }

    /// Registers a triple list receiving regenerated angles for the given
    /// type sequence (both orientations).
    pub fn register_triple(
        &mut self,
        list: &Rc<RefCell<FixedTripleList>>,
        t1: TypeId,
        t2: TypeId,
        t3: TypeId,
    ) {
        self.triples.push(Rc::clone(list));
        self.triple_map.insert((t1, t2, t3), Rc::clone(list));
        self.triple_map.insert((t3, t2, t1), Rc::clone(list));
        self.update_angles = true;
    }

    /// Registers a quadruple list receiving regenerated dihedrals for the
    /// given type sequence (both orientations).
    pub fn register_quadruple(
        &mut self,
        list: &Rc<RefCell<FixedQuadrupleList>>,
        t1: TypeId,
        t2: TypeId,
        t3: TypeId,
        t4: TypeId,
    ) {
        self.quadruples.push(Rc::clone(list));
        self.quadruple_map.insert((t1, t2, t3, t4), Rc::clone(list));
        self.quadruple_map.insert((t4, t3, t2, t1), Rc::clone(list));
        self.update_dihedrals = true;
    }

    /// Registers a direct property-change rule for a particle type. A
    /// conflicting duplicate registration is a configuration error.
    pub fn register_local_property_change(
        &mut self,
        type_id: TypeId,
        rule: ParticleUpdate,
    ) -> Result<(), Error> {
        match self.local_rules.get(&type_id) {
            Some(existing) if *existing != rule => Err(Error::DuplicateLocalRule { type_id }),
            Some(_) => Ok(()),
            None => {
                self.local_rules.insert(type_id, rule);
                Ok(())
            }
        }
    }

    /// Registers a property-change rule applied to particles of the given
    /// type found at exactly `nb_level` hops from an invoked root.
    pub fn register_neighbor_property_change(
        &mut self,
        type_id: TypeId,
        rule: ParticleUpdate,
        nb_level: i64,
    ) {
        debug!(
            "register property change for type {} at level {}",
            type_id, nb_level
        );
        self.max_nb_distance = self.max_nb_distance.max(nb_level);
        self.nb_distances.insert(nb_level);
        self.distance_rules
            .entry(nb_level)
            .or_default()
            .push((type_id, rule));
    }

    /// Registers a bond-removal rule: bonds between `type1` and `type2`
    /// found at `nb_level` hops from a root of type `root_type` are
    /// queued for removal when that root is invoked.
    pub fn register_neighbor_bond_removal(
        &mut self,
        root_type: TypeId,
        nb_level: i64,
        type1: TypeId,
        type2: TypeId,
    ) {
        self.max_bond_nb_distance = self.max_bond_nb_distance.max(nb_level);
        let at_level = self
            .bond_removal_rules
            .entry(root_type)
            .or_default()
            .entry(nb_level)
            .or_default();
        at_level.insert((type1, type2));
        at_level.insert((type2, type1));
    }

    // ---- deferred-edit intake ----

    /// Queues property updates for the registered distances around
    /// `root`.
    pub fn invoke_neighbor_property_change(&mut self, root: Pid) {
        let nb = self.nodes_at_registered_distances(root);
        debug!(
            "neighbor property change from root {} generates {} updates",
            root,
            nb.len() / 3
        );
        self.nb_distance_particles.extend(nb);
        self.dirty = true;
    }

    /// Queues a direct property change for one particle.
    pub fn invoke_particle_properties_change(&mut self, pid: Pid) {
        self.property_change_pids.push(pid);
        self.dirty = true;
    }

    /// Queues distance-conditioned bond removal around `root` if a rule
    /// is registered for its type.
    pub fn invoke_neighbor_bond_removal(&mut self, store: &DomainDecomposition, root: Pid) {
        if let Some(p) = store.lookup_local(root) {
            if self.bond_removal_rules.contains_key(&p.type_id) {
                self.nb_edge_removal_roots.push(root);
                self.dirty = true;
            }
        }
    }

    fn drain_events(&mut self) {
        for rx in &self.events {
            while let Ok(event) = rx.try_recv() {
                let (a, b) = (event.pids[0], event.pids[1]);
                match event.kind {
                    EventKind::Added => {
                        if !self.graph.has_edge(a, b) {
                            debug!("queued new edge {}-{}", a, b);
                            self.new_edges.push((a, b));
                            self.dirty = true;
                        }
                    }
                    EventKind::Removed => {
                        if self.graph.has_edge(a, b) {
                            debug!("queued removed edge {}-{}", a, b);
                            self.removed_edges.push((a, b));
                            self.dirty = true;
                        }
                    }
                }
            }
        }
    }

    /// Drops events emitted while applying a synchronization round (the
    /// round's own removals echo through the tuple lists).
    fn discard_pending_events(&self) {
        for rx in &self.events {
            while rx.try_recv().is_ok() {}
        }
    }

    // ---- initialization ----

    fn reset(&mut self) {
        self.graph.clear();
        self.res_graph.clear();
        self.residues.clear();
        self.molecules.clear();
        self.pid_rid.clear();
        self.pid_mid.clear();
        self.max_mol_id = 0;
    }

    /// Builds the replicated topology from scratch by globally gathering
    /// every rank's bond edges and residue assignments.
    pub fn initialize(&mut self, store: &DomainDecomposition) -> Result<(), Error> {
        debug!("initializing topology");
        self.reset();

        let mut edges: Vec<(Pid, Pid)> = Vec::new();
        for list in &self.pair_lists {
            for pair in list.borrow().snapshot() {
                edges.push((pair[0], pair[1]));
            }
        }
        let local_resid: Vec<(Pid, i64)> =
            store.real_particles().map(|p| (p.id, p.res_id)).collect();

        let mut out = OutBuffer::new();
        out.write_i64(local_resid.len() as i64);
        out.write_i64(edges.len() as i64);
        out.write_i64(local_resid.len() as i64);
        for &(pid, rid) in &local_resid {
            out.write_i64(pid);
            out.write_i64(rid);
        }
        for &(a, b) in &edges {
            out.write_i64(a);
            out.write_i64(b);
        }
        let gathered = self.comm.all_gather(out.as_bytes())?;

        let mut total_expected: i64 = 0;
        let mut received: i64 = 0;
        let mut all_edges: Vec<(Pid, Pid)> = Vec::new();
        for bytes in gathered {
            let mut buf = InBuffer::new(bytes);
            let n_resid = buf.read_i64()?;
            let n_edges = buf.read_i64()?;
            total_expected += buf.read_i64()?;
            for _ in 0..n_resid {
                let pid = buf.read_i64()?;
                let rid = buf.read_i64()?;
                if rid == 0 {
                    return Err(Error::ResidZero { pid });
                }
                if self.pid_rid.contains_key(&pid) {
                    return Err(Error::ResidAlreadySet { pid });
                }
                self.pid_rid.insert(pid, rid);
                self.pid_mid.insert(pid, rid);
                self.residues.entry(rid).or_default().insert(pid);
                self.molecules.entry(rid).or_default().insert(pid);
                self.max_mol_id = self.max_mol_id.max(rid);
                received += 1;
            }
            for _ in 0..n_edges {
                let a = buf.read_i64()?;
                let b = buf.read_i64()?;
                all_edges.push((a, b));
            }
        }
        if received != total_expected {
            return Err(Error::InitializationMismatch {
                received,
                expected: total_expected,
            });
        }
        for (a, b) in all_edges {
            self.new_edge(a, b)?;
        }
        self.dirty = true;
        debug!(
            "topology initialized: {} particles, {} molecules",
            self.pid_rid.len(),
            self.molecules.len()
        );
        Ok(())
    }

    // ---- graph mutation ----

    fn new_edge(&mut self, pid1: Pid, pid2: Pid) -> Result<(), Error> {
        self.graph.add_edge(pid1, pid2);

        let rid1 = *self
            .pid_rid
            .get(&pid1)
            .ok_or(Error::MissingResidue { pid: pid1 })?;
        let rid2 = *self
            .pid_rid
            .get(&pid2)
            .ok_or(Error::MissingResidue { pid: pid2 })?;
        if rid1 != rid2 {
            self.res_graph.add_edge(rid1, rid2);
        }

        let mid1 = *self
            .pid_mid
            .get(&pid1)
            .ok_or(Error::MissingMolecule { pid: pid1 })?;
        let mid2 = *self
            .pid_mid
            .get(&pid2)
            .ok_or(Error::MissingMolecule { pid: pid2 })?;
        if mid1 != mid2 {
            // the smaller-numbered molecule absorbs the other
            let keep = mid1.min(mid2);
            let absorb = mid1.max(mid2);
            let absorbed = self
                .molecules
                .remove(&absorb)
                .ok_or(Error::MissingMoleculeSet { mid: absorb })?;
            for &pid in &absorbed {
                self.pid_mid.insert(pid, keep);
            }
            self.molecules
                .get_mut(&keep)
                .ok_or(Error::MissingMoleculeSet { mid: keep })?
                .extend(absorbed);
        }
        Ok(())
    }

    fn delete_edge(
        &mut self,
        store: &DomainDecomposition,
        pid1: Pid,
        pid2: Pid,
    ) -> Result<bool, Error> {
        let removed_bond = self.remove_bond(store, pid1, pid2)?;

        if !self.graph.contains(pid1) && !self.graph.contains(pid2) {
            return Err(Error::UnknownEdge { pid1, pid2 });
        }
        self.graph.remove_edge(pid1, pid2);

        let rid1 = *self
            .pid_rid
            .get(&pid1)
            .ok_or(Error::MissingResidue { pid: pid1 })?;
        let rid2 = *self
            .pid_rid
            .get(&pid2)
            .ok_or(Error::MissingResidue { pid: pid2 })?;
        let mid1 = *self
            .pid_mid
            .get(&pid1)
            .ok_or(Error::MissingMolecule { pid: pid1 })?;
        let mid2 = *self
            .pid_mid
            .get(&pid2)
            .ok_or(Error::MissingMolecule { pid: pid2 })?;
        if mid1 != mid2 {
            return Err(Error::MoleculeMismatch {
                pid1,
                pid2,
                mid1,
                mid2,
            });
        }

        if rid1 != rid2 {
            let pset1 = self
                .residues
                .get(&rid1)
                .ok_or(Error::MissingResidueSet { rid: rid1 })?;
            let pset2 = self
                .residues
                .get(&rid2)
                .ok_or(Error::MissingResidueSet { rid: rid2 })?;
            // any other bond still connecting the two residues?
            let has_bond = pset1
                .iter()
                .any(|&a| pset2.iter().any(|&b| self.graph.has_edge(a, b)));
            if !has_bond {
                if !self.res_graph.remove_edge(rid1, rid2) {
                    return Err(Error::UnknownResidueEdge { rid1, rid2 });
                }
                self.split_molecule(mid1, rid1, rid2)?;
            }
        }
        Ok(removed_bond)
    }

    /// After the residue graph lost the edge `rid1`-`rid2`, splits the
    /// molecule if the two residues ended up in different components: the
    /// side with fewer residues moves to a freshly allocated molecule id.
    fn split_molecule(&mut self, mid: Pid, rid1: Pid, rid2: Pid) -> Result<(), Error> {
        let comp1 = self.res_graph.component(rid1);
        if comp1.contains(&rid2) {
            // still connected through other residues
            return Ok(());
        }
        let comp2 = self.res_graph.component(rid2);
        let split = if comp1.len() < comp2.len() { comp1 } else { comp2 };

        self.max_mol_id += 1;
        let new_mid = self.max_mol_id;
        let mut new_set = BTreeSet::new();
        for &rid in &split {
            let members = self
                .residues
                .get(&rid)
                .ok_or(Error::MissingResidueSet { rid })?;
            for &pid in members {
                new_set.insert(pid);
                self.pid_mid.insert(pid, new_mid);
            }
        }
        let old_set = self
            .molecules
            .get_mut(&mid)
            .ok_or(Error::MissingMoleculeSet { mid })?;
        for pid in &new_set {
            old_set.remove(pid);
        }
        debug!(
            "molecule {} split: {} particles moved to new molecule {}",
            mid,
            new_set.len(),
            new_mid
        );
        self.molecules.insert(new_mid, new_set);
        Ok(())
    }

    /// Removes the bond from the registered pair list if both particles
    /// are locally resolvable; ghost-only pairs are another rank's job.
    fn remove_bond(
        &self,
        store: &DomainDecomposition,
        pid1: Pid,
        pid2: Pid,
    ) -> Result<bool, Error> {
        let (p1, p2) = match (store.lookup_local(pid1), store.lookup_local(pid2)) {
            (Some(p1), Some(p2)) => (p1, p2),
            _ => return Ok(false),
        };
        if p1.ghost && p2.ghost {
            return Ok(false);
        }
        let (t1, t2) = (p1.type_id, p2.type_id);
        let list = self
            .tuple_map
            .get(&(t1, t2))
            .ok_or(Error::MissingTupleRegistration {
                pid1,
                pid2,
                type1: t1,
                type2: t2,
            })?
            .clone();
        let removed = list.borrow_mut().remove([pid1, pid2], false);
        Ok(removed)
    }

    // ---- synchronization ----

    /// Per-step synchronization round: skipped entirely when no rank is
    /// dirty; otherwise gathers every rank's pending edits,
    /// merges them order-independently, applies removals then additions,
    /// propagates property updates, regenerates derived tuples, and
    /// clears the pending state.
    pub fn exchange_data(&mut self, store: &mut DomainDecomposition) -> Result<(), Error> {
        self.drain_events();
        let global_dirty = self.comm.all_reduce_or(self.dirty)?;
        if !global_dirty {
            debug!("topology globally clean, skipping exchange");
            return Ok(());
        }

        // Distance-conditioned bond removals depend on particles local to
        // some rank, yet every rank must expand them over the replicated
        // graph: agree on the roots first.
        let mut out = OutBuffer::new();
        out.write_i64s(&self.nb_edge_removal_roots);
        let gathered = self.comm.all_gather(out.as_bytes())?;
        let mut roots: BTreeSet<Pid> = BTreeSet::new();
        for bytes in gathered {
            roots.extend(InBuffer::new(bytes).read_i64s()?);
        }
        for root in roots {
            self.remove_neighbor_edges(store, root);
        }

        let payload = self.pack_edits();
        let gathered = self.comm.all_gather(&payload)?;
        let merged = Self::merge_edits(gathered)?;
        debug!(
            "merged edits: {} new edges, {} removed edges, {} distance updates, {} property changes",
            merged.new_edges.len(),
            merged.removed_edges.len(),
            merged.distance_updates.len(),
            merged.property_changes.len()
        );

        self.remove_angles_dihedrals(store, &merged.removed_edges)?;
        for &(a, b) in &merged.removed_edges {
            self.delete_edge(store, a, b)?;
        }
        for &(a, b) in &merged.new_edges {
            self.new_edge(a, b)?;
        }
        for (&(_root, pid), &distance) in &merged.distance_updates {
            self.update_particle_properties_at_distance(store, pid, distance)?;
        }
        for &pid in &merged.property_changes {
            self.update_particle_properties(store, pid);
        }
        self.generate_new_angles_dihedrals(store, &merged.new_edges)?;

        if !merged.removed_edges.is_empty() {
            for list in &self.pair_lists {
                list.borrow_mut().update_local(store)?;
            }
        }

        self.new_edges.clear();
        self.removed_edges.clear();
        self.nb_distance_particles.clear();
        self.nb_edge_removal_roots.clear();
        self.property_change_pids.clear();
        self.discard_pending_events();
        self.dirty = false;

        self.verify_replication()?;
        Ok(())
    }

    fn pack_edits(&self) -> Vec<u8> {
        let mut out = OutBuffer::new();
        out.write_i64((self.nb_distance_particles.len() / 3) as i64);
        out.write_i64(self.new_edges.len() as i64);
        out.write_i64(self.removed_edges.len() as i64);
        out.write_i64(self.property_change_pids.len() as i64);
        for &v in &self.nb_distance_particles {
            out.write_i64(v);
        }
        for &(a, b) in &self.new_edges {
            out.write_i64(a);
            out.write_i64(b);
        }
        for &(a, b) in &self.removed_edges {
            out.write_i64(a);
            out.write_i64(b);
        }
        for &pid in &self.property_change_pids {
            out.write_i64(pid);
        }
        out.into_bytes()
    }

    fn merge_edits(gathered: Vec<Vec<u8>>) -> Result<MergedEdits, Error> {
        let mut merged = MergedEdits::default();
        for bytes in gathered {
            let mut buf = InBuffer::new(bytes);
            let n_distance = buf.read_i64()?;
            let n_new = buf.read_i64()?;
            let n_removed = buf.read_i64()?;
            let n_props = buf.read_i64()?;
            for _ in 0..n_distance {
                let root = buf.read_i64()?;
                let distance = buf.read_i64()?;
                let pid = buf.read_i64()?;
                match merged.distance_updates.get(&(root, pid)) {
                    Some(&existing) if existing != distance => {
                        return Err(Error::MergeAmbiguity {
                            root,
                            pid,
                            existing,
                            incoming: distance,
                        });
                    }
                    _ => {
                        merged.distance_updates.insert((root, pid), distance);
                    }
                }
            }
            for _ in 0..n_new {
                let a = buf.read_i64()?;
                let b = buf.read_i64()?;
                merged.new_edges.insert(canonical_edge(a, b));
            }
            for _ in 0..n_removed {
                let a = buf.read_i64()?;
                let b = buf.read_i64()?;
                merged.removed_edges.insert(canonical_edge(a, b));
            }
            for _ in 0..n_props {
                merged.property_changes.insert(buf.read_i64()?);
            }
        }
        Ok(merged)
    }

    /// Cheap cross-rank agreement check on the replicated graph.
    fn verify_replication(&self) -> Result<(), Error> {
        let local = self.graph.degree_sum() as i64;
        let bytes = self.comm.broadcast(0, &local.to_ne_bytes())?;
        let value: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            Error::Comm(CommError::Truncated {
                needed: 8,
                available: bytes.len(),
            })
        })?;
        let root = i64::from_ne_bytes(value);
        if root != local {
            return Err(Error::Desynchronized { local, root });
        }
        Ok(())
    }

    // ---- derived tuples ----

    fn remove_angles_dihedrals(
        &self,
        store: &DomainDecomposition,
        removed: &BTreeSet<(Pid, Pid)>,
    ) -> Result<(), Error> {
        if removed.is_empty() {
            return Ok(());
        }
        for &(a, b) in removed {
            for list in &self.triples {
                list.borrow_mut().remove_by_bond(a, b);
            }
            for list in &self.quadruples {
                list.borrow_mut().remove_by_bond(a, b);
            }
        }
        for list in &self.triples {
            list.borrow_mut().update_local(store)?;
        }
        for list in &self.quadruples {
            list.borrow_mut().update_local(store)?;
        }
        Ok(())
    }

    fn generate_new_angles_dihedrals(
        &self,
        store: &DomainDecomposition,
        new_edges: &BTreeSet<(Pid, Pid)>,
    ) -> Result<(), Error> {
        if new_edges.is_empty() {
            return Ok(());
        }
        let mut triplets: BTreeSet<[Pid; 3]> = BTreeSet::new();
        let mut quadruplets: BTreeSet<[Pid; 4]> = BTreeSet::new();
        for &(a, b) in new_edges {
            self.enumerate_around_edge(a, b, &mut triplets, &mut quadruplets)?;
        }
        if self.update_angles {
            self.define_angles(store, &triplets)?;
        }
        if self.update_dihedrals {
            self.define_dihedrals(store, &quadruplets)?;
        }
        if self.update_14_pairs {
            self.define_14_pairs(store, &quadruplets)?;
        }
        Ok(())
    }

    /// Enumerates the 2- and 3-hop paths through the new edge
    /// `pid1`-`pid2`: angles ending at either endpoint, dihedrals with
    /// the edge at either end or spanning the middle.
    fn enumerate_around_edge(
        &self,
        pid1: Pid,
        pid2: Pid,
        triplets: &mut BTreeSet<[Pid; 3]>,
        quadruplets: &mut BTreeSet<[Pid; 4]>,
    ) -> Result<(), Error> {
        let nb1 = self
            .graph
            .neighbors(pid1)
            .ok_or(Error::UnknownNode { pid: pid1 })?
            .clone();
        let nb2 = self
            .graph
            .neighbors(pid2)
            .ok_or(Error::UnknownNode { pid: pid2 })?
            .clone();

        for &n in &nb1 {
            if n == pid1 || n == pid2 {
                continue;
            }
            triplets.insert(canonical_triple(pid2, pid1, n));
            if let Some(nn) = self.graph.neighbors(n) {
                for &m in nn {
                    if m == n || m == pid1 || m == pid2 {
                        continue;
                    }
                    quadruplets.insert(canonical_quadruple([pid2, pid1, n, m]));
                }
            }
        }
        for &n in &nb2 {
            if n == pid1 || n == pid2 {
                continue;
            }
            triplets.insert(canonical_triple(pid1, pid2, n));
            if let Some(nn) = self.graph.neighbors(n) {
                for &m in nn {
                    if m == n || m == pid1 || m == pid2 {
                        continue;
                    }
                    quadruplets.insert(canonical_quadruple([pid1, pid2, n, m]));
                }
            }
        }
        for &n1 in &nb1 {
            if n1 == pid1 || n1 == pid2 {
                continue;
            }
            for &n2 in &nb2 {
                if n2 == pid1 || n2 == pid2 || n1 == n2 {
                    continue;
                }
                quadruplets.insert(canonical_quadruple([n1, pid1, pid2, n2]));
            }
        }
        Ok(())
    }

    fn define_angles(
        &self,
        store: &DomainDecomposition,
        triplets: &BTreeSet<[Pid; 3]>,
    ) -> Result<(), Error> {
        for t in triplets {
            let (end1, mid, end2) = (t[0], t[1], t[2]);
            let (p1, p2, p3) = match (
                store.lookup_local(end1),
                store.lookup_real(mid),
                store.lookup_local(end2),
            ) {
                (Some(p1), Some(p2), Some(p3)) => (p1, p2, p3),
                // the canonical member is owned elsewhere
                _ => continue,
            };
            let key = (p1.type_id, p2.type_id, p3.type_id);
            let Some(list) = self.triple_map.get(&key) else {
                debug!(
                    "no triple list registered for types {}-{}-{}, angle {}-{}-{} skipped",
                    key.0, key.1, key.2, end1, mid, end2
                );
                continue;
            };
            if list.borrow_mut().iadd(store, [end1, mid, end2])? {
                debug!("defined new angle {}-{}-{}", end1, mid, end2);
            }
        }
        Ok(())
    }

    fn define_dihedrals(
        &self,
        store: &DomainDecomposition,
        quadruplets: &BTreeSet<[Pid; 4]>,
    ) -> Result<(), Error> {
        for q in quadruplets {
            let parts = [
                store.lookup_local(q[0]),
                store.lookup_local(q[1]),
                store.lookup_local(q[2]),
                store.lookup_local(q[3]),
            ];
            let [Some(p1), Some(p2), Some(p3), Some(p4)] = parts else {
                continue;
            };
            let key = (p1.type_id, p2.type_id, p3.type_id, p4.type_id);
            let mut reverse_order = false;
            let mut list = self.quadruple_map.get(&key);
            if list.is_none() {
                list = self
                    .quadruple_map
                    .get(&(key.3, key.2, key.1, key.0));
                reverse_order = true;
            }
            let Some(list) = list else {
                debug!(
                    "no quadruple list registered for types {:?}, dihedral {:?} skipped",
                    key, q
                );
                continue;
            };
            if (reverse_order && p4.ghost) || (!reverse_order && p1.ghost) {
                continue;
            }
            let added = if reverse_order {
                list.borrow_mut().iadd(store, [q[3], q[2], q[1], q[0]])?
            } else {
                list.borrow_mut().iadd(store, [q[0], q[1], q[2], q[3]])?
            };
            if added {
                debug!("defined new dihedral {:?}", q);
            }
        }
        Ok(())
    }

    fn define_14_pairs(
        &self,
        store: &DomainDecomposition,
        quadruplets: &BTreeSet<[Pid; 4]>,
    ) -> Result<(), Error> {
        for q in quadruplets {
            let (Some(p1), Some(p4)) = (store.lookup_local(q[0]), store.lookup_local(q[3]))
            else {
                continue;
            };
            let Some(list) = self.tuple14_map.get(&(p1.type_id, p4.type_id)) else {
                continue;
            };
            if list.borrow_mut().iadd(store, [q[0], q[3]])? {
                debug!("defined new 1-4 pair {}-{}", q[0], q[3]);
            }
        }
        Ok(())
    }

    // ---- property propagation ----

    /// BFS around `root` queuing bond removals matching the registered
    /// (distance, type-pair) rules for the root's type.
    fn remove_neighbor_edges(&mut self, store: &DomainDecomposition, root: Pid) {
        let Some(root_particle) = store.lookup_local(root) else {
            return;
        };
        let Some(distance_rules) = self.bond_removal_rules.get(&root_particle.type_id) else {
            return;
        };

        let mut visited: HashMap<Pid, i64> = HashMap::new();
        visited.insert(root, 0);
        let mut queue = VecDeque::new();
        queue.push_back(root);
        let mut to_remove: Vec<(Pid, Pid)> = Vec::new();
        while let Some(current) = queue.pop_front() {
            let new_distance = visited[&current] + 1;
            let pair_types = distance_rules.get(&new_distance);
            let Some(adj) = self.graph.neighbors(current) else {
                continue;
            };
            for &node in adj {
                if visited.contains_key(&node) {
                    continue;
                }
                if let Some(pair_types) = pair_types {
                    if let (Some(pc), Some(pn)) =
                        (store.lookup_local(current), store.lookup_local(node))
                    {
                        if pair_types.contains(&(pc.type_id, pn.type_id)) {
                            to_remove.push(canonical_edge(current, node));
                        }
                    }
                }
                if new_distance < self.max_bond_nb_distance {
                    queue.push_back(node);
                }
                visited.insert(node, new_distance);
            }
        }
        self.removed_edges.extend(to_remove);
    }

    fn nodes_at_registered_distances(&self, root: Pid) -> Vec<i64> {
        let mut out = Vec::new();
        for (node, distance) in self.graph.bfs_up_to(root, self.max_nb_distance) {
            if self.nb_distances.contains(&distance) {
                out.push(root);
                out.push(distance);
                out.push(node);
            }
        }
        out
    }

    fn update_particle_properties_at_distance(
        &self,
        store: &mut DomainDecomposition,
        pid: Pid,
        distance: i64,
    ) -> Result<(), Error> {
        let Some(rules) = self.distance_rules.get(&distance) else {
            return Ok(());
        };
        let Some(p) = store.lookup_local(pid) else {
            return Ok(());
        };
        let p_type = p.type_id;
        let applicable: Vec<&ParticleUpdate> = rules
            .iter()
            .filter(|(t, rule)| *t == p_type && rule.matches(p))
            .map(|(_, rule)| rule)
            .collect();
        let registered_for_type = rules.iter().any(|(t, _)| *t == p_type);
        if !registered_for_type {
            return Ok(());
        }
        if applicable.len() > 1 {
            return Err(Error::AmbiguousPropertyUpdate { pid, distance });
        }
        let Some(rule) = applicable.first().cloned().cloned() else {
            return Err(Error::NoApplicableRule { pid, distance });
        };
        if let Some(p) = store.lookup_local_mut(pid) {
            rule.apply(p);
        }
        Ok(())
    }

    fn update_particle_properties(&self, store: &mut DomainDecomposition, pid: Pid) -> bool {
        let Some(p) = store.lookup_local(pid) else {
            return false;
        };
        let Some(rule) = self.local_rules.get(&p.type_id) else {
            return false;
        };
        let rule = rule.clone();
        match store.lookup_local_mut(pid) {
            Some(p) => {
                rule.apply(p);
                true
            }
            None => false,
        }
    }

    // ---- queries ----

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_particle_connected(&self, pid1: Pid, pid2: Pid) -> bool {
        self.graph.has_edge(pid1, pid2)
    }

    pub fn is_residues_connected(&self, pid1: Pid, pid2: Pid) -> bool {
        match (self.pid_rid.get(&pid1), self.pid_rid.get(&pid2)) {
            (Some(&rid1), Some(&rid2)) => self.res_graph.has_edge(rid1, rid2),
            _ => false,
        }
    }

    pub fn is_same_residue(&self, pid1: Pid, pid2: Pid) -> bool {
        match (self.pid_rid.get(&pid1), self.pid_rid.get(&pid2)) {
            (Some(rid1), Some(rid2)) => rid1 == rid2,
            _ => false,
        }
    }

    pub fn is_same_molecule(&self, pid1: Pid, pid2: Pid) -> bool {
        match (self.pid_mid.get(&pid1), self.pid_mid.get(&pid2)) {
            (Some(mid1), Some(mid2)) => mid1 == mid2,
            _ => false,
        }
    }

    pub fn residue_of(&self, pid: Pid) -> Option<Pid> {
        self.pid_rid.get(&pid).copied()
    }

    pub fn molecule_of(&self, pid: Pid) -> Option<Pid> {
        self.pid_mid.get(&pid).copied()
    }

    pub fn molecule_ids(&self) -> Vec<Pid> {
        self.molecules.keys().copied().collect()
    }

    pub fn molecule_members(&self, mid: Pid) -> Option<&BTreeSet<Pid>> {
        self.molecules.get(&mid)
    }

    pub fn residue_members(&self, rid: Pid) -> Option<&BTreeSet<Pid>> {
        self.residues.get(&rid)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_snapshot(&self) -> Vec<(Pid, Vec<Pid>)> {
        self.graph.snapshot()
    }

    pub fn residue_graph_snapshot(&self) -> Vec<(Pid, Vec<Pid>)> {
        self.res_graph.snapshot()
    }

    /// Whether the single direct neighbor of `root` with the given type
    /// has a state inside `[min_state, max_state)`. Multiple neighbors of
    /// that type make the query ambiguous and it answers `false`.
    pub fn is_neighbor_particle_in_state(
        &self,
        store: &DomainDecomposition,
        root: Pid,
        nb_type: TypeId,
        min_state: i64,
        max_state: i64,
    ) -> bool {
        let Some(adj) = self.graph.neighbors(root) else {
            return false;
        };
        let mut matches = adj
            .iter()
            .filter_map(|&n| store.lookup_local(n))
            .filter(|p| p.type_id == nb_type);
        match (matches.next(), matches.next()) {
            (Some(p), None) => p.state >= min_state && p.state < max_state,
            (Some(_), Some(_)) => {
                warn!(
                    "multiple neighbours of type {} around root {}",
                    nb_type, root
                );
                false
            }
            _ => false,
        }
    }

    /// Whether every real particle matching the rule's type at exactly
    /// `depth` hops from `root` satisfies the rule's applicability
    /// condition (and at least one such particle exists).
    pub fn has_neighbor_particle_property(
        &self,
        store: &DomainDecomposition,
        root: Pid,
        rule: &ParticleUpdate,
        depth: i64,
    ) -> bool {
        let at_depth: Vec<Pid> = self
            .graph
            .bfs_up_to(root, depth)
            .into_iter()
            .filter(|&(_, d)| d == depth)
            .map(|(n, _)| n)
            .collect();
        let mut counter = 0;
        let mut valid = true;
        for pid in at_depth {
            if let Some(p) = store.lookup_real(pid) {
                if rule.type_id.map_or(true, |t| t == p.type_id) {
                    valid &= rule.matches(p);
                    counter += 1;
                }
            }
        }
        counter > 0 && valid
    }
}
