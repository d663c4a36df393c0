//! Distributed fixed tuple lists.
//!
//! A fixed tuple list records bonded relationships (pairs, triples,
//! quadruples of particle ids) in a multimap keyed by a *canonical*
//! member: the lower id for pairs, the second member for triples and
//! quadruples. A tuple is stored authoritatively on exactly one rank —
//! the rank owning the canonical member as a real particle — and its
//! record migrates inside the particle-migration message when that
//! particle changes rank.
//!
//! All arities share one generic implementation,
//! [`FixedTupleList`]`<N, P>`, where `P` is an optional per-tuple payload
//! (the lambda-weighted variants use `P = f64`; weight updates fire no
//! events). Interested parties subscribe with a channel sender and
//! receive every add/remove event.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use log::debug;
use thiserror::Error;

use crate::comm::{check_aggregated, Collective, CommError, InBuffer, OutBuffer};
use crate::model::{CellSlot, Particle, Pid};
use crate::storage::{DomainDecomposition, Error as StorageError, MigrationHooks};

/// Pair list keyed by the lower particle id.
pub type FixedPairList = FixedTupleList<2>;
/// Triple list keyed by the middle particle id.
pub type FixedTripleList = FixedTupleList<3>;
/// Quadruple list keyed by the second particle id.
pub type FixedQuadrupleList = FixedTupleList<4>;

/// Lambda-weighted variants used by adaptive-resolution coupling.
pub type FixedPairLambdaList = FixedTupleList<2, f64>;
pub type FixedTripleLambdaList = FixedTupleList<3, f64>;
pub type FixedQuadrupleLambdaList = FixedTupleList<4, f64>;

/// Errors raised by tuple list operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The canonical member is locally real but another member is not
    /// resolvable here: the topology references a particle that is not
    /// replicated where it must be.
    #[error("tuple particle {pid} does not exist here and cannot be added (tuple {tuple})")]
    MissingMember { pid: Pid, tuple: String },

    #[error(transparent)]
    Comm(#[from] CommError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
}

/// Add/remove notification delivered to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleEvent<const N: usize> {
    pub kind: EventKind,
    pub pids: [Pid; N],
}

/// Optional per-tuple payload carried through migration.
pub trait TuplePayload: Clone {
    fn write(&self, buf: &mut OutBuffer);
    fn read(buf: &mut InBuffer) -> Result<Self, CommError>;
}

impl TuplePayload for () {
    fn write(&self, _buf: &mut OutBuffer) {}

    fn read(_buf: &mut InBuffer) -> Result<Self, CommError> {
        Ok(())
    }
}

impl TuplePayload for f64 {
    fn write(&self, buf: &mut OutBuffer) {
        buf.write_f64(*self);
    }

    fn read(buf: &mut InBuffer) -> Result<Self, CommError> {
        buf.read_f64()
    }
}

fn fmt_tuple(pids: &[Pid]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Distributed multimap of bonded tuples plus the slot-resolved list used
/// by force loops.
pub struct FixedTupleList<const N: usize, P = ()> {
    global: HashMap<Pid, Vec<([Pid; N], P)>>,
    local: Vec<[CellSlot; N]>,
    subscribers: Vec<Sender<TupleEvent<N>>>,
    init_payload: P,
}

impl<const N: usize, P: TuplePayload + Default> FixedTupleList<N, P> {
    pub fn new() -> Self {
        Self::with_payload(P::default())
    }
}

impl<const N: usize, P: TuplePayload + Default> Default for FixedTupleList<N, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, P: TuplePayload> FixedTupleList<N, P> {
    /// Index of the canonical member whose owner rank stores the tuple.
    pub const CANONICAL: usize = if N == 2 { 0 } else { 1 };

    pub fn with_payload(init_payload: P) -> Self {
        Self {
            global: HashMap::new(),
            local: Vec::new(),
            subscribers: Vec::new(),
            init_payload,
        }
    }

    /// Registers an event subscriber; every subscriber sees every
    /// add/remove.
    pub fn subscribe(&mut self, tx: Sender<TupleEvent<N>>) {
        self.subscribers.push(tx);
    }

    fn notify(subscribers: &mut Vec<Sender<TupleEvent<N>>>, kind: EventKind, pids: [Pid; N]) {
        subscribers.retain(|tx| tx.send(TupleEvent { kind, pids }).is_ok());
    }

    fn normalize(mut pids: [Pid; N]) -> [Pid; N] {
        if N == 2 && pids[0] > pids[1] {
            pids.swap(0, 1);
        }
        pids
    }

    fn reversed(pids: [Pid; N]) -> [Pid; N] {
        let mut rev = pids;
        rev.reverse();
        rev
    }

    fn contains(&self, pids: [Pid; N]) -> bool {
        let forward = self
            .global
            .get(&pids[Self::CANONICAL])
            .map(|entries| entries.iter().any(|(t, _)| *t == pids))
            .unwrap_or(false);
        if forward {
            return true;
        }
        let rev = Self::reversed(pids);
        self.global
            .get(&rev[Self::CANONICAL])
            .map(|entries| entries.iter().any(|(t, _)| *t == rev))
            .unwrap_or(false)
    }

    /// Resolves every member to a current slot; on failure returns the
    /// first unresolvable pid.
    fn resolve_slots(
        &self,
        store: &DomainDecomposition,
        pids: [Pid; N],
    ) -> Result<[CellSlot; N], Pid> {
        let mut slots = [CellSlot { cell: 0, slot: 0 }; N];
        for (i, &pid) in pids.iter().enumerate() {
            let slot = if i == Self::CANONICAL {
                store.lookup_real_slot(pid)
            } else {
                store.lookup_local_slot(pid)
            };
            slots[i] = slot.ok_or(pid)?;
        }
        Ok(slots)
    }

    /// Adds a tuple on the rank owning the canonical member as a real
    /// particle; other ranks return `Ok(false)`. Every rank must call
    /// this collectively with the same members: a missing non-canonical
    /// member is reported through the communicator-wide aggregated check
    /// so the whole run fails with one combined diagnostic.
    ///
    /// Duplicate tuples (same members in forward or reverse order) are
    /// rejected idempotently: one stored record, one `Added` event.
    pub fn add(
        &mut self,
        store: &DomainDecomposition,
        comm: &dyn Collective,
        pids: [Pid; N],
    ) -> Result<bool, Error> {
        let pids = Self::normalize(pids);
        let here = store.lookup_real(pids[Self::CANONICAL]).is_some();
        let mut errors = Vec::new();
        if here {
            for (i, &pid) in pids.iter().enumerate() {
                if i != Self::CANONICAL && store.lookup_local(pid).is_none() {
                    errors.push(format!(
                        "tuple particle {} does not exist here and cannot be added (tuple {})",
                        pid,
                        fmt_tuple(&pids)
                    ));
                }
            }
        }
        check_aggregated(comm, &errors)?;
        if !here {
            return Ok(false);
        }
        self.insert_checked(store, pids)
    }

    /// Node-local variant of [`add`](Self::add): no collective error
    /// agreement, a missing member fails immediately.
    pub fn iadd(&mut self, store: &DomainDecomposition, pids: [Pid; N]) -> Result<bool, Error> {
        let pids = Self::normalize(pids);
        if store.lookup_real(pids[Self::CANONICAL]).is_none() {
            return Ok(false);
        }
        for (i, &pid) in pids.iter().enumerate() {
            if i != Self::CANONICAL && store.lookup_local(pid).is_none() {
                return Err(Error::MissingMember {
                    pid,
                    tuple: fmt_tuple(&pids),
                });
            }
        }
        self.insert_checked(store, pids)
    }

    fn insert_checked(
        &mut self,
        store: &DomainDecomposition,
        pids: [Pid; N],
    ) -> Result<bool, Error> {
        if self.contains(pids) {
            debug!("tuple {} already exists", fmt_tuple(&pids));
            return Ok(false);
        }
        let slots = self.resolve_slots(store, pids).map_err(|pid| Error::MissingMember {
            pid,
            tuple: fmt_tuple(&pids),
        })?;
        self.local.push(slots);
        self.global
            .entry(pids[Self::CANONICAL])
            .or_default()
            .push((pids, self.init_payload.clone()));
        Self::notify(&mut self.subscribers, EventKind::Added, pids);
        debug!("added tuple {}", fmt_tuple(&pids));
        Ok(true)
    }

    /// Removes an exact tuple, matching both orientations. Fires a
    /// `Removed` event per erased record unless `suppress_event` is set.
    pub fn remove(&mut self, pids: [Pid; N], suppress_event: bool) -> bool {
        let pids = Self::normalize(pids);
        let mut removed = Vec::new();
        for candidate in [pids, Self::reversed(pids)] {
            if let Some(entries) = self.global.get_mut(&candidate[Self::CANONICAL]) {
                entries.retain(|(t, _)| {
                    if *t == candidate {
                        removed.push(*t);
                        false
                    } else {
                        true
                    }
                });
                if entries.is_empty() {
                    self.global.remove(&candidate[Self::CANONICAL]);
                }
            }
            if N == 2 {
                // pairs are stored sorted; the reversed probe is identical
                break;
            }
        }
        for t in &removed {
            debug!("removed tuple {}", fmt_tuple(t));
            if !suppress_event {
                Self::notify(&mut self.subscribers, EventKind::Removed, *t);
            }
        }
        !removed.is_empty()
    }

    /// Removes every tuple keyed by the given canonical member; returns
    /// the number of erased records.
    pub fn remove_by_canonical(&mut self, pid: Pid, suppress_event: bool) -> usize {
        let Some(entries) = self.global.remove(&pid) else {
            return 0;
        };
        let count = entries.len();
        for (pids, _) in entries {
            debug!("removed tuple {}", fmt_tuple(&pids));
            if !suppress_event {
                Self::notify(&mut self.subscribers, EventKind::Removed, pids);
            }
        }
        count
    }

    /// Removes every tuple containing the bond `pid1`-`pid2` as a pair of
    /// structurally adjacent members, in either orientation.
    pub fn remove_by_bond(&mut self, pid1: Pid, pid2: Pid) -> bool {
        let mut removed = Vec::new();
        self.global.retain(|_, entries| {
            entries.retain(|(t, _)| {
                let hit = (0..N - 1).any(|i| {
                    (t[i] == pid1 && t[i + 1] == pid2) || (t[i] == pid2 && t[i + 1] == pid1)
                });
                if hit {
                    removed.push(*t);
                }
                !hit
            });
            !entries.is_empty()
        });
        for t in &removed {
            debug!("removed tuple {} via bond {}-{}", fmt_tuple(t), pid1, pid2);
            Self::notify(&mut self.subscribers, EventKind::Removed, *t);
        }
        !removed.is_empty()
    }

    /// Number of tuples stored on this rank.
    pub fn size(&self) -> usize {
        self.global.values().map(Vec::len).sum()
    }

    /// Number of tuples across all ranks; invariant under migration.
    pub fn total_size(&self, comm: &dyn Collective) -> Result<i64, CommError> {
        comm.all_reduce_sum(self.size() as i64)
    }

    /// Sorted copy of all tuples stored on this rank.
    pub fn snapshot(&self) -> Vec<[Pid; N]> {
        let mut tuples: Vec<[Pid; N]> = self
            .global
            .values()
            .flat_map(|entries| entries.iter().map(|(t, _)| *t))
            .collect();
        tuples.sort_unstable();
        tuples
    }

    /// Slot-resolved tuples for force loops; refreshed by
    /// [`update_local`](Self::update_local).
    pub fn local_tuples(&self) -> &[[CellSlot; N]] {
        &self.local
    }

    /// Iterates live particle references for every locally resolved
    /// tuple.
    pub fn resolve<'a>(
        &'a self,
        store: &'a DomainDecomposition,
    ) -> impl Iterator<Item = [&'a Particle; N]> + 'a {
        self.local
            .iter()
            .map(move |slots| std::array::from_fn(|i| store.particle(slots[i])))
    }

    /// Rebuilds the slot-resolved list from the authoritative multimap.
    /// A member the topology says must be here but is not resolvable is a
    /// fatal consistency error.
    pub fn update_local(&mut self, store: &DomainDecomposition) -> Result<(), StorageError> {
        self.local.clear();
        let mut keys: Vec<Pid> = self.global.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            for (pids, _) in &self.global[&key] {
                let slots = self.resolve_slots(store, *pids).map_err(|pid| {
                    StorageError::missing_particle(
                        pid,
                        format!("member of tuple {}", fmt_tuple(pids)),
                    )
                })?;
                self.local.push(slots);
            }
        }
        Ok(())
    }
}

impl<const N: usize> FixedTupleList<N, f64> {
    /// Weight of a stored tuple, matching either orientation.
    pub fn lambda(&self, pids: [Pid; N]) -> Option<f64> {
        let pids = Self::normalize(pids);
        for candidate in [pids, Self::reversed(pids)] {
            if let Some(entries) = self.global.get(&candidate[Self::CANONICAL]) {
                if let Some((_, w)) = entries.iter().find(|(t, _)| *t == candidate) {
                    return Some(*w);
                }
            }
        }
        None
    }

    /// Updates the weight of a stored tuple; returns whether a tuple
    /// matched. Weight updates fire no events.
    pub fn set_lambda(&mut self, pids: [Pid; N], weight: f64) -> bool {
        let pids = Self::normalize(pids);
        for candidate in [pids, Self::reversed(pids)] {
            if let Some(entries) = self.global.get_mut(&candidate[Self::CANONICAL]) {
                if let Some((_, w)) = entries.iter_mut().find(|(t, _)| *t == candidate) {
                    *w = weight;
                    return true;
                }
            }
        }
        false
    }
}

impl<const N: usize, P: TuplePayload> MigrationHooks for FixedTupleList<N, P> {
    /// Serializes and erases all tuples owned by departing particles:
    /// `[owner_id, partner_count, partner_ids…]` runs inside a
    /// length-prefixed integer stream, payloads following positionally.
    fn before_send(&mut self, departing: &[Particle], buf: &mut OutBuffer) {
        let mut ints: Vec<i64> = Vec::new();
        let mut payloads: Vec<P> = Vec::new();
        for particle in departing {
            if let Some(entries) = self.global.remove(&particle.id) {
                ints.push(particle.id);
                ints.push(entries.len() as i64);
                for (pids, payload) in entries {
                    for (i, member) in pids.iter().enumerate() {
                        if i != Self::CANONICAL {
                            ints.push(*member);
                        }
                    }
                    payloads.push(payload);
                }
            }
        }
        buf.write_i64s(&ints);
        for payload in &payloads {
            payload.write(buf);
        }
    }

    fn after_recv(&mut self, _arrived: &[Particle], buf: &mut InBuffer) -> Result<(), CommError> {
        let ints = buf.read_i64s()?;
        let mut tuples: Vec<[Pid; N]> = Vec::new();
        let mut i = 0;
        while i < ints.len() {
            if i + 2 > ints.len() {
                return Err(CommError::Truncated {
                    needed: 2,
                    available: ints.len() - i,
                });
            }
            let owner = ints[i];
            let count = ints[i + 1] as usize;
            i += 2;
            if i + count * (N - 1) > ints.len() {
                return Err(CommError::Truncated {
                    needed: count * (N - 1),
                    available: ints.len() - i,
                });
            }
            for _ in 0..count {
                let mut pids = [0 as Pid; N];
                pids[Self::CANONICAL] = owner;
                for slot in 0..N {
                    if slot != Self::CANONICAL {
                        pids[slot] = ints[i];
                        i += 1;
                    }
                }
                tuples.push(pids);
            }
        }
        for pids in tuples {
            let payload = P::read(buf)?;
            self.global
                .entry(pids[Self::CANONICAL])
                .or_default()
                .push((pids, payload));
        }
        Ok(())
    }

    fn on_particles_changed(&mut self, store: &DomainDecomposition) -> Result<(), StorageError> {
        self.update_local(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCollective;
    use crate::config::SystemConfig;
    use crossbeam_channel::unbounded;
    use std::rc::Rc;

    fn store_with_particles(pids: &[Pid]) -> DomainDecomposition {
        let config = SystemConfig {
            box_l: [10.0, 10.0, 10.0],
            node_grid: [1, 1, 1],
            cell_grid: [2, 2, 2],
        };
        let mut dd =
            DomainDecomposition::new(&config, Rc::new(LocalCollective::single())).unwrap();
        for (i, &pid) in pids.iter().enumerate() {
            let mut p = Particle::new(pid, [0.5 + i as f64, 0.5, 0.5]);
            p.res_id = 1;
            dd.add_particle(p).unwrap();
        }
        dd
    }

    #[test]
    fn add_is_idempotent_with_one_event() {
        let dd = store_with_particles(&[1, 2]);
        let mut list = FixedPairList::new();
        let (tx, rx) = unbounded();
        list.subscribe(tx);

        assert!(list.iadd(&dd, [1, 2]).unwrap());
        assert!(!list.iadd(&dd, [1, 2]).unwrap());
        assert!(!list.iadd(&dd, [2, 1]).unwrap());
        assert_eq!(list.size(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            TupleEvent {
                kind: EventKind::Added,
                pids: [1, 2]
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn add_returns_false_when_canonical_absent() {
        let dd = store_with_particles(&[2]);
        let mut list = FixedPairList::new();
        // canonical member is the lower id, which is not stored here
        assert!(!list.iadd(&dd, [1, 2]).unwrap());
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn missing_partner_is_fatal() {
        let dd = store_with_particles(&[1]);
        let mut list = FixedPairList::new();
        assert!(matches!(
            list.iadd(&dd, [1, 9]),
            Err(Error::MissingMember { pid: 9, .. })
        ));
    }

    #[test]
    fn collective_add_aggregates_errors() {
        let dd = store_with_particles(&[1]);
        let comm = LocalCollective::single();
        let mut list = FixedPairList::new();
        assert!(matches!(
            list.add(&dd, &comm, [1, 9]),
            Err(Error::Comm(CommError::Aggregated(_)))
        ));
        assert!(list.add(&dd, &comm, [9, 10]).is_ok());
    }

    #[test]
    fn reverse_order_duplicates_are_rejected() {
        let dd = store_with_particles(&[1, 2, 3, 4]);
        let mut quads = FixedQuadrupleList::new();
        assert!(quads.iadd(&dd, [1, 2, 3, 4]).unwrap());
        assert!(!quads.iadd(&dd, [4, 3, 2, 1]).unwrap());
        assert_eq!(quads.size(), 1);

        let mut triples = FixedTripleList::new();
        assert!(triples.iadd(&dd, [1, 2, 3]).unwrap());
        assert!(!triples.iadd(&dd, [3, 2, 1]).unwrap());
        assert_eq!(triples.size(), 1);
    }

    #[test]
    fn remove_matches_both_orientations() {
        let dd = store_with_particles(&[1, 2, 3]);
        let mut triples = FixedTripleList::new();
        triples.iadd(&dd, [1, 2, 3]).unwrap();
        assert!(triples.remove([3, 2, 1], false));
        assert_eq!(triples.size(), 0);
        assert!(!triples.remove([1, 2, 3], false));
    }

    #[test]
    fn remove_by_bond_checks_adjacent_members_only() {
        let dd = store_with_particles(&[1, 2, 3, 4]);
        let mut quads = FixedQuadrupleList::new();
        quads.iadd(&dd, [1, 2, 3, 4]).unwrap();
        // non-adjacent combination leaves the dihedral alone
        assert!(!quads.remove_by_bond(1, 3));
        assert_eq!(quads.size(), 1);
        assert!(quads.remove_by_bond(3, 2));
        assert_eq!(quads.size(), 0);

        quads.iadd(&dd, [1, 2, 3, 4]).unwrap();
        assert!(quads.remove_by_bond(3, 4));
        assert_eq!(quads.size(), 0);
    }

    #[test]
    fn remove_by_canonical_drops_all_owned_tuples() {
        let dd = store_with_particles(&[1, 2, 3]);
        let mut list = FixedPairList::new();
        let (tx, rx) = unbounded();
        list.subscribe(tx);
        list.iadd(&dd, [1, 2]).unwrap();
        list.iadd(&dd, [1, 3]).unwrap();
        list.iadd(&dd, [2, 3]).unwrap();
        while rx.try_recv().is_ok() {}

        assert_eq!(list.remove_by_canonical(1, false), 2);
        assert_eq!(list.size(), 1);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(list.remove_by_canonical(9, false), 0);
    }

    #[test]
    fn migration_stream_round_trips() {
        let dd = store_with_particles(&[1, 2, 3]);
        let mut list = FixedPairList::new();
        list.iadd(&dd, [1, 2]).unwrap();
        list.iadd(&dd, [1, 3]).unwrap();
        list.iadd(&dd, [2, 3]).unwrap();

        let departing = vec![dd.lookup_real(1).unwrap().clone()];
        let mut out = OutBuffer::new();
        list.before_send(&departing, &mut out);
        // the two tuples keyed by particle 1 travel with it
        assert_eq!(list.size(), 1);

        let mut receiver = FixedPairList::new();
        let mut buf = InBuffer::new(out.into_bytes());
        receiver.after_recv(&departing, &mut buf).unwrap();
        assert_eq!(receiver.size(), 2);
        assert_eq!(receiver.snapshot(), vec![[1, 2], [1, 3]]);
        assert_eq!(list.size() + receiver.size(), 3);
    }

    #[test]
    fn wire_stream_is_owner_count_partners() {
        let dd = store_with_particles(&[1, 2, 3]);
        let mut list = FixedPairList::new();
        list.iadd(&dd, [1, 2]).unwrap();
        list.iadd(&dd, [1, 3]).unwrap();

        let departing = vec![dd.lookup_real(1).unwrap().clone()];
        let mut out = OutBuffer::new();
        list.before_send(&departing, &mut out);
        let mut buf = InBuffer::new(out.into_bytes());
        let ints = buf.read_i64s().unwrap();
        assert_eq!(ints, vec![1, 2, 2, 3]);
    }

    #[test]
    fn lambda_weights_update_without_events() {
        let dd = store_with_particles(&[1, 2]);
        let mut list = FixedPairLambdaList::with_payload(1.0);
        let (tx, rx) = unbounded();
        list.subscribe(tx);
        list.iadd(&dd, [1, 2]).unwrap();
        let _ = rx.try_recv();

        assert_eq!(list.lambda([1, 2]), Some(1.0));
        assert!(list.set_lambda([2, 1], 0.25));
        assert_eq!(list.lambda([1, 2]), Some(0.25));
        assert!(rx.try_recv().is_err());
        assert!(!list.set_lambda([1, 9], 0.5));
    }

    #[test]
    fn update_local_resolves_live_particles() {
        let mut dd = store_with_particles(&[1, 2]);
        let mut list = FixedPairList::new();
        list.iadd(&dd, [1, 2]).unwrap();
        dd.decompose(&mut []).unwrap();
        list.update_local(&dd).unwrap();
        let resolved: Vec<[Pid; 2]> = list.resolve(&dd).map(|[a, b]| [a.id, b.id]).collect();
        assert_eq!(resolved, vec![[1, 2]]);
    }

    #[test]
    fn update_local_reports_missing_members() {
        let dd = store_with_particles(&[1, 2]);
        let empty = store_with_particles(&[]);
        let mut list = FixedPairList::new();
        list.iadd(&dd, [1, 2]).unwrap();
        assert!(list.update_local(&empty).is_err());
    }
}
