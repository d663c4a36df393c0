//! Multi-rank topology synchronization tests: replicated graphs must be
//! identical on every rank after each exchange, whatever the rank-local
//! edit pattern was.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;

use domdec::{
    Collective, DomainDecomposition, FixedPairList, FixedTripleList, LocalCollective, Particle,
    Pid, SystemConfig, TopologyManager,
};

fn with_ranks<T: Send>(n: usize, f: impl Fn(Rc<dyn Collective>) -> T + Sync) -> Vec<T> {
    let endpoints = LocalCollective::ring(n);
    thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                scope.spawn(move || {
                    let comm: Rc<dyn Collective> = Rc::new(endpoint);
                    f(comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn two_rank_config() -> SystemConfig {
    SystemConfig {
        box_l: [8.0, 4.0, 4.0],
        node_grid: [2, 1, 1],
        cell_grid: [2, 2, 2],
    }
}

/// Four particles forming a chain across the rank boundary, one residue
/// per bonded pair.
fn chain_store(comm: &Rc<dyn Collective>) -> DomainDecomposition {
    let config = two_rank_config();
    let mut dd = DomainDecomposition::new(&config, Rc::clone(comm)).unwrap();
    let particles = [
        (1, [3.0, 1.0, 1.0], 1),
        (2, [3.5, 1.0, 1.0], 1),
        (3, [4.5, 1.0, 1.0], 2),
        (4, [5.0, 1.0, 1.0], 2),
    ];
    for (pid, position, res_id) in particles {
        let mine = {
            let grid = dd.node_grid();
            position[0] >= grid.my_left(0) && position[0] < grid.my_right(0)
        };
        if mine {
            let mut p = Particle::new(pid, position);
            p.res_id = res_id;
            dd.add_particle(p).unwrap();
        }
    }
    dd.decompose(&mut []).unwrap();
    dd
}

#[test]
fn replicated_graphs_match_across_ranks() {
    let results = with_ranks(2, |comm| {
        let mut dd = chain_store(&comm);
        let bonds = Rc::new(RefCell::new(FixedPairList::new()));
        let mut topo = TopologyManager::new(Rc::clone(&comm));
        topo.observe(&bonds);
        topo.register_tuple(&bonds, 0, 0);

        for pair in [[1, 2], [2, 3], [3, 4]] {
            bonds.borrow_mut().add(&dd, comm.as_ref(), pair).unwrap();
        }
        topo.initialize(&dd).unwrap();
        topo.exchange_data(&mut dd).unwrap();

        assert!(topo.is_same_molecule(1, 4));
        assert!(topo.is_residues_connected(2, 3));
        (topo.graph_snapshot(), topo.residue_graph_snapshot())
    });

    assert_eq!(results[0], results[1]);
    let (graph, res_graph) = &results[0];
    assert_eq!(
        *graph,
        vec![
            (1, vec![2]),
            (2, vec![1, 3]),
            (3, vec![2, 4]),
            (4, vec![3]),
        ]
    );
    assert_eq!(*res_graph, vec![(1, vec![2]), (2, vec![1])]);
}

#[test]
fn insertion_order_does_not_change_the_replicated_graph() {
    let run = |order: Vec<[Pid; 2]>| {
        with_ranks(2, move |comm| {
            let mut dd = chain_store(&comm);
            let bonds = Rc::new(RefCell::new(FixedPairList::new()));
            let mut topo = TopologyManager::new(Rc::clone(&comm));
            topo.observe(&bonds);
            topo.register_tuple(&bonds, 0, 0);
            for pair in &order {
                bonds.borrow_mut().add(&dd, comm.as_ref(), *pair).unwrap();
            }
            topo.initialize(&dd).unwrap();
            topo.exchange_data(&mut dd).unwrap();
            topo.graph_snapshot()
        })
    };

    let forward = run(vec![[1, 2], [2, 3], [3, 4]]);
    let permuted = run(vec![[3, 4], [1, 2], [2, 3]]);
    assert_eq!(forward[0], forward[1]);
    assert_eq!(permuted[0], permuted[1]);
    assert_eq!(forward[0], permuted[0]);
}

#[test]
fn regenerated_angles_are_distributed_by_canonical_owner() {
    let results = with_ranks(2, |comm| {
        let mut dd = chain_store(&comm);
        let bonds = Rc::new(RefCell::new(FixedPairList::new()));
        let angles = Rc::new(RefCell::new(FixedTripleList::new()));
        let mut topo = TopologyManager::new(Rc::clone(&comm));
        topo.observe(&bonds);
        topo.register_tuple(&bonds, 0, 0);
        topo.register_triple(&angles, 0, 0, 0);

        for pair in [[1, 2], [3, 4]] {
            bonds.borrow_mut().add(&dd, comm.as_ref(), pair).unwrap();
        }
        topo.initialize(&dd).unwrap();
        topo.exchange_data(&mut dd).unwrap();

        // closing the chain creates angles owned by their middle member
        bonds.borrow_mut().add(&dd, comm.as_ref(), [2, 3]).unwrap();
        topo.exchange_data(&mut dd).unwrap();

        assert_eq!(angles.borrow().total_size(comm.as_ref()).unwrap(), 2);
        let snapshot = angles.borrow().snapshot();
        snapshot
    });

    // middle member 2 lives on rank 0, middle member 3 on rank 1
    assert_eq!(results[0], vec![[1, 2, 3]]);
    assert_eq!(results[1], vec![[2, 3, 4]]);
}

#[test]
fn bond_removal_scrubs_derived_tuples_on_every_rank() {
    with_ranks(2, |comm| {
        let mut dd = chain_store(&comm);
        let bonds = Rc::new(RefCell::new(FixedPairList::new()));
        let angles = Rc::new(RefCell::new(FixedTripleList::new()));
        let mut topo = TopologyManager::new(Rc::clone(&comm));
        topo.observe(&bonds);
        topo.register_tuple(&bonds, 0, 0);
        topo.register_triple(&angles, 0, 0, 0);

        for pair in [[1, 2], [3, 4]] {
            bonds.borrow_mut().add(&dd, comm.as_ref(), pair).unwrap();
        }
        topo.initialize(&dd).unwrap();
        topo.exchange_data(&mut dd).unwrap();
        bonds.borrow_mut().add(&dd, comm.as_ref(), [2, 3]).unwrap();
        topo.exchange_data(&mut dd).unwrap();
        assert_eq!(angles.borrow().total_size(comm.as_ref()).unwrap(), 2);
        assert!(topo.is_same_molecule(1, 4));

        // the rank owning the bond record removes it; everyone agrees
        // afterwards
        if comm.rank() == 0 {
            assert!(bonds.borrow_mut().remove([2, 3], false));
        }
        topo.exchange_data(&mut dd).unwrap();

        assert_eq!(angles.borrow().total_size(comm.as_ref()).unwrap(), 0);
        assert!(!topo.is_particle_connected(2, 3));
        assert!(!topo.is_same_molecule(1, 4));
        assert!(topo.is_same_molecule(1, 2));
        assert!(topo.is_same_molecule(3, 4));
    });
}

#[test]
fn molecule_split_is_identical_on_every_rank() {
    let results = with_ranks(2, |comm| {
        let mut dd = chain_store(&comm);
        let bonds = Rc::new(RefCell::new(FixedPairList::new()));
        let mut topo = TopologyManager::new(Rc::clone(&comm));
        topo.observe(&bonds);
        topo.register_tuple(&bonds, 0, 0);

        for pair in [[1, 2], [2, 3], [3, 4]] {
            bonds.borrow_mut().add(&dd, comm.as_ref(), pair).unwrap();
        }
        topo.initialize(&dd).unwrap();
        topo.exchange_data(&mut dd).unwrap();

        if comm.rank() == 0 {
            assert!(bonds.borrow_mut().remove([2, 3], false));
        }
        topo.exchange_data(&mut dd).unwrap();

        (
            topo.molecule_of(1),
            topo.molecule_of(2),
            topo.molecule_of(3),
            topo.molecule_of(4),
            topo.molecule_ids(),
        )
    });

    assert_eq!(results[0], results[1]);
    let (m1, m2, m3, m4, ids) = &results[0];
    assert_eq!(m1, m2);
    assert_eq!(m3, m4);
    assert_ne!(m1, m3);
    assert_eq!(ids.len(), 2);
}
