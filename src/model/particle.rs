/// Process-wide stable particle identifier.
pub type Pid = i64;

/// Particle type identifier used to key bonded-list registrations.
pub type TypeId = i64;

/// A single particle record.
///
/// A particle is owned by exactly one rank as a *real* particle; ranks
/// bordering its cell may additionally hold read-only *ghost* replicas,
/// distinguished by the [`ghost`](Particle::ghost) flag. Ghost copies are
/// never mutated locally except when ghost forces are reduced back onto
/// the owning real particle.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub id: Pid,
    pub type_id: TypeId,
    pub mass: f64,
    pub q: f64,
    pub lambda: f64,
    pub state: i64,
    pub res_id: i64,
    pub position: [f64; 3],
    /// Periodic image counts accumulated by coordinate folding.
    pub image: [i64; 3],
    pub velocity: [f64; 3],
    pub force: [f64; 3],
    pub ghost: bool,
}

impl Particle {
    pub fn new(id: Pid, position: [f64; 3]) -> Self {
        Self {
            id,
            type_id: 0,
            mass: 1.0,
            q: 0.0,
            lambda: 0.0,
            state: 0,
            res_id: 0,
            position,
            image: [0; 3],
            velocity: [0.0; 3],
            force: [0.0; 3],
            ghost: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_particle_defaults() {
        let p = Particle::new(7, [1.0, 2.0, 3.0]);
        assert_eq!(p.id, 7);
        assert_eq!(p.mass, 1.0);
        assert_eq!(p.position, [1.0, 2.0, 3.0]);
        assert_eq!(p.image, [0; 3]);
        assert!(!p.ghost);
    }
}
