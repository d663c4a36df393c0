//! Conditional particle property overrides.

use crate::model::{Particle, TypeId};

/// A property-change rule applied to particles selected by the topology
/// manager (directly, or at a registered graph distance from a root).
///
/// Unset fields leave the particle untouched. When a state window is
/// present the rule only applies to particles whose `state` lies in
/// `[min, max)`. `speed` and `force_norm` rescale the velocity and force
/// vectors to the given magnitude, preserving direction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParticleUpdate {
    pub type_id: Option<TypeId>,
    pub mass: Option<f64>,
    pub q: Option<f64>,
    pub state: Option<i64>,
    pub incr_state: Option<i64>,
    pub res_id: Option<i64>,
    pub lambda: Option<f64>,
    pub speed: Option<f64>,
    pub force_norm: Option<f64>,
    pub state_window: Option<(i64, i64)>,
}

impl ParticleUpdate {
    /// Whether the rule is applicable to this particle's current state.
    pub fn matches(&self, particle: &Particle) -> bool {
        match self.state_window {
            Some((min, max)) => particle.state >= min && particle.state < max,
            None => true,
        }
    }

    fn has_changes(&self) -> bool {
        self.type_id.is_some()
            || self.mass.is_some()
            || self.q.is_some()
            || self.state.is_some()
            || self.incr_state.is_some()
            || self.res_id.is_some()
            || self.lambda.is_some()
            || self.speed.is_some()
            || self.force_norm.is_some()
    }

    /// Applies the rule if it matches; returns whether anything changed.
    pub fn apply(&self, particle: &mut Particle) -> bool {
        if !self.has_changes() || !self.matches(particle) {
            return false;
        }
        if let Some(t) = self.type_id {
            particle.type_id = t;
        }
        if let Some(m) = self.mass {
            particle.mass = m;
        }
        if let Some(q) = self.q {
            particle.q = q;
        }
        if let Some(s) = self.state {
            particle.state = s;
        }
        if let Some(i) = self.incr_state {
            particle.state += i;
        }
        if let Some(r) = self.res_id {
            particle.res_id = r;
        }
        if let Some(l) = self.lambda {
            particle.lambda = l;
        }
        if let Some(v) = self.speed {
            rescale(&mut particle.velocity, v);
        }
        if let Some(f) = self.force_norm {
            rescale(&mut particle.force, f);
        }
        true
    }
}

fn rescale(vector: &mut [f64; 3], magnitude: f64) {
    let norm = (vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2]).sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v *= magnitude / norm;
        }
    }
}
