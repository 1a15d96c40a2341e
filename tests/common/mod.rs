//! Shared test support: a direct O(N^2) reference simulation used as the
//! oracle for the multipole engine, with the same force law, softening, and
//! integration convention.

use treecode::{Particle, Vec3};

pub struct NaiveSimulation {
    pub particles: Vec<Particle<f64>>,
    pub force_constant: f64,
    pub time_step: f64,
    pub softening: f64,
    pub time: f64,
}

impl NaiveSimulation {
    pub fn new(
        particles: Vec<Particle<f64>>,
        force_constant: f64,
        time_step: f64,
        softening: f64,
    ) -> Self {
        Self {
            particles,
            force_constant,
            time_step,
            softening,
            time: 0.0,
        }
    }

    /// Pairwise softened forces on every particle, summed directly.
    pub fn forces(&self) -> Vec<Vec3<f64>> {
        let mut forces = vec![Vec3::zero(); self.particles.len()];
        let softening2 = self.softening * self.softening;
        for i in 1..self.particles.len() {
            for j in 0..i {
                let delta = self.particles[j].position - self.particles[i].position;
                let r2 = delta.magnitude_squared() + softening2;
                let inv = 1.0 / (r2 * r2.sqrt());
                let scale =
                    self.force_constant * self.particles[i].charge * self.particles[j].charge * inv;
                forces[i] += delta * scale;
                forces[j] -= delta * scale;
            }
        }
        forces
    }

    /// One step with the engine's convention: kick the velocity, drift the
    /// position with the pre-kick velocity.
    pub fn step(&mut self) -> f64 {
        let forces = self.forces();
        for (particle, force) in self.particles.iter_mut().zip(forces) {
            let old_velocity = particle.velocity;
            particle.velocity += force * (self.time_step / particle.mass);
            particle.position += old_velocity * self.time_step;
        }
        self.time += self.time_step;
        self.time
    }
}

/// Kinetic plus pairwise potential energy for the `F = k q_i q_j d / r^3`
/// force law (potential `-k q_i q_j / r`), without softening.
pub fn total_energy(particles: &[Particle<f64>], force_constant: f64) -> f64 {
    let mut energy = 0.0;
    for particle in particles {
        energy += 0.5 * particle.mass * particle.velocity.magnitude_squared();
    }
    for i in 1..particles.len() {
        for j in 0..i {
            let r = (particles[i].position - particles[j].position).magnitude();
            energy -= force_constant * particles[i].charge * particles[j].charge / r;
        }
    }
    energy
}
