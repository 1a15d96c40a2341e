//! Multipole moments stored at tree nodes.
//!
//! A leaf carries only its charge (the monopole). A node aggregates the
//! charges of every leaf below it into a truncated multipole expansion about
//! the node's geometric center: monopole, dipole, and the raw second-moment
//! quadrupole. Raw moments shift cleanly between expansion centers, which is
//! what makes the bottom-up aggregation associative.

use crate::vector::{Scalar, Vec3};

/// Truncated multipole expansion of a cell's charge distribution.
///
/// `quad_trace` holds the diagonal `(Q_xx, Q_yy, Q_zz)` and `quad_cross` the
/// off-diagonal `(Q_yz, Q_xz, Q_xy)` of the symmetric raw second moment
/// `Q_ij = sum q * d_i * d_j`, with `d` the source offset from the expansion
/// center.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeMoment<S: Scalar> {
    pub charge: S,
    pub dipole: Vec3<S>,
    pub quad_cross: Vec3<S>,
    pub quad_trace: Vec3<S>,
}

impl<S: Scalar> NodeMoment<S> {
    pub fn zero() -> Self {
        Self {
            charge: S::zero(),
            dipole: Vec3::zero(),
            quad_cross: Vec3::zero(),
            quad_trace: Vec3::zero(),
        }
    }

    /// The moment of a single point charge at `offset` from the expansion
    /// center.
    pub fn from_point_charge(charge: S, offset: Vec3<S>) -> Self {
        let [x, y, z] = offset.0;
        Self {
            charge,
            dipole: offset * charge,
            quad_cross: Vec3::new(charge * y * z, charge * x * z, charge * x * y),
            quad_trace: Vec3::new(charge * x * x, charge * y * y, charge * z * z),
        }
    }

    /// Re-expands this moment about a center displaced by `-delta`, i.e.
    /// `delta` is the old center's offset from the new one. Shifting and
    /// summing commute, so children can be folded into a parent in any order.
    pub fn translated(&self, delta: Vec3<S>) -> Self {
        let two = S::from_f64(2.0);
        let [dx, dy, dz] = delta.0;
        let [px, py, pz] = self.dipole.0;
        Self {
            charge: self.charge,
            dipole: self.dipole + delta * self.charge,
            quad_cross: self.quad_cross
                + Vec3::new(
                    dy * pz + dz * py + self.charge * dy * dz,
                    dx * pz + dz * px + self.charge * dx * dz,
                    dx * py + dy * px + self.charge * dx * dy,
                ),
            quad_trace: self.quad_trace
                + Vec3::new(
                    two * dx * px + self.charge * dx * dx,
                    two * dy * py + self.charge * dy * dy,
                    two * dz * pz + self.charge * dz * dz,
                ),
        }
    }

    pub fn accumulate(&mut self, other: Self) {
        self.charge += other.charge;
        self.dipole += other.dipole;
        self.quad_cross += other.quad_cross;
        self.quad_trace += other.quad_trace;
    }

    /// Evaluates the field of this expansion at a point, given `r` = the
    /// vector from the evaluation point to the expansion center. The result
    /// follows the same convention as the direct sum: the field of a positive
    /// charge points toward it.
    pub fn field_at(&self, r: Vec3<S>) -> Vec3<S> {
        let r2 = r.magnitude_squared();
        let rl = r2.sqrt();
        let inv_r3 = S::one() / (r2 * rl);
        let inv_r5 = inv_r3 / r2;
        let inv_r7 = inv_r5 / r2;

        // Monopole.
        let mut field = r * (self.charge * inv_r3);

        // Dipole: d / r^3 - 3 (d . r) r / r^5.
        let three = S::from_f64(3.0);
        field += self.dipole * inv_r3 - r * (three * self.dipole.dot(r) * inv_r5);

        // Quadrupole, using the symmetric raw second moment.
        let [rx, ry, rz] = r.0;
        let [cyz, cxz, cxy] = self.quad_cross.0;
        let [txx, tyy, tzz] = self.quad_trace.0;
        let qr = Vec3::new(
            txx * rx + cxy * ry + cxz * rz,
            cxy * rx + tyy * ry + cyz * rz,
            cxz * rx + cyz * ry + tzz * rz,
        );
        let trace = txx + tyy + tzz;
        let r_q_r = qr.dot(r);
        let half = S::from_f64(0.5);
        field += qr * (-three * inv_r5);
        field += r * (-three * half * trace * inv_r5);
        field += r * (S::from_f64(7.5) * r_q_r * inv_r7);

        field
    }
}

impl<S: Scalar> Default for NodeMoment<S> {
    fn default() -> Self {
        Self::zero()
    }
}
