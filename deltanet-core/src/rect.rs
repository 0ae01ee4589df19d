// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hyperrectangle algebra.
//!
//! An equivalence class of packet headers is represented as an
//! axis-aligned product of half-open integer intervals. The bounds are
//! stored flat: `[lo0, hi0, lo1, hi1, ...]`. Equality and ordering
//! consider only the bounds; the alpha index identifies which class
//! currently owns the region and is ignored by comparison so that a
//! freshly computed overlap can be compared against stored classes.

use core::cmp::Ordering;
use core::fmt::{self, Display};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HyperRectangle {
    bounds: Vec<u64>,
    alpha: usize,
}

impl PartialEq for HyperRectangle {
    fn eq(&self, other: &Self) -> bool {
        self.bounds == other.bounds
    }
}

impl Eq for HyperRectangle {}

impl PartialOrd for HyperRectangle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HyperRectangle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bounds.cmp(&other.bounds)
    }
}

impl HyperRectangle {
    /// Create a rectangle from flat bounds `[lo0, hi0, lo1, hi1, ...]`.
    /// Every interval must be non-empty.
    pub fn new(bounds: Vec<u64>) -> Self {
        assert!(bounds.len() % 2 == 0);
        for d in 0..bounds.len() / 2 {
            assert!(bounds[2 * d] < bounds[2 * d + 1]);
        }
        Self { bounds, alpha: 0 }
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: usize) {
        self.alpha = alpha;
    }

    pub fn bounds(&self) -> &[u64] {
        &self.bounds
    }

    pub fn set_bounds(&mut self, bounds: Vec<u64>) {
        assert!(bounds.len() == self.bounds.len());
        self.bounds = bounds;
    }

    /// Number of axes.
    pub fn dims(&self) -> usize {
        self.bounds.len() / 2
    }

    pub fn lo(&self, axis: usize) -> u64 {
        self.bounds[2 * axis]
    }

    pub fn hi(&self, axis: usize) -> u64 {
        self.bounds[2 * axis + 1]
    }

    /// The midpoint of this rectangle's interval on `axis`, used as a
    /// splitting key by the spatial index.
    pub fn mid(&self, axis: usize) -> u64 {
        self.lo(axis) + (self.hi(axis) - self.lo(axis)) / 2
    }

    /// Does `other` lie entirely inside this rectangle?
    pub fn contains(&self, other: &Self) -> bool {
        (0..self.dims())
            .all(|d| self.lo(d) <= other.lo(d) && other.hi(d) <= self.hi(d))
    }

    /// Do the rectangles share any point? Equivalent to
    /// `overlap(..).is_some()` without building the intersection.
    pub fn intersects(&self, other: &Self) -> bool {
        (0..self.dims())
            .all(|d| self.lo(d) < other.hi(d) && other.lo(d) < self.hi(d))
    }

    /// The componentwise intersection, or `None` when the rectangles
    /// are disjoint.
    pub fn overlap(&self, other: &Self) -> Option<Self> {
        let mut bounds = Vec::with_capacity(self.bounds.len());
        for d in 0..self.dims() {
            let lo = self.lo(d).max(other.lo(d));
            let hi = self.hi(d).min(other.hi(d));
            if lo >= hi {
                return None;
            }
            bounds.push(lo);
            bounds.push(hi);
        }
        Some(Self { bounds, alpha: 0 })
    }

    /// Partition this rectangle around `other`, which the caller must
    /// guarantee is contained in it. Peels off the region below
    /// `other` and the region above it on each axis in turn, then the
    /// clipped core, so the result is up to `2k` disjoint side slabs
    /// plus one rectangle equal to `other`. Returns `None` when
    /// `other` covers this rectangle entirely and there is nothing to
    /// peel.
    pub fn subtract(&self, other: &Self) -> Option<Vec<Self>> {
        debug_assert!(self.contains(other));

        if self == other {
            return None;
        }

        let mut parts = Vec::new();
        let mut cur = self.bounds.clone();
        for d in 0..self.dims() {
            if cur[2 * d] < other.lo(d) {
                let mut below = cur.clone();
                below[2 * d + 1] = other.lo(d);
                parts.push(Self { bounds: below, alpha: 0 });
                cur[2 * d] = other.lo(d);
            }
            if other.hi(d) < cur[2 * d + 1] {
                let mut above = cur.clone();
                above[2 * d] = other.hi(d);
                parts.push(Self { bounds: above, alpha: 0 });
                cur[2 * d + 1] = other.hi(d);
            }
        }

        // What remains is the core, equal to `other` by construction.
        parts.push(Self { bounds: cur, alpha: 0 });
        Some(parts)
    }

    /// The number of headers inside the rectangle. The product of all
    /// axis lengths does not fit any fixed-width integer once every
    /// packet field is modelled, hence the big integer.
    pub fn volume(&self) -> BigUint {
        let mut vol = BigUint::from(1u8);
        for d in 0..self.dims() {
            vol *= BigUint::from(self.hi(d) - self.lo(d));
        }
        vol
    }
}

impl Display for HyperRectangle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a{}:", self.alpha)?;
        for d in 0..self.dims() {
            if d > 0 {
                write!(f, "x")?;
            }
            write!(f, "[{},{})", self.lo(d), self.hi(d))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use num_bigint::BigUint;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rect(bounds: &[u64]) -> HyperRectangle {
        HyperRectangle::new(bounds.to_vec())
    }

    #[test]
    fn overlap_basic() {
        let a = rect(&[0, 10, 0, 10]);
        let b = rect(&[5, 15, 2, 8]);
        assert_eq!(a.overlap(&b), Some(rect(&[5, 10, 2, 8])));

        let c = rect(&[10, 20, 0, 10]);
        assert_eq!(a.overlap(&c), None);
    }

    #[test]
    fn overlap_alpha_ignored() {
        let mut a = rect(&[0, 10]);
        let b = rect(&[0, 10]);
        a.set_alpha(7);
        assert_eq!(a, b);
    }

    #[test]
    fn subtract_full_cover() {
        let a = rect(&[0, 10, 0, 10]);
        assert_eq!(a.subtract(&a.clone()), None);
    }

    #[test]
    fn subtract_core_and_slabs() {
        let a = rect(&[0, 10, 0, 10]);
        let o = rect(&[2, 4, 3, 9]);
        let parts = a.subtract(&o).unwrap();
        // 2 slabs per axis plus the core.
        assert_eq!(parts.len(), 5);
        assert_eq!(*parts.last().unwrap(), o);

        // The slabs are disjoint from the core...
        for p in &parts[..parts.len() - 1] {
            assert_eq!(p.overlap(&o), None);
        }
        // ...and the volumes add back up.
        let total: BigUint = parts.iter().map(|p| p.volume()).sum();
        assert_eq!(total, a.volume());
    }

    #[test]
    fn subtract_shared_face() {
        let a = rect(&[0, 10]);
        let o = rect(&[0, 4]);
        let parts = a.subtract(&o).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], rect(&[4, 10]));
        assert_eq!(parts[1], o);
    }

    #[test]
    fn volume_product() {
        let a = rect(&[0, 1 << 32, 0, 1 << 16]);
        assert_eq!(a.volume(), BigUint::from(1u128 << 48));
    }

    // Random sweep of the subtraction identities: parts are pairwise
    // disjoint, exactly one part equals the overlap, and volumes sum
    // to the whole.
    #[test]
    fn subtract_properties() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let dims = rng.gen_range(1..4);
            let mut ab = Vec::new();
            let mut ob = Vec::new();
            for _ in 0..dims {
                let lo = rng.gen_range(0..50u64);
                let hi = rng.gen_range(lo + 2..lo + 40);
                let olo = rng.gen_range(lo..hi - 1);
                let ohi = rng.gen_range(olo + 1..=hi);
                ab.extend([lo, hi]);
                ob.extend([olo, ohi]);
            }
            let a = rect(&ab);
            let o = rect(&ob);

            let parts = match a.subtract(&o) {
                None => {
                    assert_eq!(a, o);
                    continue;
                }
                Some(parts) => parts,
            };

            let total: BigUint = parts.iter().map(|p| p.volume()).sum();
            assert_eq!(total, a.volume());
            assert_eq!(
                parts.iter().filter(|p| **p == o).count(),
                1,
                "exactly one part is the overlap"
            );
            for (i, p) in parts.iter().enumerate() {
                for q in &parts[i + 1..] {
                    assert_eq!(p.overlap(q), None);
                }
            }
        }
    }
}
