use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::fatal;

/// Element ids pack a collection's linear index into this many low bits.
pub(crate) const ELEMENT_BITS: u32 = 40;

/// A dense index of one to three dimensions. The same type doubles as the
/// bounds of a collection, in which case each coordinate is an extent.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Archive, Serialize, Deserialize,
)]
#[archive(check_bytes)]
pub struct Index {
    dims: u8,
    coords: [u64; 3],
}

impl Index {
    pub fn d1(i: u64) -> Self {
        Self { dims: 1, coords: [i, 0, 0] }
    }

    pub fn d2(i: u64, j: u64) -> Self {
        Self { dims: 2, coords: [i, j, 0] }
    }

    pub fn d3(i: u64, j: u64, k: u64) -> Self {
        Self { dims: 3, coords: [i, j, k] }
    }

    /// Builds an index from a coordinate slice of length 1 to 3.
    pub fn from_coords(coords: &[u64]) -> Option<Self> {
        if coords.is_empty() || coords.len() > 3 {
            return None;
        }
        let mut index = Self {
            dims: coords.len() as u8,
            coords: [0; 3],
        };
        index.coords[..coords.len()].copy_from_slice(coords);
        Some(index)
    }

    pub fn dims(&self) -> usize {
        self.dims as usize
    }

    pub fn coords(&self) -> &[u64] {
        &self.coords[..self.dims()]
    }

    pub fn get(&self, dim: usize) -> u64 {
        self.coords()[dim]
    }

    /// Number of indices inside these bounds.
    pub fn volume(&self) -> u64 {
        self.coords().iter().product()
    }

    pub fn contains(&self, index: &Index) -> bool {
        index.dims == self.dims
            && index.coords().iter().zip(self.coords()).all(|(i, n)| i < n)
    }

    /// Row-major position of `self` inside `bounds`.
    pub fn linearize(&self, bounds: &Index) -> u64 {
        if self.dims != bounds.dims {
            fatal!(
                "index {} has {} dimensions but bounds {} have {}",
                self,
                self.dims,
                bounds,
                bounds.dims
            );
        }
        self.coords()
            .iter()
            .zip(bounds.coords())
            .fold(0, |acc, (i, n)| acc * n + i)
    }

    pub fn delinearize(mut linear: u64, bounds: &Index) -> Index {
        let mut index = Index {
            dims: bounds.dims,
            coords: [0; 3],
        };
        for dim in (0..bounds.dims()).rev() {
            let extent = bounds.coords[dim];
            index.coords[dim] = linear % extent;
            linear /= extent;
        }
        index
    }

    /// Every index inside these bounds in row-major order.
    pub fn iter_bounds(&self) -> impl Iterator<Item = Index> + '_ {
        (0..self.volume()).map(move |linear| Index::delinearize(linear, self))
    }

    /// Aborts on bounds that cannot hold any element.
    pub(crate) fn check_bounds(&self) {
        let volume = self
            .coords()
            .iter()
            .try_fold(1u64, |acc, n| acc.checked_mul(*n));
        match volume {
            Some(0) => fatal!("collection bounds {} have a zero extent", self),
            Some(volume) if volume < 1 << ELEMENT_BITS => {}
            _ => fatal!("collection bounds {} hold 2^{} elements or more", self, ELEMENT_BITS),
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (n, coord) in self.coords().iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", coord)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Contiguous blocks of the row-major order, one block per node.
pub fn block_map(index: &Index, bounds: &Index, num_nodes: u32) -> u32 {
    let total = bounds.volume();
    let per_node = (total + num_nodes as u64 - 1) / num_nodes as u64;
    (index.linearize(bounds) / per_node.max(1)) as u32
}

/// Round-robin placement over the row-major order.
pub fn round_robin_map(index: &Index, bounds: &Index, num_nodes: u32) -> u32 {
    (index.linearize(bounds) % num_nodes as u64) as u32
}

/// Splits the first dimension evenly over the nodes. The extent must be a
/// multiple of the node count.
pub fn even_rows_map(index: &Index, bounds: &Index, num_nodes: u32) -> u32 {
    let rows = bounds.get(0);
    if rows % num_nodes as u64 != 0 {
        fatal!(
            "even row mapping needs {} rows to divide over {} nodes",
            rows,
            num_nodes
        );
    }
    (index.get(0) / (rows / num_nodes as u64)) as u32
}
