//! k-ary spanning trees over `n` positions, rotated so that any position can
//! be the root. Position `p` sits at rank `(p - root) mod n`; the children of
//! rank `r` are ranks `r*k+1 ..= r*k+k`.

use crate::NodeId;

fn rank(root: usize, pos: usize, n: usize) -> usize {
    (pos + n - root) % n
}

fn unrank(root: usize, rank: usize, n: usize) -> usize {
    (rank + root) % n
}

pub fn parent(root: usize, pos: usize, n: usize, arity: usize) -> Option<usize> {
    match rank(root, pos, n) {
        0 => None,
        r => Some(unrank(root, (r - 1) / arity, n)),
    }
}

pub fn children(root: usize, pos: usize, n: usize, arity: usize) -> Vec<usize> {
    let r = rank(root, pos, n);
    (1..=arity)
        .map(|c| r * arity + c)
        .take_while(|&c| c < n)
        .map(|c| unrank(root, c, n))
        .collect()
}

/// Every position below `pos`, excluding `pos` itself.
pub fn subtree(root: usize, pos: usize, n: usize, arity: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut frontier = children(root, pos, n, arity);
    while let Some(next) = frontier.pop() {
        frontier.extend(children(root, next, n, arity));
        out.push(next);
    }
    out.sort_unstable();
    out
}

/// Convenience wrappers over the ranks of the whole run.
pub fn node_parent(root: NodeId, node: NodeId, n: NodeId, arity: usize) -> Option<NodeId> {
    parent(root as usize, node as usize, n as usize, arity).map(|p| p as NodeId)
}

pub fn node_children(root: NodeId, node: NodeId, n: NodeId, arity: usize) -> Vec<NodeId> {
    children(root as usize, node as usize, n as usize, arity)
        .into_iter()
        .map(|c| c as NodeId)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_tree_rooted_at_zero() {
        assert_eq!(children(0, 0, 7, 2), vec![1, 2]);
        assert_eq!(children(0, 2, 7, 2), vec![5, 6]);
        assert_eq!(children(0, 3, 7, 2), Vec::<usize>::new());
        assert_eq!(parent(0, 6, 7, 2), Some(2));
        assert_eq!(parent(0, 0, 7, 2), None);
    }

    #[test]
    fn rotated_root() {
        // ranks 0..5 map to positions 3,4,0,1,2
        assert_eq!(children(3, 3, 5, 2), vec![4, 0]);
        assert_eq!(children(3, 4, 5, 2), vec![1, 2]);
        assert_eq!(parent(3, 2, 5, 2), Some(4));
        assert_eq!(subtree(3, 4, 5, 2), vec![1, 2]);
    }

    #[test]
    fn every_position_reached_once() {
        for n in 1..20 {
            for arity in 1..4 {
                for root in 0..n {
                    let mut all = subtree(root, root, n, arity);
                    all.push(root);
                    all.sort_unstable();
                    assert_eq!(all, (0..n).collect::<Vec<_>>());
                    for pos in 0..n {
                        for child in children(root, pos, n, arity) {
                            assert_eq!(parent(root, child, n, arity), Some(pos));
                        }
                    }
                }
            }
        }
    }
}
