use std::collections::BTreeMap;

use hashbrown::HashMap;

use super::epoch::EpochId;
use crate::NodeId;

/// Spans kept per archetype of epochs rooted on other nodes. The oldest
/// spans are forgotten first; a forgotten epoch is asked about again at its
/// root.
const REMOTE_SPANS: usize = 64;

/// Terminated sequence numbers of one epoch archetype, as disjoint
/// inclusive spans. Epochs of an archetype are allocated in order, so the
/// window stays a handful of spans however many of them terminated.
#[derive(Debug, Default)]
pub(crate) struct EpochWindow {
    spans: BTreeMap<u32, u32>,
}

impl EpochWindow {
    pub fn contains(&self, seq: u32) -> bool {
        self.spans
            .range(..=seq)
            .next_back()
            .map_or(false, |(_, &end)| seq <= end)
    }

    /// Records `seq`. Returns false if it was recorded already.
    pub fn insert(&mut self, seq: u32) -> bool {
        if self.contains(seq) {
            return false;
        }
        let (mut start, mut end) = (seq, seq);
        let before = self.spans.range(..seq).next_back().map(|(&s, &e)| (s, e));
        if let Some((s, e)) = before {
            if e.checked_add(1) == Some(seq) {
                self.spans.remove(&s);
                start = s;
            }
        }
        if let Some(after) = seq.checked_add(1) {
            if let Some(e) = self.spans.remove(&after) {
                end = e;
            }
        }
        self.spans.insert(start, end);
        true
    }

    pub fn spans(&self) -> usize {
        self.spans.len()
    }

    fn forget_oldest(&mut self) {
        self.spans.pop_first();
    }
}

/// Every epoch this node has seen terminate, one window per archetype.
#[derive(Debug, Default)]
pub(crate) struct Terminated {
    windows: HashMap<u64, EpochWindow>,
}

impl Terminated {
    pub fn contains(&self, epoch: EpochId) -> bool {
        self.windows
            .get(&epoch.archetype())
            .map_or(false, |window| window.contains(epoch.seq()))
    }

    pub fn insert(&mut self, epoch: EpochId, this: NodeId) -> bool {
        let window = self.windows.entry(epoch.archetype()).or_default();
        if !window.insert(epoch.seq()) {
            return false;
        }
        if epoch.root().map_or(false, |root| root != this) {
            while window.spans() > REMOTE_SPANS {
                window.forget_oldest();
            }
        }
        true
    }

    /// Spans held over all archetypes.
    pub fn spans(&self) -> usize {
        self.windows.values().map(EpochWindow::spans).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termination::epoch::EpochCategory;

    #[test]
    fn out_of_order_terminations_merge() {
        let mut window = EpochWindow::default();
        for seq in [3, 1, 5, 4] {
            assert!(window.insert(seq));
        }
        assert_eq!(window.spans(), 2);
        assert!(!window.contains(2));
        assert!(!window.insert(4));
        assert!(window.insert(2));
        assert_eq!(window.spans(), 1);
        assert!((1..=5).all(|seq| window.contains(seq)));
        assert!(!window.contains(0) && !window.contains(6));
    }

    #[test]
    fn archetypes_do_not_mix() {
        let mut done = Terminated::default();
        let plain = EpochId::rooted(1, 7, EpochCategory::Plain);
        assert!(done.insert(plain, 1));
        assert!(done.contains(plain));
        assert!(!done.contains(EpochId::rooted(1, 7, EpochCategory::Dependent)));
        assert!(!done.contains(EpochId::rooted(2, 7, EpochCategory::Plain)));
        assert!(!done.contains(EpochId::collective(7)));
        assert!(!done.contains(EpochId::GLOBAL));
    }

    #[test]
    fn remote_windows_forget_the_oldest_spans() {
        let mut done = Terminated::default();
        // every other epoch of node 3, seen from node 0
        for seq in (1..=2 * REMOTE_SPANS as u32 + 20).step_by(2) {
            done.insert(EpochId::rooted(3, seq, EpochCategory::Plain), 0);
        }
        assert_eq!(done.spans(), REMOTE_SPANS);
        assert!(!done.contains(EpochId::rooted(3, 1, EpochCategory::Plain)));
        // local windows keep everything
        for seq in (1..=2 * REMOTE_SPANS as u32 + 20).step_by(2) {
            done.insert(EpochId::rooted(0, seq, EpochCategory::Plain), 0);
        }
        assert!(done.contains(EpochId::rooted(0, 1, EpochCategory::Plain)));
    }
}
