use crate::{fatal, NodeId};

/// Dijkstra-Scholten state of one rooted epoch on one node.
///
/// A node engages with the sender of the first message it processes under
/// the epoch and acknowledges every other message right away. Once its own
/// sends are all acknowledged and its local work is done it acknowledges the
/// engaging messages to its parent and disengages. The root is engaged from
/// creation and terminates the epoch instead of acknowledging.
#[derive(Debug)]
pub(crate) struct DsState {
    root: bool,
    parent: Option<NodeId>,
    engage_count: u64,
    deficit: u64,
    self_sent: u64,
    self_done: u64,
    terminated: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DsStep {
    Idle,
    Ack { to: NodeId, count: u64 },
    Terminated,
}

impl DsState {
    pub fn new(root: bool) -> Self {
        Self {
            root,
            parent: None,
            engage_count: 0,
            deficit: 0,
            self_sent: 0,
            self_done: 0,
            terminated: false,
        }
    }

    pub fn sent(&mut self, dest: NodeId, this: NodeId) {
        if dest == this {
            self.self_sent += 1;
        } else {
            self.deficit += 1;
        }
    }

    /// Local work started outside of any message.
    pub fn self_produce(&mut self, n: u64) {
        self.self_sent += n;
    }

    pub fn self_consume(&mut self, n: u64) {
        self.self_done += n;
    }

    /// Records a processed message and returns an acknowledgement that is
    /// owed right away, if any.
    pub fn processed(&mut self, pred: NodeId, this: NodeId) -> Option<(NodeId, u64)> {
        if pred == this {
            self.self_done += 1;
            return None;
        }
        if self.root {
            return Some((pred, 1));
        }
        match self.parent {
            Some(parent) if parent == pred => {
                self.engage_count += 1;
                None
            }
            Some(_) => Some((pred, 1)),
            None => {
                self.parent = Some(pred);
                self.engage_count = 1;
                None
            }
        }
    }

    pub fn acked(&mut self, count: u64) {
        self.deficit = match self.deficit.checked_sub(count) {
            Some(deficit) => deficit,
            None => fatal!(
                "termination acknowledgement of {} exceeds the deficit of {}",
                count,
                self.deficit
            ),
        };
    }

    pub fn is_busy(&self) -> bool {
        self.deficit != 0 || self.self_sent != self.self_done
    }

    /// A disengaged node with nothing outstanding; its state can be dropped.
    pub fn is_idle(&self) -> bool {
        !self.root && self.parent.is_none() && !self.is_busy()
    }

    pub fn try_last(&mut self) -> DsStep {
        if self.is_busy() || self.terminated {
            return DsStep::Idle;
        }
        if self.root {
            self.terminated = true;
            return DsStep::Terminated;
        }
        match self.parent.take() {
            Some(to) => {
                let count = std::mem::take(&mut self.engage_count);
                DsStep::Ack { to, count }
            }
            None => DsStep::Idle,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "deficit {} self {}/{} parent {:?}",
            self.deficit, self.self_done, self.self_sent, self.parent
        )
    }
}
