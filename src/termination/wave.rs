/// Four-counter wave state of one collective epoch on one node.
///
/// Counts are cumulative for the lifetime of the epoch. Each wave a node
/// reports its subtree's totals once it has finished the epoch locally and
/// every child has reported; the root compares the totals of two consecutive
/// waves.
#[derive(Debug, Default)]
pub(crate) struct WaveState {
    pub l_prod: u64,
    pub l_cons: u64,
    g_prod1: u64,
    g_cons1: u64,
    g_prod2: u64,
    g_cons2: u64,
    recv_children: usize,
    num_children: usize,
    cur_wave: u64,
    submitted: Option<u64>,
    pub active: bool,
    pub terminated: bool,
    pub constant_waves: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaveStep {
    Idle,
    /// Send the subtree totals to the parent.
    Report { prod: u64, cons: u64 },
    /// The root detected termination.
    Terminated,
    /// The root starts another wave. `constant` when the totals did not move
    /// since the previous wave.
    Continue { wave: u64, constant: bool },
}

impl WaveState {
    pub fn new(num_children: usize) -> Self {
        Self {
            num_children,
            ..Default::default()
        }
    }

    pub fn ready(&self) -> bool {
        self.active
            && !self.terminated
            && self.recv_children >= self.num_children
            && self.submitted != Some(self.cur_wave)
    }

    pub fn child_report(&mut self, prod: u64, cons: u64) {
        self.g_prod1 += prod;
        self.g_cons1 += cons;
        self.recv_children += 1;
    }

    pub fn start_wave(&mut self, wave: u64) {
        if wave > self.cur_wave {
            self.cur_wave = wave;
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.g_prod2, self.g_cons2)
    }

    pub fn step(&mut self, is_root: bool) -> WaveStep {
        if !self.ready() {
            return WaveStep::Idle;
        }
        let prod = self.g_prod1 + self.l_prod;
        let cons = self.g_cons1 + self.l_cons;
        self.g_prod1 = 0;
        self.g_cons1 = 0;
        self.recv_children = 0;
        self.submitted = Some(self.cur_wave);

        if !is_root {
            return WaveStep::Report { prod, cons };
        }

        if prod == cons && self.g_prod2 == self.g_cons2 && prod == self.g_prod2 {
            self.terminated = true;
            return WaveStep::Terminated;
        }

        let constant = prod == self.g_prod2 && cons == self.g_cons2;
        self.constant_waves = if constant { self.constant_waves + 1 } else { 0 };
        self.g_prod2 = prod;
        self.g_cons2 = cons;
        self.cur_wave += 1;
        WaveStep::Continue {
            wave: self.cur_wave,
            constant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_epochs_never_report() {
        let mut state = WaveState::new(0);
        state.l_prod = 1;
        state.l_cons = 1;
        assert_eq!(state.step(true), WaveStep::Idle);
    }

    #[test]
    fn single_node_needs_two_identical_waves() {
        let mut state = WaveState::new(0);
        state.l_prod = 3;
        state.l_cons = 3;
        state.active = true;
        assert_eq!(
            state.step(true),
            WaveStep::Continue {
                wave: 1,
                constant: false
            }
        );
        // the next wave sees the same totals
        assert_eq!(state.step(true), WaveStep::Terminated);
        assert!(state.terminated);
    }

    #[test]
    fn moving_counts_delay_termination() {
        let mut state = WaveState::new(0);
        state.active = true;
        state.l_prod = 2;
        state.l_cons = 1;
        assert!(matches!(state.step(true), WaveStep::Continue { .. }));
        state.l_cons = 2;
        assert!(matches!(
            state.step(true),
            WaveStep::Continue {
                constant: false,
                ..
            }
        ));
        assert_eq!(state.step(true), WaveStep::Terminated);
    }

    #[test]
    fn unbalanced_constant_waves_are_flagged() {
        let mut state = WaveState::new(0);
        state.active = true;
        state.l_prod = 2;
        state.l_cons = 1;
        state.step(true);
        assert_eq!(
            state.step(true),
            WaveStep::Continue {
                wave: 2,
                constant: true
            }
        );
        assert_eq!(state.constant_waves, 1);
    }

    #[test]
    fn interior_nodes_wait_for_children() {
        let mut state = WaveState::new(2);
        state.active = true;
        state.l_prod = 1;
        state.child_report(4, 2);
        assert_eq!(state.step(false), WaveStep::Idle);
        state.child_report(0, 3);
        assert_eq!(state.step(false), WaveStep::Report { prod: 5, cons: 5 });
        // already submitted this wave
        assert_eq!(state.step(false), WaveStep::Idle);
        state.start_wave(1);
        state.child_report(0, 0);
        state.child_report(0, 0);
        assert_eq!(state.step(false), WaveStep::Report { prod: 1, cons: 0 });
    }
}
