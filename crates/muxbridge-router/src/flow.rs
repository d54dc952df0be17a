use crate::config::FlowControlConfig;

/// Sender-side bookkeeping of the advisory flow-control window.
///
/// Every time the cumulative byte count crosses a block boundary the sender
/// emits `ping {sequence}`; the receiver answers `pong {sequence}` once it
/// has consumed that much, which moves the window to `sequence + window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControl {
    window_size: u64,
    block_size: u64,
    out_sequence: u64,
    out_window: u64,
}

impl FlowControl {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            window_size: config.window,
            block_size: config.block_size.max(1),
            out_sequence: 0,
            out_window: config.window,
        }
    }

    /// Account for `len` bytes sent.
    ///
    /// Returns whether there is still room, and the `ping` sequence to emit
    /// when a block boundary was crossed.
    pub fn record_send(&mut self, len: u64) -> (bool, Option<u64>) {
        let before = self.out_sequence;
        self.out_sequence += len;
        let ping = (before / self.block_size != self.out_sequence / self.block_size)
            .then_some(self.out_sequence);
        (self.has_room(), ping)
    }

    /// Apply a `pong`. The window never moves backwards.
    ///
    /// Returns true when this pong reopened a closed window.
    pub fn pong(&mut self, sequence: u64) -> bool {
        let was_blocked = !self.has_room();
        let window = sequence.saturating_add(self.window_size);
        if window > self.out_window {
            self.out_window = window;
        }
        was_blocked && self.has_room()
    }

    pub fn has_room(&self) -> bool {
        self.out_sequence < self.out_window
    }

    pub fn sequence(&self) -> u64 {
        self.out_sequence
    }

    pub fn window(&self) -> u64 {
        self.out_window
    }
}
