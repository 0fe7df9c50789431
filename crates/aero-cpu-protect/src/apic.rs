use std::collections::VecDeque;

/// Which controller raised the interrupt being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptSource {
    Pic,
    LocalApic,
}

/// Interrupt controllers as seen from the CPU core.
pub trait InterruptController {
    /// INTA cycle: returns the vector to deliver.
    fn acknowledge_interrupt(&mut self, source: InterruptSource) -> u8;

    /// Full 8-bit TPR.
    fn task_priority(&self) -> u8;
    fn set_task_priority(&mut self, tpr: u8);

    /// DMA controller hold request (HRQ).
    fn hold_request(&self) -> bool {
        false
    }

    /// Grants the bus to the DMA controller (HLDA).
    fn acknowledge_hold(&mut self) {}
}

/// FIFO-backed controller for tests: vectors are acknowledged in the order they were queued.
///
/// An empty queue acknowledges the spurious vector.
#[derive(Debug, Clone, Default)]
pub struct FifoInterruptController {
    pub pending: VecDeque<u8>,
    pub acknowledged: Vec<(InterruptSource, u8)>,
    pub tpr: u8,
    pub spurious_vector: u8,
    pub hold_requested: bool,
    pub holds_granted: usize,
}

impl FifoInterruptController {
    pub fn new() -> Self {
        Self {
            spurious_vector: 0xff,
            ..Self::default()
        }
    }

    pub fn push(&mut self, vector: u8) {
        self.pending.push_back(vector);
    }
}

impl InterruptController for FifoInterruptController {
    fn acknowledge_interrupt(&mut self, source: InterruptSource) -> u8 {
        let vector = self.pending.pop_front().unwrap_or(self.spurious_vector);
        self.acknowledged.push((source, vector));
        vector
    }

    fn task_priority(&self) -> u8 {
        self.tpr
    }

    fn set_task_priority(&mut self, tpr: u8) {
        self.tpr = tpr;
    }

    fn hold_request(&self) -> bool {
        self.hold_requested
    }

    fn acknowledge_hold(&mut self) {
        self.hold_requested = false;
        self.holds_granted += 1;
    }
}
