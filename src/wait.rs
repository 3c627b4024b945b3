//! Bounded spin-wait used by the commit sequencer.
//!
//! Producers publish their commit offsets in reservation order; the wait
//! between two publishes is bounded by one record copy, so a short
//! exponential spin followed by yielding beats parking in the kernel.

pub(crate) struct SpinWait {
    step: u32,
}

const SPIN_STEPS: u32 = 6;

impl SpinWait {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn spin(&mut self) {
        if self.step < SPIN_STEPS {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}
