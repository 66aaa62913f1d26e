//! Two-word delay correction for GPIO events.
//!
//! The PWM serializer consumes FIFO words two DREQs behind the DMA writes
//! that queue them, so a GPIO edge written at its source position would fire
//! two words early on the wire. [`EventDelayer`] holds each edge back until
//! the word it was logically attached to is the one being emitted.

use arrayvec::ArrayVec;

use crate::bitstream::Pin;

/// Words of PWM FIFO lag between queueing a data word and it reaching the
/// wire.
pub const GPIO_DELAY_WORDS: u8 = 2;

/// Two pins, set or clear, at residuals 0, 1 or 2; same-slot pushes replace.
const PENDING_CAPACITY: usize = 8;

/// One latched GPIO edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioEdge {
    pub pin: Pin,
    /// `true` drives the pin high.
    pub level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    edge: GpioEdge,
    remaining: u8,
}

/// Combined set/clear masks of one coalesced release, laid out as the GPIO
/// output set and clear register pairs expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpioGroup {
    pub set: [u32; 2],
    pub clear: [u32; 2],
}

impl GpioGroup {
    fn apply(&mut self, edge: GpioEdge) {
        let bank = edge.pin.bank();
        let bit = edge.pin.mask();
        if edge.level {
            self.set[bank] |= bit;
            self.clear[bank] &= !bit;
        } else {
            self.clear[bank] |= bit;
            self.set[bank] &= !bit;
        }
    }

    /// The four words transferred to `GPSET0`/`GPSET1`/`GPCLR0`/`GPCLR1`.
    pub fn words(&self) -> [u32; 4] {
        [self.set[0], self.set[1], self.clear[0], self.clear[1]]
    }
}

/// FIFO of GPIO edges waiting out the serializer lag.
///
/// The compiler snapshots the delayer when recording machine states, so it
/// derives `Clone` and `PartialEq`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDelayer {
    pending: ArrayVec<Pending, PENDING_CAPACITY>,
}

impl EventDelayer {
    pub fn new() -> Self {
        EventDelayer::default()
    }

    /// Latch an edge, to be released [`GPIO_DELAY_WORDS`] data words later.
    ///
    /// A second edge for the same pin within the same word replaces the
    /// first: the last write wins once the group is coalesced.
    pub fn push(&mut self, edge: GpioEdge) {
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.edge.pin == edge.pin && p.remaining == GPIO_DELAY_WORDS)
        {
            pending.edge = edge;
        } else {
            self.pending.push(Pending {
                edge,
                remaining: GPIO_DELAY_WORDS,
            });
        }
    }

    /// Account for one consumed data word.
    pub fn advance(&mut self) {
        for pending in &mut self.pending {
            pending.remaining -= 1;
        }
    }

    /// Release every edge whose residual reached zero, coalesced into a
    /// single group in arrival order.
    pub fn take_due(&mut self) -> Option<GpioGroup> {
        if !self.pending.iter().any(|p| p.remaining == 0) {
            return None;
        }
        let mut group = GpioGroup::default();
        self.pending.retain(|pending| {
            if pending.remaining == 0 {
                group.apply(pending.edge);
                false
            } else {
                true
            }
        });
        Some(group)
    }

    /// Whether any edge is still waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
