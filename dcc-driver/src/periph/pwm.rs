//! PWM controller registers.

use super::Registers;

// register word offsets
const CTL: usize = 0x00;
const STA: usize = 0x01;
const DMAC: usize = 0x02;
const RNG1: usize = 0x04;
const FIF1: usize = 0x06;

// CTL
const CTL_PWEN1: u32 = 1 << 0;
const CTL_MODE1: u32 = 1 << 1;
const CTL_USEF1: u32 = 1 << 5;
const CTL_CLRF1: u32 = 1 << 6;

// STA
const STA_EMPT1: u32 = 1 << 1;
const STA_WERR1: u32 = 1 << 2;
const STA_RERR1: u32 = 1 << 3;
const STA_GAPO1: u32 = 1 << 4;
const STA_BERR: u32 = 1 << 8;

// DMAC
const DMAC_ENAB: u32 = 1 << 31;
const DMAC_PANIC_SHIFT: u32 = 8;

macro_rules! status_flag {
    ($(#[$doc:meta])* $name:ident, $bit:expr) => {
        paste::paste! {
            $(#[$doc])*
            pub fn $name(&self) -> bool {
                self.registers.read(STA) & $bit != 0
            }

            /// Write 1 to clear the flag.
            pub fn [<clear_ $name>](&mut self) {
                self.registers.write(STA, $bit);
            }
        }
    };
}

/// PWM register shim for channel 1, the DCC serializer.
pub struct Pwm<'a> {
    registers: Registers<'a>,
}

impl<'a> Pwm<'a> {
    pub(crate) fn new(base: *mut u32) -> Pwm<'a> {
        Pwm {
            registers: Registers::new(base),
        }
    }

    /// Disable the channel and clear latched error flags.
    pub fn reset(&mut self) {
        self.registers.write(CTL, 0);
        self.registers
            .write(STA, STA_WERR1 | STA_RERR1 | STA_GAPO1 | STA_BERR);
    }

    /// Number of bits serialized from each FIFO word.
    pub fn set_range(&mut self, bits: u32) {
        self.registers.write(RNG1, bits);
    }

    /// Route the FIFO through DMA pacing with the given DREQ threshold.
    pub fn enable_dma(&mut self, threshold: u32) {
        self.registers
            .write(DMAC, DMAC_ENAB | (7 << DMAC_PANIC_SHIFT) | threshold);
    }

    /// Clear the FIFO and start serializing from it, MSB first.
    pub fn enable_serializer(&mut self) {
        self.registers.write(CTL, CTL_CLRF1);
        self.registers.write(CTL, CTL_USEF1 | CTL_MODE1 | CTL_PWEN1);
    }

    pub fn disable(&mut self) {
        self.registers.write(CTL, 0);
    }

    pub fn fifo_empty(&self) -> bool {
        self.registers.read(STA) & STA_EMPT1 != 0
    }

    /// Push one word directly; only useful before DMA takes over.
    pub fn push_fifo(&mut self, word: u32) {
        self.registers.write(FIF1, word);
    }

    status_flag!(
        /// Bus error raised on register write collisions.
        bus_error,
        STA_BERR
    );
    status_flag!(
        /// FIFO written while full.
        fifo_write_error,
        STA_WERR1
    );
    status_flag!(
        /// FIFO read while empty.
        fifo_read_error,
        STA_RERR1
    );
    status_flag!(
        /// The serializer ran dry between words.
        channel_gap,
        STA_GAPO1
    );
}
