//! DMA engine registers, one channel at a time.

use super::Registers;

// channel register word offsets
const CS: usize = 0x00;
const CONBLK_AD: usize = 0x01;
const DEBUG: usize = 0x08;

// CS
const CS_ACTIVE: u32 = 1 << 0;
const CS_END: u32 = 1 << 1;
const CS_INT: u32 = 1 << 2;
const CS_ERROR: u32 = 1 << 8;
const CS_WAIT_FOR_OUTSTANDING_WRITES: u32 = 1 << 28;
const CS_ABORT: u32 = 1 << 30;
const CS_RESET: u32 = 1 << 31;

// DEBUG
const DEBUG_READ_LAST_NOT_SET: u32 = 1 << 0;
const DEBUG_FIFO_ERROR: u32 = 1 << 1;
const DEBUG_READ_ERROR: u32 = 1 << 2;

macro_rules! debug_flag {
    ($(#[$doc:meta])* $name:ident, $bit:expr) => {
        paste::paste! {
            $(#[$doc])*
            pub fn $name(&self) -> bool {
                self.registers.read(DEBUG) & $bit != 0
            }

            /// Write 1 to clear the flag.
            pub fn [<clear_ $name>](&mut self) {
                self.registers.write(DEBUG, $bit);
            }
        }
    };
}

/// Register shim for one DMA channel plus the global enable register.
pub struct Dma<'a> {
    registers: Registers<'a>,
    enable: Registers<'a>,
    channel: usize,
}

impl<'a> Dma<'a> {
    pub(crate) fn new(base: *mut u32, enable: *mut u32, channel: usize) -> Dma<'a> {
        Dma {
            registers: Registers::new(base),
            enable: Registers::new(enable),
            channel,
        }
    }

    /// Power the channel up in the global enable register.
    pub fn enable(&mut self) {
        let bit = 1 << self.channel;
        self.enable.modify(0, |value| value | bit);
    }

    /// Reset the channel and clear latched debug flags.
    pub fn reset(&mut self) {
        self.registers.write(CS, CS_RESET);
        self.registers.write(
            DEBUG,
            DEBUG_READ_ERROR | DEBUG_FIFO_ERROR | DEBUG_READ_LAST_NOT_SET,
        );
    }

    /// Point the engine at a control block chain and set it running.
    pub fn start(&mut self, control_block: u32) {
        self.registers.write(CONBLK_AD, control_block);
        self.registers
            .write(CS, CS_WAIT_FOR_OUTSTANDING_WRITES | CS_END | CS_INT | CS_ACTIVE);
    }

    pub fn is_active(&self) -> bool {
        self.registers.read(CS) & CS_ACTIVE != 0
    }

    pub fn has_error(&self) -> bool {
        self.registers.read(CS) & CS_ERROR != 0
    }

    /// Abort the current control block and halt the engine.
    pub fn abort(&mut self) {
        self.registers.modify(CS, |value| value | CS_ABORT);
        self.registers.write(CS, CS_RESET);
        self.registers.write(CONBLK_AD, 0);
    }

    debug_flag!(
        /// The engine performed a read that returned an error.
        read_error,
        DEBUG_READ_ERROR
    );
    debug_flag!(
        /// Internal FIFO error.
        fifo_error,
        DEBUG_FIFO_ERROR
    );
    debug_flag!(
        /// A read was issued without the last-signal set.
        read_last_not_set,
        DEBUG_READ_LAST_NOT_SET
    );
}
