//! # DCC track signal generation
//!
//! Compiles event-annotated physical-layer bitstreams into linked graphs of
//! BCM283x DMA control blocks. Walking the graph, the DMA engine feeds the
//! PWM serializer FIFO with the waveform words, switches the serialized word
//! width through the PWM range register, and toggles auxiliary GPIO pins in
//! exact alignment with the output — correcting for the two words of lag
//! between a FIFO write and the bit reaching the wire.
//!
//! ```rust
//! let mut bitstream = dcc::Bitstream::new(14.5, 32);
//! bitstream.add_data(0xAAAA_AAAA, 32);
//!
//! let queued = dcc::QueuedBitstream::compile(&bitstream, true).unwrap();
//! assert_eq!(queued.blocks().len(), 4);
//! assert_eq!(queued.data(), &[0, 1, 0xAAAA_AAAA, 32, u32::MAX]);
//! ```
//!
//! Committing a [`QueuedBitstream`] relocates the graph into uncached,
//! DMA-addressable memory obtained from an [`UncachedAllocator`]; successive
//! graphs are stitched together at breakpoints with
//! [`QueuedBitstream::transfer_from`] so hand-off between bitstreams is
//! seamless on the wire.

mod bitstream;
mod compiler;
mod control_block;
mod delayer;
mod memory;
mod queued;

pub use bitstream::{Bitstream, Event, Pin};
pub use compiler::{Breakpoint, CompileError, TransferState};
pub use control_block::{
    ControlBlock, DmaControlBlock, CONTROL_BLOCK_SIZE, GPIO_SET0_BUS, PWM_FIFO_BUS, PWM_RNG1_BUS,
};
pub use delayer::{EventDelayer, GpioEdge, GpioGroup, GPIO_DELAY_WORDS};
pub use memory::{
    HeapAllocator, MemoryError, UncachedAllocator, UncachedRegion, PAGE_SIZE,
};
pub use queued::{CommitError, QueuedBitstream};
