//! Committed bitstream graphs.
//!
//! A [`QueuedBitstream`] is the artifact the scheduler hands to the DMA
//! engine: the compiled block graph and data pool, relocated into an
//! exclusively owned uncached region. The first pool word is the run-state
//! sentinel the Start and End blocks write, which lets the scheduler follow
//! execution without touching hardware registers.

use crate::bitstream::Bitstream;
use crate::compiler::{self, Breakpoint, CompileError};
use crate::control_block::{ControlBlock, CONTROL_BLOCK_SIZE};
use crate::memory::{MemoryError, UncachedAllocator, UncachedRegion, PAGE_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum CommitError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Descriptor word index of the next-pointer field.
const NEXT_FIELD: usize = 5;

/// A compiled bitstream graph, before or after commitment to uncached
/// memory.
pub struct QueuedBitstream {
    duration: f32,
    blocks: Vec<ControlBlock>,
    data: Vec<u32>,
    breakpoints: Vec<Breakpoint>,
    memory: Option<Box<dyn UncachedRegion>>,
}

impl QueuedBitstream {
    /// Compile `bitstream` into a fresh graph.
    ///
    /// A repeating graph closes with a back-edge into its repeating region;
    /// a non-repeating one ends with a null next pointer, halting the
    /// engine after a single pass.
    pub fn compile(bitstream: &Bitstream, repeating: bool) -> Result<Self, CompileError> {
        let output = compiler::compile(bitstream, repeating, None)?;
        Ok(QueuedBitstream::from_output(bitstream, output))
    }

    /// Compile `bitstream` to pick up where `previous` hands off.
    ///
    /// The new graph mirrors the machine state at `previous`'s end-of-graph
    /// breakpoint, so the wire sees no discontinuity. Returns the graph and
    /// the transfer offsets: block indices in `previous` whose next
    /// pointers must be rewritten — via [`transfer_to`](Self::transfer_to)
    /// — once the new graph is committed.
    pub fn transfer_from(
        previous: &QueuedBitstream,
        bitstream: &Bitstream,
        repeating: bool,
    ) -> Result<(Self, Vec<usize>), CompileError> {
        let handoff = previous
            .breakpoints
            .last()
            .expect("compiled graphs always carry an end breakpoint");
        let state = handoff.state.clone();
        let output = compiler::compile(bitstream, repeating, Some(&state))?;
        let offsets = previous
            .breakpoints
            .iter()
            .filter(|breakpoint| breakpoint.state == state)
            .map(|breakpoint| breakpoint.block)
            .collect();
        Ok((QueuedBitstream::from_output(bitstream, output), offsets))
    }

    fn from_output(bitstream: &Bitstream, output: compiler::Output) -> Self {
        QueuedBitstream {
            duration: bitstream.duration(),
            blocks: output.blocks,
            data: output.data,
            breakpoints: output.breakpoints,
            memory: None,
        }
    }

    /// Time one pass of the source bitstream takes on the wire, in
    /// microseconds.
    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn blocks(&self) -> &[ControlBlock] {
        &self.blocks
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn is_committed(&self) -> bool {
        self.memory.is_some()
    }

    /// Relocate the graph into uncached memory.
    ///
    /// Control blocks are written first, then the data pool; offsets become
    /// bus addresses, peripheral destinations pass through. Committing an
    /// already committed graph is a no-op; on failure nothing is retained.
    pub fn commit(&mut self, allocator: &dyn UncachedAllocator) -> Result<(), CommitError> {
        if self.memory.is_some() {
            return Ok(());
        }
        let blocks_size = self.blocks.len() * CONTROL_BLOCK_SIZE;
        let total = blocks_size + self.data.len() * 4;
        let size = (total + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let region = allocator.allocate(size)?;

        let block_base = region.bus_address();
        let data_base = block_base + blocks_size as u32;
        let last_data_index = self.data.len() - 1;
        let pointer = region.as_ptr();
        for (index, block) in self.blocks.iter().enumerate() {
            let encoded = block.encode(block_base, data_base, last_data_index);
            for (field, word) in encoded.words().into_iter().enumerate() {
                unsafe { pointer.add(index * 8 + field).write_volatile(word) };
            }
        }
        let pool = unsafe { pointer.add(self.blocks.len() * 8) };
        for (index, word) in self.data.iter().enumerate() {
            unsafe { pool.add(index).write_volatile(*word) };
        }

        self.memory = Some(region);
        Ok(())
    }

    /// Bus address of the graph's Start block, once committed.
    pub fn bus_address(&self) -> Option<u32> {
        self.memory.as_ref().map(|memory| memory.bus_address())
    }

    /// The committed region, for callers that need the CPU-side view.
    pub fn memory(&self) -> Option<&dyn UncachedRegion> {
        self.memory.as_deref()
    }

    fn sentinel(&self) -> Option<u32> {
        self.memory.as_ref().map(|memory| {
            let slot = self.blocks.len() * 8;
            unsafe { memory.as_ptr().add(slot).read_volatile() }
        })
    }

    /// Whether the Start block has executed: the graph is on the engine.
    pub fn is_transmitting(&self) -> bool {
        matches!(self.sentinel(), Some(sentinel) if sentinel != 0)
    }

    /// Whether an End block has executed: at least one full pass played.
    pub fn is_repeating(&self) -> bool {
        self.sentinel() == Some(u32::MAX)
    }

    /// Patch the committed next pointers at `offsets` to enter `next`.
    ///
    /// Each patch is a single word written to uncached memory; the engine
    /// observes it atomically because the targeted blocks lie behind the
    /// current End block's not-yet-fetched next pointer.
    ///
    /// # Panics
    ///
    /// Panics when either graph is not committed.
    pub fn transfer_to(&self, next: &QueuedBitstream, offsets: &[usize]) {
        let target = next
            .bus_address()
            .expect("successor must be committed before transfer");
        let memory = self
            .memory
            .as_ref()
            .expect("transfer requires a committed graph");
        for &block in offsets {
            assert!(block < self.blocks.len(), "transfer offset out of range");
            unsafe {
                memory
                    .as_ptr()
                    .add(block * 8 + NEXT_FIELD)
                    .write_volatile(target)
            };
        }
    }
}

impl std::fmt::Debug for QueuedBitstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedBitstream")
            .field("duration", &self.duration)
            .field("blocks", &self.blocks.len())
            .field("data", &self.data.len())
            .field("bus_address", &self.bus_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::Pin;
    use crate::control_block::{GPIO_SET0_BUS, PWM_FIFO_BUS, PWM_RNG1_BUS};
    use crate::memory::{HeapAllocator, HEAP_BUS_BASE};

    fn committed(bitstream: &Bitstream) -> QueuedBitstream {
        let allocator = HeapAllocator::new();
        let mut queued = QueuedBitstream::compile(bitstream, true).unwrap();
        queued.commit(&allocator).unwrap();
        queued
    }

    fn descriptor(queued: &QueuedBitstream, block: usize) -> [u32; 8] {
        let pointer = queued.memory.as_ref().unwrap().as_ptr();
        let mut words = [0; 8];
        for (field, word) in words.iter_mut().enumerate() {
            *word = unsafe { pointer.add(block * 8 + field).read_volatile() };
        }
        words
    }

    #[test]
    fn commit_relocates_pool_and_block_offsets() {
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(0xAAAA_AAAA, 32);
        let queued = committed(&bitstream);

        let base = HEAP_BUS_BASE;
        let pool = base + 4 * CONTROL_BLOCK_SIZE as u32;

        // Start: literal 1 into the sentinel, then on to the first data
        let start = descriptor(&queued, 0);
        assert_eq!(start[1], pool + 4);
        assert_eq!(start[2], pool);
        assert_eq!(start[5], base + CONTROL_BLOCK_SIZE as u32);

        // Data: pool word 2 into the PWM FIFO
        let data = descriptor(&queued, 1);
        assert_eq!(data[1], pool + 8);
        assert_eq!(data[2], PWM_FIFO_BUS);
        assert_eq!(data[3], 4);

        // Range: pool word 3 into RNG1
        let range = descriptor(&queued, 2);
        assert_eq!(range[1], pool + 12);
        assert_eq!(range[2], PWM_RNG1_BUS);

        // End: trailing all-ones into the sentinel, back-edge to block 1
        let end = descriptor(&queued, 3);
        assert_eq!(end[1], pool + 16);
        assert_eq!(end[2], pool);
        assert_eq!(end[5], base + CONTROL_BLOCK_SIZE as u32);
    }

    #[test]
    fn commit_writes_the_data_pool_after_the_blocks() {
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(0xAAAA_AAAA, 32);
        let queued = committed(&bitstream);
        let pointer = queued.memory.as_ref().unwrap().as_ptr();
        let pool: Vec<u32> = (0..5)
            .map(|index| unsafe { pointer.add(4 * 8 + index).read_volatile() })
            .collect();
        assert_eq!(pool, &[0, 1, 0xAAAA_AAAA, 32, u32::MAX]);
    }

    #[test]
    fn commit_is_idempotent() {
        let allocator = HeapAllocator::new();
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(1, 32);
        let mut queued = QueuedBitstream::compile(&bitstream, true).unwrap();
        queued.commit(&allocator).unwrap();
        let address = queued.bus_address();
        queued.commit(&allocator).unwrap();
        assert_eq!(queued.bus_address(), address);
    }

    #[test]
    fn sentinel_tracks_execution_phase() {
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(1, 32);
        let queued = committed(&bitstream);
        assert!(!queued.is_transmitting());
        assert!(!queued.is_repeating());

        let sentinel = unsafe { queued.memory.as_ref().unwrap().as_ptr().add(4 * 8) };
        unsafe { sentinel.write_volatile(1) };
        assert!(queued.is_transmitting());
        assert!(!queued.is_repeating());

        unsafe { sentinel.write_volatile(u32::MAX) };
        assert!(queued.is_transmitting());
        assert!(queued.is_repeating());
    }

    #[test]
    fn uncommitted_graph_reports_nothing() {
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(1, 32);
        let queued = QueuedBitstream::compile(&bitstream, true).unwrap();
        assert_eq!(queued.bus_address(), None);
        assert!(!queued.is_transmitting());
        assert!(!queued.is_repeating());
    }

    #[test]
    fn transfer_patches_the_end_block_next_pointer() {
        let allocator = HeapAllocator::new();

        let mut first = Bitstream::new(14.5, 32);
        first.add_data(1, 32);
        first.add_data(2, 32);
        let mut previous = QueuedBitstream::compile(&first, true).unwrap();
        previous.commit(&allocator).unwrap();

        let mut second = Bitstream::new(14.5, 32);
        second.add_data(3, 32);
        let (mut next, offsets) =
            QueuedBitstream::transfer_from(&previous, &second, true).unwrap();
        // hand-off happens at the End block
        assert_eq!(offsets, &[previous.blocks().len() - 1]);
        // the width carries over, so no leading Range block is emitted
        assert!(matches!(next.blocks()[1], ControlBlock::Data { .. }));
        assert!(matches!(next.blocks()[2], ControlBlock::End { .. }));

        next.commit(&allocator).unwrap();
        previous.transfer_to(&next, &offsets);

        let end = descriptor(&previous, previous.blocks().len() - 1);
        assert_eq!(end[5], next.bus_address().unwrap());
    }

    #[test]
    fn transfer_seeds_pending_edges_into_the_successor() {
        let allocator = HeapAllocator::new();

        // the set edge dangles at the end of the repeating stream, so the
        // hand-off state still holds it at its full residual
        let mut first = Bitstream::new(14.5, 32);
        first.add_data(1, 32);
        first.add_data(2, 32);
        first.add_data(3, 32);
        first.set(Pin::RailCom);
        let mut previous = QueuedBitstream::compile(&first, true).unwrap();
        previous.commit(&allocator).unwrap();

        let mut second = Bitstream::new(14.5, 32);
        second.add_data(4, 32);
        second.add_data(5, 32);
        second.add_data(6, 32);
        let (next, _offsets) =
            QueuedBitstream::transfer_from(&previous, &second, false).unwrap();
        // the inherited edge fires two successor words in
        assert!(next
            .blocks()
            .iter()
            .any(|block| matches!(block, ControlBlock::Gpio { .. })));
    }

    #[test]
    fn gpio_descriptor_targets_the_set_clear_pairs() {
        let mut bitstream = Bitstream::new(14.5, 32);
        bitstream.add_data(1, 32);
        bitstream.set(Pin::Debug);
        bitstream.add_data(2, 32);
        bitstream.add_data(3, 32);
        let queued = committed(&bitstream);
        let gpio = queued
            .blocks()
            .iter()
            .position(|block| matches!(block, ControlBlock::Gpio { .. }))
            .expect("gpio block");
        let words = descriptor(&queued, gpio);
        assert_eq!(words[2], GPIO_SET0_BUS);
        assert_eq!(words[3], (2 << 16) | 8);
        assert_eq!(words[4], 4 << 16);
    }
}
