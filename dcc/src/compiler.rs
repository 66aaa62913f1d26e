//! Bitstream to control block graph compilation.
//!
//! The compiler walks the event stream, releasing delayed GPIO edges through
//! an [`EventDelayer`], and emits a flat list of [`ControlBlock`]s plus the
//! data pool they index. Runs of same-width words collapse into single Data
//! blocks, width changes insert Range blocks, and coalesced GPIO groups
//! split the run they land in.
//!
//! The graph always closes with a back-edge (or a halt). An edge still
//! pending at end-of-input would fire past the End block, so the loop body
//! is replayed into an unrolled continuation until every edge is placed and
//! the machine state — next loop event, pending edges, serializer width —
//! matches the entry of an emitted block. The wrap state recurs after at
//! most one full replayed pass, so the continuation always closes.

use crate::bitstream::{Bitstream, Event};
use crate::control_block::ControlBlock;
use crate::delayer::{EventDelayer, GpioEdge};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("bitstream contains no data")]
    BitstreamContainsNoData,
    #[error("gpio event delayed into a partial word")]
    GpioWithinPartialWord,
}

/// Machine state a successor bitstream mirrors to take over mid-wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub(crate) delayer: EventDelayer,
    pub(crate) width: u8,
}

/// A candidate hand-off point.
///
/// `block` is the block whose next pointer is rewritten once a successor
/// graph is committed; `state` is what the successor must mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub block: usize,
    pub state: TransferState,
}

/// Entry state of a fresh Data block, the unit of back-edge matching.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MatchState {
    /// Loop-relative index of the event whose word starts the block.
    cursor: usize,
    delayer: EventDelayer,
    width: u8,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub blocks: Vec<ControlBlock>,
    pub data: Vec<u32>,
    pub breakpoints: Vec<Breakpoint>,
}

pub(crate) fn compile(
    bitstream: &Bitstream,
    repeating: bool,
    seed: Option<&TransferState>,
) -> Result<Output, CompileError> {
    let events = bitstream.events();
    let loop_start = events
        .iter()
        .rposition(|event| matches!(event, Event::LoopStart))
        .map(|marker| marker + 1)
        .unwrap_or(0);
    if !events[loop_start..]
        .iter()
        .any(|event| matches!(event, Event::Data { .. }))
    {
        return Err(CompileError::BitstreamContainsNoData);
    }

    let mut compiler = Compiler {
        events,
        word_size: bitstream.word_size,
        loop_start,
        blocks: vec![ControlBlock::Start { next: 1 }],
        data: vec![0, 1],
        breakpoints: Vec::new(),
        delayer: seed.map(|s| s.delayer.clone()).unwrap_or_default(),
        range: seed.map(|s| s.width),
        run: None,
        repeat_entry: 1,
        states: Vec::new(),
    };
    for index in 0..events.len() {
        match events[index] {
            Event::Data { word, size } => compiler.word(index, word, size)?,
            Event::GpioSet(pin) => compiler.delayer.push(GpioEdge { pin, level: true }),
            Event::GpioClear(pin) => compiler.delayer.push(GpioEdge { pin, level: false }),
            Event::LoopStart => compiler.start_loop(),
            Event::Breakpoint => compiler.breakpoint(),
        }
    }
    compiler.finish(repeating)
}

struct Compiler<'a> {
    events: &'a [Event],
    word_size: u8,
    /// Event index where the repeating tail begins; 0 without a marker.
    loop_start: usize,

    blocks: Vec<ControlBlock>,
    data: Vec<u32>,
    breakpoints: Vec<Breakpoint>,

    delayer: EventDelayer,
    /// Width of the last emitted Range block, `None` before the first.
    range: Option<u8>,
    /// Open Data block still accepting words of the current width.
    run: Option<usize>,
    /// First block of the repeating region.
    repeat_entry: usize,
    /// Entry states of fresh Data blocks in the repeating region.
    states: Vec<(usize, MatchState)>,
}

impl<'a> Compiler<'a> {
    /// Serializer width in effect; the driver programs `RNG1 = word_size`
    /// before activation, so the width is defined ahead of the first Range.
    fn width(&self) -> u8 {
        self.range.unwrap_or(self.word_size)
    }

    fn transfer_state(&self) -> TransferState {
        TransferState {
            delayer: self.delayer.clone(),
            width: self.width(),
        }
    }

    fn word(&mut self, index: usize, word: u32, size: u8) -> Result<(), CompileError> {
        self.flush_due();
        if !self.delayer.is_empty() && size != self.word_size {
            return Err(CompileError::GpioWithinPartialWord);
        }
        self.push_word(index.checked_sub(self.loop_start), word, size);
        self.delayer.advance();
        Ok(())
    }

    /// Emit a Gpio block for any edges that are due, closing the open run.
    fn flush_due(&mut self) {
        if let Some(group) = self.delayer.take_due() {
            self.run = None;
            let data_index = self.data.len();
            self.data.extend(group.words());
            let next = self.blocks.len() + 1;
            self.blocks.push(ControlBlock::Gpio { data_index, next });
        }
    }

    /// Append one word: extend the open run, or start a fresh Data block
    /// (with a Range block after it on a width change).
    ///
    /// `cursor` is the word's loop-relative event index, `None` when it does
    /// not belong to the repeating region.
    fn push_word(&mut self, cursor: Option<usize>, word: u32, size: u8) {
        if let Some(run) = self.run {
            if self.range == Some(size) {
                match &mut self.blocks[run] {
                    ControlBlock::Data { length, .. } => *length += 1,
                    _ => unreachable!(),
                }
                self.data.push(word);
                return;
            }
        }
        if let Some(cursor) = cursor {
            self.states.push((
                self.blocks.len(),
                MatchState {
                    cursor,
                    delayer: self.delayer.clone(),
                    width: self.width(),
                },
            ));
        }
        let data_index = self.data.len();
        self.data.push(word);
        let next = self.blocks.len() + 1;
        self.run = Some(self.blocks.len());
        self.blocks.push(ControlBlock::Data {
            data_index,
            length: 1,
            next,
        });
        if self.range != Some(size) {
            let range_index = self.data.len();
            self.data.push(size as u32);
            let next = self.blocks.len() + 1;
            self.blocks.push(ControlBlock::Range { range_index, next });
            self.range = Some(size);
            self.run = None;
        }
    }

    fn start_loop(&mut self) {
        // the back-edge must land on a fresh block
        self.run = None;
        self.repeat_entry = self.blocks.len();
    }

    fn breakpoint(&mut self) {
        self.run = None;
        self.breakpoints.push(Breakpoint {
            block: self.blocks.len() - 1,
            state: self.transfer_state(),
        });
    }

    /// Emit an End block; every End is also a hand-off candidate.
    fn push_end(&mut self, next: Option<usize>) {
        self.run = None;
        self.breakpoints.push(Breakpoint {
            block: self.blocks.len(),
            state: self.transfer_state(),
        });
        self.blocks.push(ControlBlock::End { next });
    }

    fn find_match(&self, state: &MatchState) -> Option<usize> {
        self.states
            .iter()
            .rev()
            .find(|(block, recorded)| *block >= self.repeat_entry && recorded == state)
            .map(|(block, _)| *block)
    }

    fn finish(mut self, repeating: bool) -> Result<Output, CompileError> {
        // edges that came due exactly at the last word land after it
        self.flush_due();
        if repeating {
            self.close_repeating()?;
        } else {
            self.close_halting()?;
        }
        self.data.push(u32::MAX);
        Ok(Output {
            blocks: self.blocks,
            data: self.data,
            breakpoints: self.breakpoints,
        })
    }

    /// Close the graph with a back-edge.
    ///
    /// With no edge left pending the End block returns straight to the
    /// repeat entry. A dangling edge forces an unrolled continuation: the
    /// loop body is replayed until every pending edge has been placed and
    /// the machine state matches the entry of an emitted block.
    fn close_repeating(&mut self) -> Result<(), CompileError> {
        if self.delayer.is_empty() {
            let entry = self.repeat_entry;
            self.push_end(Some(entry));
            return Ok(());
        }
        let events: &'a [Event] = self.events;
        let loop_events = &events[self.loop_start..];
        let mut cursor = 0;
        let mut opened = false;
        let mut guard = 3 * loop_events.len() + 3;
        loop {
            // walk to the next data word, latching replayed gpio events;
            // markers neither re-enter the loop nor re-record breakpoints
            while !matches!(loop_events[cursor], Event::Data { .. }) {
                match loop_events[cursor] {
                    Event::GpioSet(pin) => self.delayer.push(GpioEdge { pin, level: true }),
                    Event::GpioClear(pin) => self.delayer.push(GpioEdge { pin, level: false }),
                    _ => {}
                }
                cursor = (cursor + 1) % loop_events.len();
                guard -= 1;
                assert!(guard > 0, "repeat state failed to converge");
            }
            self.flush_due();
            let state = MatchState {
                cursor,
                delayer: self.delayer.clone(),
                width: self.width(),
            };
            if let Some(block) = self.find_match(&state) {
                self.push_end(Some(block));
                return Ok(());
            }
            if !opened {
                // enter the unrolled continuation
                let next = self.blocks.len() + 1;
                self.push_end(Some(next));
                opened = true;
            }
            let Event::Data { word, size } = loop_events[cursor] else {
                unreachable!()
            };
            if !self.delayer.is_empty() && size != self.word_size {
                return Err(CompileError::GpioWithinPartialWord);
            }
            self.push_word(Some(cursor), word, size);
            self.delayer.advance();
            cursor = (cursor + 1) % loop_events.len();
            guard -= 1;
            assert!(guard > 0, "repeat state failed to converge");
        }
    }

    /// Close the graph with a halting End, first replaying loop words until
    /// every dangling edge has been placed.
    fn close_halting(&mut self) -> Result<(), CompileError> {
        let events: &'a [Event] = self.events;
        let loop_events = &events[self.loop_start..];
        let mut cursor = 0;
        while !self.delayer.is_empty() {
            while !matches!(loop_events[cursor], Event::Data { .. }) {
                cursor = (cursor + 1) % loop_events.len();
            }
            let Event::Data { word, size } = loop_events[cursor] else {
                unreachable!()
            };
            if size != self.word_size {
                return Err(CompileError::GpioWithinPartialWord);
            }
            self.push_word(None, word, size);
            self.delayer.advance();
            self.flush_due();
            cursor = (cursor + 1) % loop_events.len();
        }
        self.push_end(None);
        Ok(())
    }
}
