//! The bitstream scheduler.
//!
//! [`Driver`] owns the queue of committed graphs and the DMA channel that
//! plays them. All state lives on one serial work queue; `queue`, `stop`
//! and `shutdown` submit jobs there and block for the result, so compile
//! and commit errors surface to the caller while transmission continues in
//! the background.
//!
//! The scheduler never reads the engine's position from hardware. Each
//! graph's Start and End blocks write a sentinel into the graph's own data
//! pool; 1 ms watchers poll the sentinels to trim the queue and fire
//! completion callbacks (on a separate callback thread, so a callback can
//! re-enter the driver). A 10 ms watchdog clears latched PWM and DMA error
//! flags.
//!
//! Track power follows the signal itself: boosters enable their H-bridge
//! while transitions are present and brake shortly after they stop. The
//! driver therefore brackets non-repeating traffic with a power-on
//! bitstream of one-bits and a power-off bitstream that goes quiet and
//! halts the engine.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dcc::{Bitstream, CommitError, CompileError, Pin, QueuedBitstream};
use log::{debug, error, warn};

use crate::periph::{divisor_for, GpioFunction, Peripherals};
use crate::uncached::UncachedMemory;
use crate::worker::{Scheduler, WorkQueue};

/// DCC output pin: PWM0 on its alternate function 5.
pub const DCC_PIN: u32 = 18;

/// DMA channel dedicated to the signal.
pub const DMA_CHANNEL: usize = 5;

const WORD_SIZE: u8 = 32;
const DREQ_THRESHOLD: u32 = 1;
const WATCHER_INTERVAL: Duration = Duration::from_millis(1);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);

/// One-bits emitted before traffic so the booster re-enables power.
const POWER_ON_MICROSECONDS: f32 = 100_000.0;

/// Quiet words emitted before the engine halts.
const POWER_OFF_WORDS: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("driver is shut down")]
    ShutDown,
}

type Completion = Box<dyn FnOnce() + Send>;

/// A stretch of one-bits: four high and four low serializer bits per DCC
/// bit at the standard rate.
fn power_on_bitstream(bit_duration: f32) -> Bitstream {
    let word_duration = bit_duration * WORD_SIZE as f32;
    let words = (POWER_ON_MICROSECONDS / word_duration).ceil() as usize;
    let mut bitstream = Bitstream::new(bit_duration, WORD_SIZE);
    for _ in 0..words {
        bitstream.add_data(0xF0F0_F0F0, WORD_SIZE);
    }
    bitstream
}

/// Drops the auxiliary pins, goes quiet and lets the booster brake.
fn power_off_bitstream(bit_duration: f32) -> Bitstream {
    let mut bitstream = Bitstream::new(bit_duration, WORD_SIZE);
    bitstream.clear(Pin::RailCom);
    bitstream.clear(Pin::Debug);
    for _ in 0..POWER_OFF_WORDS {
        bitstream.add_data(0, WORD_SIZE);
    }
    bitstream
}

struct Entry {
    graph: QueuedBitstream,
    completion: Option<Completion>,
    transmitting_at: Option<Instant>,
    queued_at: Instant,
}

impl Entry {
    fn pass_duration(&self) -> Duration {
        Duration::from_micros(self.graph.duration() as u64)
    }
}

struct DriverState {
    peripherals: Peripherals,
    memory: UncachedMemory,
    callbacks: Scheduler<()>,
    running: Arc<AtomicBool>,
    bit_duration: f32,
    queue: VecDeque<Entry>,
    requires_power_on: bool,
    watcher_armed: bool,
    stall_logged: bool,
}

/// Owner of the DCC signal: hardware setup, the bitstream queue, and the
/// watchers that keep both in step.
pub struct Driver {
    work: WorkQueue<DriverState>,
    _callbacks: WorkQueue<()>,
    running: Arc<AtomicBool>,
}

impl Driver {
    /// Initialise the hardware and start the worker and watchdog.
    pub fn new(
        peripherals: Peripherals,
        memory: UncachedMemory,
        bit_duration: f32,
    ) -> io::Result<Driver> {
        let callbacks = WorkQueue::spawn("dcc-callbacks", ())?;
        let running = Arc::new(AtomicBool::new(true));
        let state = DriverState {
            peripherals,
            memory,
            callbacks: callbacks.scheduler(),
            running: running.clone(),
            bit_duration,
            queue: VecDeque::new(),
            requires_power_on: true,
            watcher_armed: false,
            stall_logged: false,
        };
        let work = WorkQueue::spawn("dcc-driver", state)?;
        work.call(|state, scheduler| {
            state.setup();
            state.arm_watchdog(scheduler);
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "driver worker exited during setup"))?;
        Ok(Driver {
            work,
            _callbacks: callbacks,
            running,
        })
    }

    /// Compile, commit and append `bitstream`; `completion` fires once it
    /// has played through at least once.
    ///
    /// Non-repeating traffic is bracketed with the power-on and power-off
    /// bitstreams as needed. Compile and commit failures are returned
    /// directly and leave the queue as it was; after [`shutdown`] the call
    /// fails with [`QueueError::ShutDown`].
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn queue(
        &self,
        bitstream: Bitstream,
        repeating: bool,
        completion: impl FnOnce() + Send + 'static,
    ) -> Result<(), QueueError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        self.work
            .call(move |state, scheduler| {
                state.enqueue(&bitstream, repeating, Some(Box::new(completion)), scheduler)
            })
            .unwrap_or(Err(QueueError::ShutDown))
    }

    /// Power the track down. `completion` fires once the line is quiet; if
    /// it already is, it fires immediately.
    pub fn stop(&self, completion: impl FnOnce() + Send + 'static) -> Result<(), QueueError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        self.work
            .call(move |state, scheduler| state.stop(Box::new(completion), scheduler))
            .unwrap_or(Err(QueueError::ShutDown))
    }

    /// Disable PWM and DMA, drain the watchers and release every queued
    /// graph. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.work.call(|state, _| state.teardown());
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DriverState {
    fn setup(&mut self) {
        let mut gpio = self.peripherals.gpio();
        gpio.select_function(Pin::RailCom as u32, GpioFunction::Output);
        gpio.select_function(Pin::Debug as u32, GpioFunction::Output);
        gpio.clear(Pin::RailCom as u32);
        gpio.clear(Pin::Debug as u32);
        gpio.select_function(DCC_PIN, GpioFunction::Alt5);

        let mut clock = self.peripherals.clock();
        clock.start_pwm(divisor_for(self.bit_duration));

        let mut pwm = self.peripherals.pwm();
        pwm.reset();
        // the compiler counts on this width being live before the first
        // Range block executes
        pwm.set_range(WORD_SIZE as u32);
        pwm.enable_dma(DREQ_THRESHOLD);
        pwm.enable_serializer();

        let mut dma = self.peripherals.dma(DMA_CHANNEL);
        dma.enable();
        dma.reset();
        debug!(
            "hardware ready: pwm divisor {}, dma channel {}",
            divisor_for(self.bit_duration),
            DMA_CHANNEL
        );
    }

    fn enqueue(
        &mut self,
        bitstream: &Bitstream,
        repeating: bool,
        completion: Option<Completion>,
        scheduler: &Scheduler<DriverState>,
    ) -> Result<(), QueueError> {
        // shutdown may have been serialized ahead of this job
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        if self.requires_power_on {
            let power_on = power_on_bitstream(self.bit_duration);
            self.push_graph(&power_on, true, None)?;
            self.requires_power_on = false;
        }
        self.push_graph(bitstream, true, completion)?;
        if !repeating {
            let power_off = power_off_bitstream(self.bit_duration);
            self.push_graph(&power_off, false, None)?;
            self.requires_power_on = true;
        }
        self.start_if_idle();
        self.arm_watcher(scheduler);
        Ok(())
    }

    fn stop(
        &mut self,
        completion: Completion,
        scheduler: &Scheduler<DriverState>,
    ) -> Result<(), QueueError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        if self.requires_power_on {
            self.callbacks.run(move |_, _| completion());
            return Ok(());
        }
        let power_off = power_off_bitstream(self.bit_duration);
        self.push_graph(&power_off, false, Some(completion))?;
        self.requires_power_on = true;
        self.start_if_idle();
        self.arm_watcher(scheduler);
        Ok(())
    }

    /// Compile `bitstream`, commit it, and stitch it onto the queue's tail.
    fn push_graph(
        &mut self,
        bitstream: &Bitstream,
        repeating: bool,
        completion: Option<Completion>,
    ) -> Result<(), QueueError> {
        let (mut graph, offsets) = match self.queue.back() {
            Some(previous) => {
                QueuedBitstream::transfer_from(&previous.graph, bitstream, repeating)?
            }
            None => (QueuedBitstream::compile(bitstream, repeating)?, Vec::new()),
        };
        graph.commit(&self.memory)?;
        if let Some(previous) = self.queue.back() {
            previous.graph.transfer_to(&graph, &offsets);
        }
        debug!(
            "queued {} control blocks, {:.0}µs per pass",
            graph.blocks().len(),
            graph.duration()
        );
        self.queue.push_back(Entry {
            graph,
            completion,
            transmitting_at: None,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    fn start_if_idle(&mut self) {
        let mut dma = self.peripherals.dma(DMA_CHANNEL);
        if dma.is_active() {
            return;
        }
        if let Some(entry) = self.queue.iter().find(|entry| !entry.graph.is_repeating()) {
            let address = entry
                .graph
                .bus_address()
                .expect("queued graphs are committed");
            debug!("dma idle, starting at {address:#010x}");
            dma.start(address);
            self.stall_logged = false;
        }
    }

    fn arm_watcher(&mut self, scheduler: &Scheduler<DriverState>) {
        if self.watcher_armed || self.queue.is_empty() {
            return;
        }
        self.watcher_armed = true;
        scheduler.after(WATCHER_INTERVAL, |state, scheduler| state.watch(scheduler));
    }

    fn watch(&mut self, scheduler: &Scheduler<DriverState>) {
        self.watcher_armed = false;
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.poll();
        self.arm_watcher(scheduler);
    }

    fn poll(&mut self) {
        // a graph that has started transmitting obsoletes its predecessors
        while self.queue.len() > 1 {
            if self.queue[1].graph.is_transmitting() && self.queue[0].completion.is_none() {
                let entry = self.queue.pop_front().unwrap();
                debug!(
                    "hand-off complete, releasing {} blocks",
                    entry.graph.blocks().len()
                );
            } else {
                break;
            }
        }

        // a graph that has looped at least once and played for its full
        // duration completes
        for entry in self.queue.iter_mut() {
            if entry.transmitting_at.is_none() && entry.graph.is_transmitting() {
                entry.transmitting_at = Some(Instant::now());
            }
            if entry.graph.is_repeating() && entry.completion.is_some() {
                let started = entry.transmitting_at.unwrap_or(entry.queued_at);
                if started.elapsed() >= entry.pass_duration() {
                    let completion = entry.completion.take().unwrap();
                    self.callbacks.run(move |_, _| completion());
                }
            }
        }

        let active = self.peripherals.dma(DMA_CHANNEL).is_active();
        if !active {
            if let Some(front) = self.queue.front() {
                if self.queue.len() == 1
                    && front.graph.is_repeating()
                    && front.completion.is_none()
                {
                    // the tail terminator has played out and halted the engine
                    let entry = self.queue.pop_front().unwrap();
                    drop(entry);
                    debug!("terminator finished, queue empty");
                } else if !front.graph.is_transmitting() && !self.stall_logged {
                    self.stall_logged = true;
                    error!(
                        "dma inactive with {} bitstreams queued; shutdown and restart required",
                        self.queue.len()
                    );
                }
            }
        }
    }

    fn arm_watchdog(&mut self, scheduler: &Scheduler<DriverState>) {
        scheduler.after(WATCHDOG_INTERVAL, |state, scheduler| {
            state.watchdog(scheduler)
        });
    }

    fn watchdog(&mut self, scheduler: &Scheduler<DriverState>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut pwm = self.peripherals.pwm();
            // BERR reads as set on every pass; clear it without logging.
            // TODO: work out why the serializer leaves BERR permanently
            // asserted after FIFO use.
            if pwm.bus_error() {
                pwm.clear_bus_error();
            }
            if pwm.fifo_write_error() {
                warn!("pwm fifo write error");
                pwm.clear_fifo_write_error();
            }
            if pwm.fifo_read_error() {
                warn!("pwm fifo read error");
                pwm.clear_fifo_read_error();
            }
            if pwm.channel_gap() {
                warn!("pwm channel gap");
                pwm.clear_channel_gap();
            }
        }
        {
            let mut dma = self.peripherals.dma(DMA_CHANNEL);
            if dma.read_error() {
                warn!("dma read error");
                dma.clear_read_error();
            }
            if dma.fifo_error() {
                warn!("dma fifo error");
                dma.clear_fifo_error();
            }
            if dma.read_last_not_set() {
                warn!("dma read without last signal");
                dma.clear_read_last_not_set();
            }
        }
        self.arm_watchdog(scheduler);
    }

    fn teardown(&mut self) {
        let mut pwm = self.peripherals.pwm();
        pwm.disable();
        let mut dma = self.peripherals.dma(DMA_CHANNEL);
        dma.abort();
        self.queue.clear();
        let mut gpio = self.peripherals.gpio();
        gpio.clear(Pin::RailCom as u32);
        gpio.clear(Pin::Debug as u32);
        gpio.select_function(DCC_PIN, GpioFunction::Input);
        gpio.select_function(Pin::RailCom as u32, GpioFunction::Input);
        gpio.select_function(Pin::Debug as u32, GpioFunction::Input);
        debug!("driver shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcc::ControlBlock;

    #[test]
    fn power_on_covers_the_booster_window() {
        let bitstream = power_on_bitstream(14.5);
        assert!(bitstream.duration() >= POWER_ON_MICROSECONDS);
        // every word is one-bits at the DCC half-period
        assert!(bitstream
            .events()
            .iter()
            .all(|event| matches!(event, dcc::Event::Data { word: 0xF0F0_F0F0, size: 32 })));
    }

    #[test]
    fn power_off_clears_aux_pins_then_goes_quiet() {
        let bitstream = power_off_bitstream(14.5);
        assert!(matches!(
            bitstream.events()[0],
            dcc::Event::GpioClear(Pin::RailCom)
        ));
        assert!(matches!(
            bitstream.events()[1],
            dcc::Event::GpioClear(Pin::Debug)
        ));
        let zeros = bitstream
            .events()
            .iter()
            .filter(|event| matches!(event, dcc::Event::Data { word: 0, .. }))
            .count();
        assert_eq!(zeros, POWER_OFF_WORDS);
    }

    #[test]
    fn power_off_compiles_to_a_halting_graph() {
        let bitstream = power_off_bitstream(14.5);
        let graph = QueuedBitstream::compile(&bitstream, false).unwrap();
        assert!(matches!(
            graph.blocks().last(),
            Some(ControlBlock::End { next: None })
        ));
        // the pin clears fire two words in, well before the halt
        assert!(graph
            .blocks()
            .iter()
            .any(|block| matches!(block, ControlBlock::Gpio { .. })));
    }

    #[test]
    fn power_bitstreams_hand_off_to_each_other() {
        let on = QueuedBitstream::compile(&power_on_bitstream(14.5), true).unwrap();
        let (off, offsets) =
            QueuedBitstream::transfer_from(&on, &power_off_bitstream(14.5), false).unwrap();
        // the hand-off lands on the power-on End block and the width
        // carries over, so the successor starts straight into data
        assert!(!offsets.is_empty());
        assert!(matches!(off.blocks()[1], ControlBlock::Data { .. }));
    }
}
