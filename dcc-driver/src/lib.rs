//! # Raspberry Pi DCC driver
//!
//! The hardware half of the DCC signal generator: the VideoCore property
//! mailbox and its uncached-memory allocator, memory-mapped register shims
//! for the PWM, DMA, GPIO and clock blocks, and the [`Driver`] that owns the
//! bitstream queue and feeds the DMA engine.
//!
//! ```no_run
//! use dcc_driver::{Driver, Peripherals, UncachedMemory};
//!
//! let peripherals = Peripherals::open().unwrap();
//! let memory = UncachedMemory::new().unwrap();
//! let driver = Driver::new(peripherals, memory, 14.5).unwrap();
//!
//! let mut bitstream = dcc::Bitstream::new(14.5, 32);
//! bitstream.add_data(0xF0F0_F0F0, 32);
//! driver.queue(bitstream, false, || println!("sent")).unwrap();
//! ```

mod driver;
mod mailbox;
mod periph;
mod uncached;
mod worker;

pub use driver::{Driver, QueueError, DCC_PIN, DMA_CHANNEL};
pub use mailbox::{Mailbox, MailboxError, MEM_FLAG_DIRECT, MEM_FLAG_ZERO};
pub use periph::{Clock, Dma, Gpio, GpioFunction, Peripherals, Pwm};
pub use uncached::UncachedMemory;
pub use worker::{Scheduler, WorkQueue};
