//! Memory-mapped BCM283x peripherals.
//!
//! One `/dev/mem` mapping covers the whole peripheral span; the accessors
//! hand out lightweight register shims borrowing it. The physical base
//! differs between SoC generations and is read from the device tree, with
//! the BCM2836/7 address as fallback.

use std::fs::{self, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::AsRawFd;
use std::ptr;

mod clock;
mod dma;
mod gpio;
mod pwm;

pub use clock::{Clock, OSCILLATOR_MHZ};
pub(crate) use clock::divisor_for;
pub use dma::Dma;
pub use gpio::{Gpio, GpioFunction};
pub use pwm::Pwm;

/// Address of the peripherals on the VideoCore bus.
pub const PERIPHERAL_BUS_BASE: u32 = 0x7E00_0000;

const PERIPHERAL_SPAN: usize = 0x0100_0000;
const RANGES_PATH: &str = "/proc/device-tree/soc/ranges";
const BCM2836_PERIPHERAL_PHYS: u32 = 0x3F00_0000;

const GPIO_OFFSET: usize = 0x0020_0000;
const PWM_OFFSET: usize = 0x0020_C000;
const CLOCK_OFFSET: usize = 0x0010_1000;
const DMA_OFFSET: usize = 0x0000_7000;
const DMA_CHANNEL_SPAN: usize = 0x100;
const DMA_ENABLE_OFFSET: usize = 0x0000_7FF0;

pub(crate) struct MemMap {
    base: *mut u32,
    length: usize,
}

// The mapping is plain shared memory; the pointer itself is safe to move
// between threads.
unsafe impl Send for MemMap {}

impl MemMap {
    pub(crate) fn new(fd: libc::c_int, offset: libc::off_t, length: usize) -> io::Result<MemMap> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MemMap {
            base: base as *mut u32,
            length,
        })
    }

    pub(crate) fn ptr(&self, byte_offset: usize) -> *mut u32 {
        debug_assert!(byte_offset < self.length);
        unsafe { self.base.add(byte_offset / 4) }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.length);
        }
    }
}

/// Physical address of the peripheral span for this board.
fn physical_base() -> u32 {
    let Ok(ranges) = fs::read(RANGES_PATH) else {
        return BCM2836_PERIPHERAL_PHYS;
    };
    let word = |index: usize| -> Option<u32> {
        ranges
            .get(index..index + 4)
            .map(|bytes| u32::from_be_bytes(bytes.try_into().unwrap()))
    };
    // cell layout: <bus address> <physical address> <span>; BCM2711 uses a
    // 64-bit physical cell, leaving the first word zero
    match word(4) {
        Some(0) => word(8).unwrap_or(BCM2836_PERIPHERAL_PHYS),
        Some(base) => base,
        None => BCM2836_PERIPHERAL_PHYS,
    }
}

/// One mapped view of the SoC peripherals.
pub struct Peripherals {
    map: MemMap,
}

impl Peripherals {
    /// Map the peripheral span through `/dev/mem`. Needs root.
    pub fn open() -> io::Result<Peripherals> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/mem")?;
        let map = MemMap::new(
            file.as_raw_fd(),
            physical_base() as libc::off_t,
            PERIPHERAL_SPAN,
        )?;
        Ok(Peripherals { map })
    }

    pub fn pwm(&self) -> Pwm<'_> {
        Pwm::new(self.map.ptr(PWM_OFFSET))
    }

    pub fn gpio(&self) -> Gpio<'_> {
        Gpio::new(self.map.ptr(GPIO_OFFSET))
    }

    pub fn clock(&self) -> Clock<'_> {
        Clock::new(self.map.ptr(CLOCK_OFFSET))
    }

    pub fn dma(&self, channel: usize) -> Dma<'_> {
        assert!(channel < 15, "DMA channels 0-14 are register mapped");
        Dma::new(
            self.map.ptr(DMA_OFFSET + channel * DMA_CHANNEL_SPAN),
            self.map.ptr(DMA_ENABLE_OFFSET),
            channel,
        )
    }
}

/// Volatile register access shared by the shims.
pub(crate) struct Registers<'a> {
    base: *mut u32,
    _map: PhantomData<&'a ()>,
}

impl<'a> Registers<'a> {
    pub(crate) fn new(base: *mut u32) -> Registers<'a> {
        Registers {
            base,
            _map: PhantomData,
        }
    }

    pub(crate) fn read(&self, register: usize) -> u32 {
        unsafe { self.base.add(register).read_volatile() }
    }

    pub(crate) fn write(&mut self, register: usize, value: u32) {
        unsafe { self.base.add(register).write_volatile(value) }
    }

    pub(crate) fn modify(&mut self, register: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read(register);
        self.write(register, f(value));
    }
}
