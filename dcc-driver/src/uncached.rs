//! Mailbox-backed uncached memory.
//!
//! Implements the core's [`UncachedAllocator`] seam with real VideoCore
//! memory: allocate and lock through the property mailbox, then map the bus
//! address through `/dev/mem` for the CPU side. Regions release everything
//! on drop, in reverse order.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use dcc::{MemoryError, UncachedAllocator, UncachedRegion, PAGE_SIZE};
use log::warn;

use crate::mailbox::{Mailbox, MailboxError, MEM_FLAG_DIRECT, MEM_FLAG_ZERO};
use crate::periph::MemMap;

/// Strips the VideoCore cache alias bits off a bus address.
const BUS_TO_PHYSICAL_MASK: u32 = 0x3FFF_FFFF;

fn wrap(error: MailboxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

/// Allocator handing out locked, mapped VideoCore memory.
pub struct UncachedMemory {
    mailbox: Arc<Mailbox>,
    mem: File,
}

impl UncachedMemory {
    /// Open the mailbox and `/dev/mem`. Needs root.
    pub fn new() -> Result<Self, MailboxError> {
        let mailbox = Mailbox::open()?;
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .map_err(MailboxError::Open)?;
        Ok(UncachedMemory {
            mailbox: Arc::new(mailbox),
            mem,
        })
    }
}

impl UncachedAllocator for UncachedMemory {
    fn allocate(&self, size: usize) -> Result<Box<dyn UncachedRegion>, MemoryError> {
        let handle = self
            .mailbox
            .mem_alloc(size as u32, PAGE_SIZE as u32, MEM_FLAG_DIRECT | MEM_FLAG_ZERO)
            .map_err(|error| MemoryError::AllocationFailed(wrap(error)))?;

        let bus_address = match self.mailbox.mem_lock(handle) {
            Ok(address) => address,
            Err(error) => {
                let _ = self.mailbox.mem_free(handle);
                return Err(MemoryError::LockFailed(wrap(error)));
            }
        };

        let physical = bus_address & BUS_TO_PHYSICAL_MASK;
        let map = match MemMap::new(self.mem.as_raw_fd(), physical as libc::off_t, size) {
            Ok(map) => map,
            Err(error) => {
                let _ = self.mailbox.mem_unlock(handle);
                let _ = self.mailbox.mem_free(handle);
                return Err(MemoryError::MapFailed(error));
            }
        };

        Ok(Box::new(MailboxRegion {
            mailbox: self.mailbox.clone(),
            handle,
            bus_address,
            map,
            size,
        }))
    }
}

struct MailboxRegion {
    mailbox: Arc<Mailbox>,
    handle: u32,
    bus_address: u32,
    map: MemMap,
    size: usize,
}

impl UncachedRegion for MailboxRegion {
    fn as_ptr(&self) -> *mut u32 {
        self.map.ptr(0)
    }

    fn bus_address(&self) -> u32 {
        self.bus_address
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MailboxRegion {
    fn drop(&mut self) {
        if let Err(error) = self.mailbox.mem_unlock(self.handle) {
            warn!("unlocking VideoCore memory failed: {error}");
        }
        if let Err(error) = self.mailbox.mem_free(self.handle) {
            warn!("releasing VideoCore memory failed: {error}");
        }
    }
}
