/// Ordered MMIO access to the controller's BAR window.
///
/// Every register access goes through the `RegisterIo` trait so a mock
/// controller can stand in for hardware in tests, the same way the storage
/// layer swaps a RAM disk for a real device. The real implementation is
/// `MmioWindow` over a raw BAR pointer.
use core::ptr;
use core::sync::atomic::{fence, Ordering};

/// Fenced 32/64-bit register access.
///
/// Contract: a read fence precedes every read, a write fence precedes every
/// write, and the 64-bit write is decomposed into two 32-bit writes.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
    fn read64(&self, offset: u32) -> u64;

    /// 64-bit register write, low dword first. Some controllers do not
    /// accept 64-bit bursts; the low-then-high order is visible to hardware
    /// and must be preserved.
    fn write64(&self, offset: u32, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// A BAR-mapped register window.
pub struct MmioWindow {
    base: *mut u8,
    len: usize,
}

// The window is a handle to device registers, not host memory; access is
// serialized by the fences and by the owning queue/controller locks.
unsafe impl Send for MmioWindow {}
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// # Safety
    ///
    /// `base..base + len` must be a live MMIO mapping of the controller's
    /// register BAR, mapped uncacheable, and must outlive the window.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    fn at(&self, offset: u32) -> *mut u8 {
        debug_assert!((offset as usize) < self.len, "MMIO offset out of window");
        // Window bounds are checked above; the mapping is owned by us.
        unsafe { self.base.add(offset as usize) }
    }
}

impl RegisterIo for MmioWindow {
    fn read32(&self, offset: u32) -> u32 {
        fence(Ordering::SeqCst);
        unsafe { ptr::read_volatile(self.at(offset) as *const u32) }
    }

    fn write32(&self, offset: u32, value: u32) {
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(self.at(offset) as *mut u32, value) }
    }

    fn read64(&self, offset: u32) -> u64 {
        fence(Ordering::SeqCst);
        unsafe { ptr::read_volatile(self.at(offset) as *const u64) }
    }

    // write64 uses the default low-then-high decomposition.
}
