/// Seams to the hosting environment: interrupt plumbing and a coarse clock.
///
/// Both the real kernel services and the mock test environment implement
/// these traits; the driver core never talks to the platform directly.
use core::fmt;

use alloc::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
pub enum HostError {
    NoResources,
    Unsupported,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::NoResources => write!(f, "host resources exhausted"),
            HostError::Unsupported => write!(f, "operation not supported by host"),
        }
    }
}

/// Interrupt delivery regime granted by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptType {
    Msix,
    Msi,
    /// Legacy line interrupt.
    IntX,
}

/// A registered interrupt handler. Invoked from interrupt context on an
/// arbitrary CPU; must only take the CQ-side locks.
pub type IntrHandler = Arc<dyn Fn() + Send + Sync>;

/// Interrupt vector management.
pub trait InterruptOps: Send + Sync {
    /// Allocate `desired` vectors of the platform's best regime, freeing any
    /// previous allocation. Returns the number granted (MSI/legacy grant 1).
    fn alloc_vectors(&self, desired: u32) -> Result<u32, HostError>;

    fn vector_count(&self) -> u32;

    fn intr_type(&self) -> InterruptType;

    fn register(&self, vector: u32, handler: IntrHandler) -> Result<(), HostError>;

    fn unregister(&self, vector: u32);

    fn enable(&self, vector: u32);

    /// Wait out any in-flight invocation of the handler, then disable the
    /// vector. After return no handler can run.
    fn sync_and_disable(&self, vector: u32);
}

/// Monotonic coarse clock. Also hosts the ~1 s timeout tick: the host timer
/// calls `Controller::timeout_tick` at that cadence.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}
