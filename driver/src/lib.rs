//! NVMe over PCIe block-storage driver core.
//!
//! Translates block-I/O requests into NVMe commands over paired hardware
//! ring queues (one admin pair plus per-CPU I/O pairs) and hands back
//! completions. The host environment supplies DMA, MMIO, interrupt and
//! timer services through the seams in [`mem`], [`mmio`] and [`host`];
//! everything above those seams is portable, which is how the unit tests
//! run the full engine against the RAM-backed mock controller on the host
//! target (`cargo test --target x86_64-unknown-linux-gnu --lib`).
#![no_std]
#![allow(dead_code)]

extern crate alloc;

pub mod cmd;
pub mod config;
pub mod ctrlr;
pub mod debug;
pub mod host;
pub mod io;
pub mod mem;
pub mod mmio;
pub mod module;
pub mod prp;
pub mod queue;
pub mod regs;
pub mod slot;
pub mod timeout;

#[cfg(any(test, feature = "mock-device"))]
pub mod mock;

#[cfg(test)]
mod tests;

pub use cmd::{Command, CompletionEntry, NvmeStatus, SubmissionEntry};
pub use config::ModuleConfig;
pub use ctrlr::{AsyncDone, AttachParams, Controller, PciDeviceId};
pub use io::{DsmRange, IoRequest, IoResult, Namespace};
pub use mem::{DmaBuffer, DmaConstraints, SgElem};
pub use module::DriverResource;
