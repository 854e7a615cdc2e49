/// NVMe controller register window layout (NVMe 1.x over PCIe).
///
/// Offsets are fixed by the specification. Doorbell registers start at
/// 0x1000 with a stride derived from CAP.DSTRD.
use bitflags::bitflags;

pub const CAP: u32 = 0x00; // Controller Capabilities (64-bit)
pub const VS: u32 = 0x08; // Version
pub const INTMS: u32 = 0x0C; // Interrupt Mask Set
pub const INTMC: u32 = 0x10; // Interrupt Mask Clear
pub const CC: u32 = 0x14; // Controller Configuration
pub const CSTS: u32 = 0x1C; // Controller Status
pub const AQA: u32 = 0x24; // Admin Queue Attributes
pub const ASQ: u32 = 0x28; // Admin Submission Queue Base Address (64-bit)
pub const ACQ: u32 = 0x30; // Admin Completion Queue Base Address (64-bit)

/// Base of the doorbell register array.
pub const DOORBELL_BASE: u32 = 0x1000;

// CC fields. EN/SHN are flag-like; the queue-entry-size and page-size
// fields are multi-bit and built through `cc_enable_value`.
pub const CC_EN: u32 = 1 << 0;
pub const CC_CSS_SHIFT: u32 = 4; // I/O Command Set Selected (0 = NVM)
pub const CC_MPS_SHIFT: u32 = 7; // Memory Page Size (0 = 4 KiB)
pub const CC_AMS_SHIFT: u32 = 11; // Arbitration (0 = round robin)
pub const CC_SHN_SHIFT: u32 = 14; // Shutdown Notification
pub const CC_IOSQES_SHIFT: u32 = 16; // I/O SQ entry size, 2^n
pub const CC_IOCQES_SHIFT: u32 = 20; // I/O CQ entry size, 2^n

bitflags! {
    /// Controller Status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0; // Ready
        const CFS = 1 << 1; // Controller Fatal Status
        const SHST_OCCURRING = 1 << 2;
        const SHST_COMPLETE = 1 << 3;
        const NSSRO = 1 << 4;
        const PP = 1 << 5;
    }
}

/// CC value that enables the controller: 64-byte SQEs, 16-byte CQEs,
/// 4 KiB pages, NVM command set, round-robin arbitration.
pub fn cc_enable_value() -> u32 {
    (4 << CC_IOCQES_SHIFT) | (6 << CC_IOSQES_SHIFT) | CC_EN
}

/// Controller Capabilities register accessor.
#[derive(Debug, Clone, Copy)]
pub struct Cap(pub u64);

impl Cap {
    /// Maximum queue entries supported (1-based).
    pub fn max_queue_entries(&self) -> u16 {
        ((self.0 & 0xFFFF) as u16).wrapping_add(1)
    }

    /// Worst-case enable/disable transition time, in 500 ms units.
    pub fn timeout_500ms(&self) -> u32 {
        ((self.0 >> 24) & 0xFF) as u32
    }

    /// Doorbell stride exponent: stride in bytes is `4 << dstrd`.
    pub fn doorbell_stride(&self) -> u32 {
        ((self.0 >> 32) & 0xF) as u32
    }

    /// Minimum memory page size exponent (page = 2^(12 + mpsmin)).
    pub fn mps_min(&self) -> u32 {
        ((self.0 >> 48) & 0xF) as u32
    }
}

/// Submission queue tail doorbell offset for `qid`.
pub fn sq_tail_doorbell(qid: u16, dstrd: u32) -> u32 {
    DOORBELL_BASE + (2 * qid as u32) * (4 << dstrd)
}

/// Completion queue head doorbell offset for `qid`.
pub fn cq_head_doorbell(qid: u16, dstrd: u32) -> u32 {
    DOORBELL_BASE + (2 * qid as u32 + 1) * (4 << dstrd)
}

/// AQA register value: 0-based admin SQ/CQ sizes.
pub fn aqa_value(sq_size: u16, cq_size: u16) -> u32 {
    ((cq_size as u32 - 1) << 16) | (sq_size as u32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_stride_zero() {
        // Stride 4 bytes: SQ0 at 0x1000, CQ0 at 0x1004, SQ1 at 0x1008.
        assert_eq!(sq_tail_doorbell(0, 0), 0x1000);
        assert_eq!(cq_head_doorbell(0, 0), 0x1004);
        assert_eq!(sq_tail_doorbell(1, 0), 0x1008);
        assert_eq!(cq_head_doorbell(1, 0), 0x100C);
    }

    #[test]
    fn doorbell_offsets_wide_stride() {
        // DSTRD=2: 16-byte stride.
        assert_eq!(sq_tail_doorbell(0, 2), 0x1000);
        assert_eq!(cq_head_doorbell(0, 2), 0x1010);
        assert_eq!(sq_tail_doorbell(3, 2), 0x1060);
    }

    #[test]
    fn cap_fields() {
        // MQES=1023, TO=30 (15s), DSTRD=0.
        let cap = Cap(0x3FF | (30 << 24));
        assert_eq!(cap.max_queue_entries(), 1024);
        assert_eq!(cap.timeout_500ms(), 30);
        assert_eq!(cap.doorbell_stride(), 0);
    }

    #[test]
    fn aqa_encoding() {
        assert_eq!(aqa_value(256, 256), 0x00FF_00FF);
        assert_eq!(aqa_value(16, 16), 0x000F_000F);
    }
}
