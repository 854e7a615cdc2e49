/// Debug-mask gated subsystem dumps.
///
/// Severity filtering goes through the `log` facade; the dump helpers here
/// are additionally gated by `debugMask` bits so queue-entry hexdumps can be
/// switched on per subsystem without drowning the log.
use bitflags::bitflags;

use crate::cmd::{CompletionEntry, SubmissionEntry};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugMask: u32 {
        const CTRLR = 1 << 0;
        const NS = 1 << 1;
        const QUEUE = 1 << 2;
        const CMD = 1 << 3;
        const ADMIN = 1 << 4;
        const MGMT = 1 << 5;
        const INIT = 1 << 6;

        const DUMP_CTRLR = 1 << 16;
        const DUMP_NS = 1 << 17;
        const DUMP_SQE = 1 << 18;
        const DUMP_CQE = 1 << 19;
        const DUMP_PRP = 1 << 20;
        const DUMP_SGL = 1 << 21;
    }
}

/// Dump a submission entry. Command dumps use the ADMIN bit for queue 0 and
/// the CMD bit for I/O queues.
pub fn dump_sqe(mask: DebugMask, qid: u16, sqe: &SubmissionEntry) {
    if !mask.contains(DebugMask::DUMP_SQE) {
        return;
    }
    if (qid == 0 && !mask.contains(DebugMask::ADMIN)) || (qid > 0 && !mask.contains(DebugMask::CMD))
    {
        return;
    }
    log::trace!(
        "sqe q{} opc={:#04x} cid={} nsid={} prp1={:#x} prp2={:#x} \
         cdw10={:#x} cdw11={:#x} cdw12={:#x} cdw14={:#x}",
        qid,
        sqe.opcode(),
        sqe.cid(),
        sqe.nsid,
        sqe.prp1,
        sqe.prp2,
        sqe.cdw10,
        sqe.cdw11,
        sqe.cdw12,
        sqe.cdw14,
    );
}

pub fn dump_cqe(mask: DebugMask, qid: u16, cqe: &CompletionEntry) {
    if !mask.contains(DebugMask::DUMP_CQE) {
        return;
    }
    log::trace!(
        "cqe q{} cid={} sqhd={} phase={} sct={:#x} sc={:#x} dnr={} dw0={:#x}",
        qid,
        cqe.cid(),
        cqe.sq_head(),
        cqe.phase(),
        cqe.sct(),
        cqe.sc(),
        cqe.dnr(),
        cqe.dw0,
    );
}

pub fn dump_prp_entry(mask: DebugMask, index: usize, entry: u64) {
    if mask.contains(DebugMask::DUMP_PRP) {
        log::trace!("prp list [{}] = {:#018x}", index, entry);
    }
}
