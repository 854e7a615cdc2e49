/// Block I/O submission and completion.
///
/// A host request carries a scatter-gather array that may not be virtually
/// contiguous; NVMe cannot express a discontinuity inside one command, so
/// the request splits into a parent command plus children, all tracked
/// through the parent slot's accounting. The parent completes upward only
/// when every hardware command has completed.
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::cmd::{NvmOpcode, NvmeStatus, SubmissionEntry};
use crate::mem::SgElem;
use crate::prp;
use crate::queue::QueuePair;
use crate::slot::{CmdContext, CmdId, CommandSlot, CompletionPhase, IoBase};

const NS_FLAG_ONLINE: u32 = 1 << 0;

/// A namespace as the I/O path sees it: identity, block geometry, and an
/// online flag consulted at submit time.
pub struct Namespace {
    id: u32,
    lba_shift: u8,
    /// End-to-end protection type from the namespace format; 0 = none.
    prot_type: u8,
    flags: AtomicU32,
}

impl Namespace {
    pub fn new(id: u32, lba_shift: u8) -> Self {
        Self {
            id,
            lba_shift,
            prot_type: 0,
            flags: AtomicU32::new(NS_FLAG_ONLINE),
        }
    }

    pub fn with_protection(id: u32, lba_shift: u8, prot_type: u8) -> Self {
        Self {
            id,
            lba_shift,
            prot_type,
            flags: AtomicU32::new(NS_FLAG_ONLINE),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn lba_shift(&self) -> u8 {
        self.lba_shift
    }

    #[inline]
    pub fn prot_type(&self) -> u8 {
        self.prot_type
    }

    pub fn is_online(&self) -> bool {
        self.flags.load(Ordering::Acquire) & NS_FLAG_ONLINE != 0
    }

    pub fn set_online(&self, online: bool) {
        if online {
            self.flags.fetch_or(NS_FLAG_ONLINE, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!NS_FLAG_ONLINE, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    DatasetMgmt,
}

/// Outcome handed to the request's completion callback.
#[derive(Debug, Clone, Copy)]
pub struct IoResult {
    pub status: NvmeStatus,
    pub bytes_xferred: u32,
}

pub type IoDone = Box<dyn FnOnce(IoResult) + Send>;

/// An upper-layer block request. The SG array is already mapped to IO
/// addresses and its element boundaries are PRP-splittable points.
pub struct IoRequest {
    pub op: IoOp,
    pub lba: u64,
    pub lba_count: u32,
    pub sg: Vec<SgElem>,
    /// Force Unit Access on Read/Write.
    pub fua: bool,
    /// Protection-information check bits, passed through unchanged.
    pub prinfo: u8,
    /// Metadata pointer for PI passthrough; 0 = none. Advanced 8 bytes per
    /// LBA already submitted when the request splits.
    pub meta_io_addr: u64,
    pub done: IoDone,
}

impl IoRequest {
    pub fn read(lba: u64, lba_count: u32, sg: Vec<SgElem>, done: IoDone) -> Self {
        Self {
            op: IoOp::Read,
            lba,
            lba_count,
            sg,
            fua: false,
            prinfo: 0,
            meta_io_addr: 0,
            done,
        }
    }

    pub fn write(lba: u64, lba_count: u32, sg: Vec<SgElem>, done: IoDone) -> Self {
        Self {
            op: IoOp::Write,
            lba,
            lba_count,
            sg,
            fua: false,
            prinfo: 0,
            meta_io_addr: 0,
            done,
        }
    }
}

/// A Dataset Management range; 16 bytes on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsmRange {
    pub context_attrs: u32,
    pub lba_count: u32,
    pub start_lba: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<DsmRange>(), 16);

/// Ranges that fit the per-slot PRP page.
pub const MAX_DSM_RANGES: usize = crate::mem::PAGE_SIZE / core::mem::size_of::<DsmRange>();

/// Submit a read/write request, splitting it into as many hardware commands
/// as its SG array demands. `Ok(())` means every byte was handed to
/// hardware (or enough of it that the shortfall will surface as an underrun
/// through the completion callback).
pub(crate) fn submit_io_request(
    qp: &QueuePair,
    ns: &Namespace,
    request: IoRequest,
    in_reset: bool,
    timeout_id: u32,
    sg_max_entries: u32,
) -> Result<(), NvmeStatus> {
    if !ns.is_online() {
        log::debug!("request for offline namespace {}", ns.id());
        return Err(NvmeStatus::Quiesced);
    }
    if in_reset {
        return Err(NvmeStatus::InReset);
    }
    if request.prinfo != 0 && ns.prot_type() == 0 {
        log::debug!(
            "PI-checked command for namespace {} without PI format",
            ns.id()
        );
        return Err(NvmeStatus::InvalidPi);
    }
    if request.sg.len() as u32 > sg_max_entries {
        // The upper layer owns the constraint set; exceeding it is a policy
        // bug there, not a hardware condition.
        log::error!(
            "SG element count {} exceeds PRP capacity {}",
            request.sg.len(),
            sg_max_entries
        );
        debug_assert!(false, "SG element count exceeds PRP capacity");
        return Err(NvmeStatus::InvalidParam);
    }
    let sector_mask = (1u32 << ns.lba_shift()) - 1;
    let required: u32 = request.sg.iter().map(|e| e.length).sum();
    if required == 0 || required & sector_mask != 0 {
        log::error!("request length {} not a sector multiple", required);
        return Err(NvmeStatus::InvalidParam);
    }

    qp.enter();
    let result = do_submit(qp, ns, request, timeout_id, required);
    qp.leave();
    result
}

fn do_submit(
    qp: &QueuePair,
    ns: &Namespace,
    request: IoRequest,
    timeout_id: u32,
    required: u32,
) -> Result<(), NvmeStatus> {
    let lba_shift = ns.lba_shift();
    let expected = request.lba_count << lba_shift;
    let mut request = Some(request);
    let mut base_cid: Option<CmdId> = None;
    let mut requested: u32 = 0;
    let mut fail_status: Option<NvmeStatus> = None;

    loop {
        let Some(slot) = qp.slots.acquire() else {
            log::debug!("q{}: failing request, queue full", qp.qid());
            fail_status = Some(NvmeStatus::QueueFull);
            break;
        };
        let is_base = base_cid.is_none();
        let req = request.as_ref().unwrap();

        // Build PRPs over the SG suffix and stage the command.
        let build = {
            let mut data = slot.data.lock();
            let list_io_addr = slot.prp_page_io_addr();
            let mut page = data.prp_page.take().unwrap();
            let built = prp::build_prps(
                &req.sg,
                requested,
                required - requested,
                &mut page,
                list_io_addr,
            );
            data.prp_page = Some(page);
            match built {
                Ok(build) => {
                    let op = match req.op {
                        IoOp::Read => NvmOpcode::Read,
                        IoOp::Write => NvmOpcode::Write,
                        _ => unreachable!("split path only carries reads and writes"),
                    };
                    let start_lba = req.lba + (requested >> lba_shift) as u64;
                    let num_lba = (build.processed >> lba_shift) - 1;
                    let mut sqe = SubmissionEntry::nvm_io(op, ns.id(), start_lba, num_lba as u16);
                    sqe.prp1 = build.prp1;
                    sqe.prp2 = build.prp2;
                    sqe.set_fua(req.fua);
                    if ns.prot_type() != 0 {
                        sqe.set_prinfo(req.prinfo);
                        sqe.set_exp_ref_tag(start_lba as u32);
                        if req.meta_io_addr != 0 {
                            sqe.mptr =
                                req.meta_io_addr + (((requested >> lba_shift) as u64) << 3);
                        }
                    }
                    data.sqe = sqe;
                    data.status = NvmeStatus::Success;
                    data.ctx = if is_base {
                        CmdContext::IoBase(IoBase {
                            request: None,
                            required_length: required,
                            requested_length: 0,
                            expected_length: expected,
                            cmd_count: 0,
                            submitting: true,
                            phase: CompletionPhase::PreComplete,
                            status: NvmeStatus::Success,
                        })
                    } else {
                        CmdContext::IoChild {
                            base: base_cid.unwrap(),
                        }
                    };
                    Some(build)
                }
                Err(err) => {
                    log::error!(
                        "q{}: bad SG position at offset {}: {}",
                        qp.qid(),
                        requested,
                        err
                    );
                    None
                }
            }
        };
        let Some(build) = build else {
            debug_assert!(false, "split points must land on element boundaries");
            qp.slots.release(slot);
            fail_status = Some(NvmeStatus::InvalidParam);
            break;
        };
        if is_base {
            base_cid = Some(slot.cmd_id());
        }

        // Account before the doorbell: the completion may race the rest of
        // this loop.
        {
            let base_slot = qp.slots.get(base_cid.unwrap()).unwrap();
            let mut base_data = base_slot.data.lock();
            if let CmdContext::IoBase(base) = &mut base_data.ctx {
                base.cmd_count += 1;
                base.requested_length += build.processed;
            }
        }
        slot.set_timeout_id(timeout_id);
        qp.timeouts.note_submit(timeout_id);

        if let Err(status) = qp.issue(slot) {
            log::debug!("q{}: failed to issue command: {}", qp.qid(), status);
            qp.timeouts.note_complete(timeout_id);
            {
                let base_slot = qp.slots.get(base_cid.unwrap()).unwrap();
                let mut base_data = base_slot.data.lock();
                if let CmdContext::IoBase(base) = &mut base_data.ctx {
                    base.cmd_count -= 1;
                    base.requested_length -= build.processed;
                }
            }
            qp.slots.release(slot);
            if is_base {
                base_cid = None;
            }
            fail_status = Some(status);
            break;
        }

        requested += build.processed;
        if requested >= required {
            break;
        }
    }

    let Some(base_cid) = base_cid else {
        // Nothing reached the hardware; surface the original failure.
        return Err(fail_status.unwrap_or(NvmeStatus::Failure));
    };

    if fail_status.is_some() && requested > 0 && requested < required {
        // Partially submitted: the outstanding commands will complete and
        // the shortfall surfaces as an underrun.
        log::warn!(
            "q{}: request partially submitted, {}/{} bytes",
            qp.qid(),
            requested,
            required
        );
    }

    // Close the submit window. If every command already completed while we
    // were still issuing siblings, the parent completion falls to us.
    let base_slot = qp.slots.get(base_cid).unwrap();
    let mut finish: Option<(NvmeStatus, u32)> = None;
    {
        let mut base_data = base_slot.data.lock();
        if let CmdContext::IoBase(base) = &mut base_data.ctx {
            base.submitting = false;
            if base.cmd_count == 0 {
                base.phase = CompletionPhase::PostComplete;
                finish = Some((base.status, base.requested_length));
            } else {
                base.request = request.take();
            }
        }
    }
    if let Some((status, bytes)) = finish {
        let request = request.take().unwrap();
        complete_base(qp, base_slot, request, status, bytes, expected);
    }
    Ok(())
}

/// Submit an NVM Flush on an I/O queue. Never split; completes through the
/// same parent path with no byte accounting.
pub(crate) fn submit_flush(
    qp: &QueuePair,
    ns: &Namespace,
    in_reset: bool,
    done: IoDone,
) -> Result<(), NvmeStatus> {
    if !ns.is_online() {
        return Err(NvmeStatus::Quiesced);
    }
    if in_reset {
        return Err(NvmeStatus::InReset);
    }

    qp.enter();
    let nsid = ns.id();
    let result = submit_single(
        qp,
        IoRequest {
            op: IoOp::Flush,
            lba: 0,
            lba_count: 0,
            sg: Vec::new(),
            fua: false,
            prinfo: 0,
            meta_io_addr: 0,
            done,
        },
        move |_slot| SubmissionEntry::flush(nsid),
    );
    qp.leave();
    result
}

/// Submit a Dataset Management/Deallocate for `ranges`. The range list is
/// carried in the slot's PRP page.
pub(crate) fn submit_dsm(
    qp: &QueuePair,
    ns: &Namespace,
    in_reset: bool,
    ranges: &[DsmRange],
    done: IoDone,
) -> Result<(), NvmeStatus> {
    if !ns.is_online() {
        return Err(NvmeStatus::Quiesced);
    }
    if in_reset {
        return Err(NvmeStatus::InReset);
    }
    if ranges.is_empty() || ranges.len() > MAX_DSM_RANGES {
        return Err(NvmeStatus::InvalidParam);
    }

    qp.enter();
    let nsid = ns.id();
    let count = ranges.len() as u16;
    let result = submit_single(
        qp,
        IoRequest {
            op: IoOp::DatasetMgmt,
            lba: 0,
            lba_count: 0,
            sg: Vec::new(),
            fua: false,
            prinfo: 0,
            meta_io_addr: 0,
            done,
        },
        move |slot| {
            // The range list rides in the slot's pre-allocated PRP page.
            let mut data = slot.data.lock();
            let page = data.prp_page.as_mut().unwrap();
            let bytes = page.as_mut_slice();
            for (i, range) in ranges.iter().enumerate() {
                let off = i * core::mem::size_of::<DsmRange>();
                bytes[off..off + 4].copy_from_slice(&range.context_attrs.to_le_bytes());
                bytes[off + 4..off + 8].copy_from_slice(&range.lba_count.to_le_bytes());
                bytes[off + 8..off + 16].copy_from_slice(&range.start_lba.to_le_bytes());
            }
            drop(data);
            SubmissionEntry::dataset_mgmt(nsid, count, slot.prp_page_io_addr())
        },
    );
    qp.leave();
    result
}

/// Common single-command path for Flush and Dataset Management.
fn submit_single(
    qp: &QueuePair,
    request: IoRequest,
    build_sqe: impl FnOnce(&CommandSlot) -> SubmissionEntry,
) -> Result<(), NvmeStatus> {
    let Some(slot) = qp.slots.acquire() else {
        log::error!("q{}: failing request, queue full", qp.qid());
        return Err(NvmeStatus::QueueFull);
    };

    let sqe = build_sqe(slot);
    {
        let mut data = slot.data.lock();
        data.sqe = sqe;
        data.status = NvmeStatus::Success;
        data.ctx = CmdContext::IoBase(IoBase {
            request: Some(request),
            required_length: 0,
            requested_length: 0,
            expected_length: 0,
            cmd_count: 1,
            submitting: false,
            phase: CompletionPhase::PreComplete,
            status: NvmeStatus::Success,
        });
    }

    if let Err(status) = qp.issue(slot) {
        log::error!("q{}: failed to issue command: {}", qp.qid(), status);
        let mut data = slot.data.lock();
        data.ctx = CmdContext::None;
        drop(data);
        qp.slots.release(slot);
        return Err(status);
    }
    Ok(())
}

/// Completion handler for split and single I/O commands, dispatched from
/// the CQ drain and from reset-time queue flushes.
pub(crate) fn complete_io(qp: &QueuePair, slot: &CommandSlot) {
    enum Step {
        /// Flush found a parent whose own completion already ran.
        AlreadyCompleted,
        Stale,
        Child {
            base: CmdId,
            opcode: u8,
            status: NvmeStatus,
        },
        Base {
            opcode: u8,
            status: NvmeStatus,
            finish: Option<(IoRequest, NvmeStatus, u32, u32)>,
        },
    }

    let step = {
        let mut data = slot.data.lock();
        let opcode = data.sqe.opcode();
        let status = data.status;
        match &mut data.ctx {
            CmdContext::IoChild { base } => Step::Child {
                base: *base,
                opcode,
                status,
            },
            CmdContext::IoBase(base) => {
                if base.phase == CompletionPhase::PostComplete {
                    Step::AlreadyCompleted
                } else {
                    base.phase = CompletionPhase::PostComplete;
                    if !status.is_success() && base.status.is_success() {
                        base.status = status;
                    }
                    debug_assert!(base.cmd_count > 0, "parent completion underflow");
                    base.cmd_count -= 1;
                    let finish = if base.cmd_count == 0 && !base.submitting {
                        base.request
                            .take()
                            .map(|r| (r, base.status, base.requested_length, base.expected_length))
                    } else {
                        None
                    };
                    Step::Base {
                        opcode,
                        status,
                        finish,
                    }
                }
            }
            _ => Step::Stale,
        }
    };

    match step {
        Step::AlreadyCompleted => {
            log::info!(
                "q{}: skipping already-completed parent {}",
                qp.qid(),
                slot.cmd_id()
            );
        }
        Step::Stale => {
            log::warn!("q{}: I/O completion for stale slot {}", qp.qid(), slot.cmd_id());
        }
        Step::Child {
            base,
            opcode,
            status,
        } => {
            note_io_complete(qp, slot, opcode);
            if !status.is_success() {
                log::error!(
                    "q{}: I/O error on slot {}: {}",
                    qp.qid(),
                    slot.cmd_id(),
                    status
                );
            }
            // Return the child before touching the parent's accounting.
            {
                let mut data = slot.data.lock();
                data.ctx = CmdContext::None;
            }
            qp.slots.release(slot);

            let Some(base_slot) = qp.slots.get(base) else {
                log::error!("q{}: child references missing parent {}", qp.qid(), base);
                return;
            };
            let mut finish = None;
            {
                let mut base_data = base_slot.data.lock();
                if let CmdContext::IoBase(parent) = &mut base_data.ctx {
                    if !status.is_success() && parent.status.is_success() {
                        parent.status = status;
                    }
                    debug_assert!(parent.cmd_count > 0, "parent completion underflow");
                    parent.cmd_count -= 1;
                    if parent.cmd_count == 0 && !parent.submitting {
                        finish = parent.request.take().map(|r| {
                            (
                                r,
                                parent.status,
                                parent.requested_length,
                                parent.expected_length,
                            )
                        });
                    }
                } else {
                    log::error!("q{}: parent {} has no I/O context", qp.qid(), base);
                }
            }
            if let Some((request, status, bytes, expected)) = finish {
                complete_base(qp, base_slot, request, status, bytes, expected);
            }
        }
        Step::Base {
            opcode,
            status,
            finish,
        } => {
            note_io_complete(qp, slot, opcode);
            if !status.is_success() {
                log::error!(
                    "q{}: I/O error on slot {}: {}",
                    qp.qid(),
                    slot.cmd_id(),
                    status
                );
            }
            if let Some((request, status, bytes, expected)) = finish {
                complete_base(qp, slot, request, status, bytes, expected);
            }
        }
    }
}

fn note_io_complete(qp: &QueuePair, slot: &CommandSlot, opcode: u8) {
    if opcode == NvmOpcode::Read as u8 || opcode == NvmOpcode::Write as u8 {
        qp.timeouts.note_complete(slot.timeout_id());
    }
}

/// Final parent completion: byte accounting, the upper-layer callback, and
/// the slot's return to the free list.
fn complete_base(
    qp: &QueuePair,
    base_slot: &CommandSlot,
    request: IoRequest,
    status: NvmeStatus,
    bytes_xferred: u32,
    expected: u32,
) {
    let mut final_status = status;
    if matches!(request.op, IoOp::Read | IoOp::Write)
        && final_status.is_success()
        && bytes_xferred != expected
    {
        final_status = if bytes_xferred < expected {
            NvmeStatus::Underrun
        } else {
            NvmeStatus::Overrun
        };
        log::warn!(
            "q{}: {} {}/{} bytes",
            qp.qid(),
            final_status,
            bytes_xferred,
            expected
        );
    }

    {
        let mut data = base_slot.data.lock();
        data.ctx = CmdContext::None;
    }
    qp.slots.release(base_slot);
    (request.done)(IoResult {
        status: final_status,
        bytes_xferred,
    });
}
