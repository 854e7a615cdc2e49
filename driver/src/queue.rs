/// Queue pair: one submission ring, one completion ring, the command slot
/// table, a doorbell pair and an interrupt binding.
///
/// Locking: the SQ lock covers ring-tail and doorbell writes, the CQ lock
/// covers the completion drain, and the two sides meet only through atomics
/// (`sq_pending_head` and the slot table's pending-free list).
use core::mem;
use core::ptr;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use alloc::sync::Arc;
use spin::Mutex;

use crate::cmd::{CompletionEntry, NvmeStatus, SubmissionEntry};
use crate::debug::{self, DebugMask};
use crate::mem::{DmaBuffer, DmaDirection, DmaOps};
use crate::mmio::RegisterIo;
use crate::regs;
use crate::slot::{CmdContext, CommandSlot, SlotState, SlotTable};
use crate::timeout::TimeoutTable;

pub const SQE_SIZE: usize = core::mem::size_of::<SubmissionEntry>();
pub const CQE_SIZE: usize = core::mem::size_of::<CompletionEntry>();

/// Sentinel for "no head published since the last reload".
pub const INVALID_SQ_HEAD: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueState {
    NonExistent = 0,
    Suspended = 1,
    Active = 2,
}

impl QueueState {
    fn from_u32(v: u32) -> QueueState {
        match v {
            0 => QueueState::NonExistent,
            1 => QueueState::Suspended,
            2 => QueueState::Active,
            _ => unreachable!("invalid queue state"),
        }
    }
}

pub struct SubQueue {
    pub id: u16,
    pub qsize: u16,
    /// Last head value observed from hardware.
    pub head: u16,
    /// Next free ring entry.
    pub tail: u16,
    pub ring: DmaBuffer,
    pub doorbell: u32,
}

pub struct CompQueue {
    pub id: u16,
    pub qsize: u16,
    pub head: u16,
    /// Valid-entry phase; starts 1, toggles each wrap.
    pub phase: bool,
    pub ring: DmaBuffer,
    pub doorbell: u32,
}

pub struct QueuePair {
    qid: u16,
    sq_size: u16,
    cq_size: u16,
    state: AtomicU32,
    /// In-flight submitters (not in-flight commands); destroy waits for it
    /// to drain.
    refcount: AtomicU32,
    pub(crate) sq: Mutex<SubQueue>,
    /// SQ head published by completers without the SQ lock.
    sq_pending_head: AtomicU32,
    pub(crate) cq: Mutex<CompQueue>,
    pub(crate) slots: SlotTable,
    pub(crate) timeouts: TimeoutTable,
    intr_index: Option<u32>,
    regs: Arc<dyn RegisterIo>,
    debug_mask: DebugMask,
    sq_ring_io_addr: u64,
    cq_ring_io_addr: u64,
}

impl QueuePair {
    /// Allocate rings and the slot table. The queue comes up Suspended and
    /// rings are not initialized until `init()`.
    pub fn construct(
        qid: u16,
        sq_size: u16,
        cq_size: u16,
        intr_index: Option<u32>,
        dstrd: u32,
        regs: Arc<dyn RegisterIo>,
        dma: &Arc<dyn DmaOps>,
        debug_mask: DebugMask,
    ) -> Result<Self, NvmeStatus> {
        let cq_ring = DmaBuffer::alloc(dma, cq_size as usize * CQE_SIZE, DmaDirection::FromDevice)
            .map_err(NvmeStatus::from)?;
        let sq_ring = DmaBuffer::alloc(dma, sq_size as usize * SQE_SIZE, DmaDirection::ToDevice)
            .map_err(NvmeStatus::from)?;
        let slots = SlotTable::new(sq_size - 1, dma).map_err(NvmeStatus::from)?;

        let sq_ring_io_addr = sq_ring.io_addr();
        let cq_ring_io_addr = cq_ring.io_addr();

        log::debug!(
            "q{}: sq doorbell {:#x}, cq doorbell {:#x}",
            qid,
            regs::sq_tail_doorbell(qid, dstrd),
            regs::cq_head_doorbell(qid, dstrd)
        );

        Ok(Self {
            qid,
            sq_size,
            cq_size,
            state: AtomicU32::new(QueueState::Suspended as u32),
            refcount: AtomicU32::new(0),
            sq: Mutex::new(SubQueue {
                id: qid,
                qsize: sq_size,
                head: 0,
                tail: 0,
                ring: sq_ring,
                doorbell: regs::sq_tail_doorbell(qid, dstrd),
            }),
            sq_pending_head: AtomicU32::new(INVALID_SQ_HEAD),
            cq: Mutex::new(CompQueue {
                id: qid,
                qsize: cq_size,
                head: 0,
                phase: true,
                ring: cq_ring,
                doorbell: regs::cq_head_doorbell(qid, dstrd),
            }),
            slots,
            timeouts: TimeoutTable::new(),
            intr_index,
            regs,
            debug_mask,
            sq_ring_io_addr,
            cq_ring_io_addr,
        })
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    #[inline]
    pub fn sq_size(&self) -> u16 {
        self.sq_size
    }

    #[inline]
    pub fn cq_size(&self) -> u16 {
        self.cq_size
    }

    #[inline]
    pub fn sq_ring_io_addr(&self) -> u64 {
        self.sq_ring_io_addr
    }

    #[inline]
    pub fn cq_ring_io_addr(&self) -> u64 {
        self.cq_ring_io_addr
    }

    #[inline]
    pub fn intr_index(&self) -> Option<u32> {
        self.intr_index
    }

    #[inline]
    pub fn state(&self) -> QueueState {
        QueueState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == QueueState::Active
    }

    /// Atomically move to Suspended; returns the previous state.
    pub fn suspend(&self) -> QueueState {
        QueueState::from_u32(
            self.state
                .swap(QueueState::Suspended as u32, Ordering::AcqRel),
        )
    }

    pub fn resume(&self) -> QueueState {
        QueueState::from_u32(self.state.swap(QueueState::Active as u32, Ordering::AcqRel))
    }

    pub fn mark_nonexistent(&self) {
        self.state
            .store(QueueState::NonExistent as u32, Ordering::Release);
    }

    /// Submitter entry/exit accounting. A submitter may already be mid-flight
    /// when the queue suspends; destruction spins on this count.
    #[inline]
    pub fn enter(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn leave(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "queue refcount underflow");
    }

    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Reset rings, the pending head, the slot table and timeout buckets.
    /// Only legal while Suspended.
    pub fn init(&self) -> Result<(), NvmeStatus> {
        if self.state() != QueueState::Suspended {
            log::warn!("q{}: trying to init a non-suspended queue", self.qid);
            return Err(NvmeStatus::Failure);
        }
        {
            let mut sq = self.sq.lock();
            sq.head = 0;
            sq.tail = 0;
            sq.ring.fill_zero();
        }
        self.sq_pending_head
            .store(INVALID_SQ_HEAD, Ordering::Release);
        {
            let mut cq = self.cq.lock();
            cq.head = 0;
            cq.phase = true;
            cq.ring.fill_zero();
        }
        self.slots.reset();
        self.timeouts.reset();
        Ok(())
    }

    fn reload_sq_head(&self, sq: &mut SubQueue) {
        let head = self
            .sq_pending_head
            .swap(INVALID_SQ_HEAD, Ordering::AcqRel);
        if head != INVALID_SQ_HEAD {
            sq.head = head as u16;
        }
    }

    /// Copy the slot's staged command into the ring and ring the doorbell.
    ///
    /// The ring is never driven full: one entry stays reserved, and the
    /// full check reloads the completer-published head before giving up.
    pub fn issue(&self, slot: &CommandSlot) -> Result<(), NvmeStatus> {
        let mut sqe = {
            let data = slot.data.lock();
            data.sqe
        };

        let mut sq = self.sq.lock();
        let qsize = sq.qsize;
        let mut head = sq.head;
        let tail = sq.tail;

        if head == tail + 1 || (head == 0 && tail == qsize - 1) {
            self.reload_sq_head(&mut sq);
            head = sq.head;
        }
        if head == tail + 1 || (head == 0 && tail == qsize - 1) {
            return Err(NvmeStatus::QueueFull);
        }
        if self.state() != QueueState::Active {
            return Err(NvmeStatus::InReset);
        }

        sqe.set_cid(slot.cmd_id());
        debug::dump_sqe(self.debug_mask, self.qid, &sqe);
        let ring_ptr = sq.ring.as_mut_ptr() as *mut SubmissionEntry;
        // Ring memory is owned by this queue and indexed under the SQ lock.
        unsafe {
            ptr::write_volatile(ring_ptr.add(tail as usize), sqe);
        }

        let mut new_tail = tail + 1;
        if new_tail >= qsize {
            new_tail = 0;
        }

        // The entry must be globally visible before the doorbell moves the
        // hardware's view of the tail.
        fence(Ordering::Release);
        self.regs.write32(sq.doorbell, new_tail as u32);
        sq.tail = new_tail;
        Ok(())
    }

    /// Drain the completion ring. Runs under the CQ lock from the MSI-X
    /// handler, the poll path, or a sync waiter. Returns entries consumed.
    pub fn process_completions(&self) -> u32 {
        let mut cq = self.cq.lock();
        let qsize = cq.qsize;
        let start_head = cq.head;
        let start_phase = cq.phase;
        let mut head = cq.head;
        let mut phase = cq.phase;
        let mut consumed = 0u32;

        loop {
            // The entry body must be read only after the device-visible
            // phase write.
            fence(Ordering::Acquire);
            let cqe = unsafe {
                ptr::read_volatile((cq.ring.as_ptr() as *const CompletionEntry).add(head as usize))
            };
            if cqe.phase() != phase {
                break;
            }
            debug::dump_cqe(self.debug_mask, self.qid, &cqe);

            let cid = cqe.cid();
            let slot = match self.slots.get(cid) {
                Some(slot)
                    if matches!(
                        slot.state(),
                        SlotState::Active | SlotState::FreeOnComplete
                    ) =>
                {
                    slot
                }
                _ => {
                    // A CID that maps to no in-flight slot means the
                    // controller is malfunctioning.
                    log::error!("q{}: completion for invalid cid {:#x}", self.qid, cid);
                    debug_assert!(false, "completion for invalid cid");
                    head += 1;
                    if head >= qsize {
                        head = 0;
                        phase = !phase;
                    }
                    consumed += 1;
                    continue;
                }
            };

            let sq_head = cqe.sq_head();
            if sq_head as u32 >= self.sq_size as u32 {
                log::error!(
                    "q{}: invalid sq head {:#x} returned for cid {:#x}",
                    self.qid,
                    sq_head,
                    cid
                );
                debug_assert!(false, "invalid sq head in completion");
            } else {
                self.sq_pending_head
                    .store(sq_head as u32, Ordering::Release);
            }

            {
                let mut data = slot.data.lock();
                data.cqe = cqe;
                data.status = NvmeStatus::from_cqe(&cqe);
            }
            self.dispatch_completion(slot);

            head += 1;
            if head >= qsize {
                head = 0;
                phase = !phase;
            }
            consumed += 1;
        }

        if head != start_head || phase != start_phase {
            cq.head = head;
            cq.phase = phase;
            self.regs.write32(cq.doorbell, head as u32);
        }
        consumed
    }

    /// Run the completion action recorded in the slot's context. The slot's
    /// `cqe`/`status` have already been filled by the drain (or by a flush).
    pub(crate) fn dispatch_completion(&self, slot: &CommandSlot) {
        let mut data = slot.data.lock();
        match &data.ctx {
            CmdContext::Async(_) => {
                let CmdContext::Async(mut async_cmd) =
                    mem::replace(&mut data.ctx, CmdContext::None)
                else {
                    unreachable!()
                };
                async_cmd.cmd.cqe = data.cqe;
                // Hand the caller back its own CID, not the slot's.
                async_cmd.cmd.cqe.set_cid(async_cmd.cmd.sqe.cid());
                async_cmd.cmd.status = data.status;
                drop(data);
                self.slots.release(slot);
                (async_cmd.done)(async_cmd.cmd);
            }
            CmdContext::Sync(_) => {
                drop(data);
                self.complete_sync(slot);
            }
            CmdContext::IoBase(_) | CmdContext::IoChild { .. } => {
                drop(data);
                crate::io::complete_io(self, slot);
            }
            CmdContext::None => {
                drop(data);
                log::warn!(
                    "q{}: completion for slot {} with no context",
                    self.qid,
                    slot.cmd_id()
                );
            }
        }
    }

    /// Sync completion: move the slot to Done and let the waiter pick the
    /// result up — unless the waiter already timed out, in which case the
    /// FreeOnComplete marker makes this path the owner of the payload.
    fn complete_sync(&self, slot: &CommandSlot) {
        loop {
            match slot.compare_exchange_state(SlotState::Active, SlotState::Done) {
                Ok(_) => return,
                Err(SlotState::FreeOnComplete) => {
                    let ctx = {
                        let mut data = slot.data.lock();
                        mem::replace(&mut data.ctx, CmdContext::None)
                    };
                    // Payload ownership transferred to us: the command
                    // record and its bounce buffer die here.
                    drop(ctx);
                    self.slots.release(slot);
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Drain the ring one last time, then surface `status` to every command
    /// still in flight. Callers must have suspended the queue and silenced
    /// its interrupt vector first.
    pub fn flush(&self, status: NvmeStatus) {
        self.process_completions();
        for slot in self.slots.iter() {
            let state = slot.state();
            if state == SlotState::Active || state == SlotState::FreeOnComplete {
                {
                    let mut data = slot.data.lock();
                    data.status = status;
                }
                self.dispatch_completion(slot);
            }
        }
    }
}
