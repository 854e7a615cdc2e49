/// Per-queue command slot table.
///
/// One slot per possible in-flight command (`N_sq - 1`, keeping the ring's
/// one-entry full reservation). Each slot owns a stable 1-based `cmd_id`
/// used as the NVMe CID and a pre-allocated PRP list page.
///
/// Free bookkeeping mixes two structures:
/// - `free`: a plain head index, touched only under its lock by submitters.
/// - `pending_free`: a 64-bit atomic composite `{head:32, length:32}` that
///   completers push onto with CAS, never taking the lock. Submitters splice
///   the pending chain into `free` only when the locked list runs dry, so
///   the hot completion path stays lock-free relative to submission.
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::cmd::{Command, CompletionEntry, NvmeStatus, SubmissionEntry};
use crate::io::IoRequest;
use crate::mem::{DmaBuffer, DmaDirection, DmaError, DmaOps, PAGE_SIZE};

pub type CmdId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    Active = 1,
    Done = 2,
    /// The sync waiter abandoned the command; the completer owns the payload
    /// and returns the slot.
    FreeOnComplete = 3,
}

impl SlotState {
    fn from_u32(v: u32) -> SlotState {
        match v {
            0 => SlotState::Free,
            1 => SlotState::Active,
            2 => SlotState::Done,
            3 => SlotState::FreeOnComplete,
            _ => unreachable!("invalid slot state"),
        }
    }
}

/// Whether a split parent has already run its upper-layer completion.
/// A queue flush consults this and skips `PostComplete` parents, so a parent
/// completed by the last child cannot be completed a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPhase {
    PreComplete,
    PostComplete,
}

/// Async command payload: the prepared command plus its done hook.
pub struct AsyncCmd {
    pub cmd: Command,
    pub done: Box<dyn FnOnce(Command) + Send>,
}

/// Sync command payload. The bounce buffer shadows the caller's byte buffer
/// for the duration of the transfer.
pub struct SyncCmd {
    pub cmd: Command,
    pub bounce: Option<DmaBuffer>,
    pub dir: DmaDirection,
}

/// Accounting for a split I/O parent. `cmd_count` tracks unfinished
/// hardware commands (the parent's own included); the request completes
/// upward only when it reaches zero and the submit loop has finished.
pub struct IoBase {
    pub request: Option<IoRequest>,
    pub required_length: u32,
    pub requested_length: u32,
    /// Upper-layer byte count (LBA count × sector size); the under/overrun
    /// reference at completion.
    pub expected_length: u32,
    pub cmd_count: u32,
    /// Set while the submission loop may still add child commands.
    pub submitting: bool,
    pub phase: CompletionPhase,
    pub status: NvmeStatus,
}

/// Completion context, dispatched exhaustively on completion.
pub enum CmdContext {
    None,
    Async(AsyncCmd),
    Sync(SyncCmd),
    IoBase(IoBase),
    IoChild { base: CmdId },
}

impl CmdContext {
    pub fn is_none(&self) -> bool {
        matches!(self, CmdContext::None)
    }
}

/// Mutable per-command state, guarded by a per-slot lock. The submitter
/// writes it before the doorbell, the completer reads it after the CQE;
/// the lock also covers the reset-time flush walking every slot.
pub struct SlotData {
    pub sqe: SubmissionEntry,
    pub cqe: CompletionEntry,
    pub status: NvmeStatus,
    pub ctx: CmdContext,
    pub prp_page: Option<DmaBuffer>,
}

pub struct CommandSlot {
    cmd_id: CmdId,
    state: AtomicU32,
    /// Free-list link: cmd_id of the next free slot, 0 terminates.
    next_free: AtomicU32,
    timeout_id: AtomicU32,
    prp_page_io_addr: u64,
    pub data: Mutex<SlotData>,
}

impl CommandSlot {
    #[inline]
    pub fn cmd_id(&self) -> CmdId {
        self.cmd_id
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// CAS on the slot state. The Active→FreeOnComplete transition is the
    /// linearization point transferring payload ownership from the sync
    /// waiter to the completer.
    pub fn compare_exchange_state(
        &self,
        current: SlotState,
        new: SlotState,
    ) -> Result<SlotState, SlotState> {
        self.state
            .compare_exchange(
                current as u32,
                new as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SlotState::from_u32)
            .map_err(SlotState::from_u32)
    }

    #[inline]
    pub fn timeout_id(&self) -> u32 {
        self.timeout_id.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_timeout_id(&self, id: u32) {
        self.timeout_id.store(id, Ordering::Relaxed);
    }

    /// IO address of this slot's PRP list page.
    #[inline]
    pub fn prp_page_io_addr(&self) -> u64 {
        self.prp_page_io_addr
    }
}

struct FreeList {
    head: u32,
    /// Slots handed out and not yet observed back through a pending-free
    /// splice.
    nr_act: u32,
}

fn compose(head: u32, len: u32) -> u64 {
    (head as u64) | ((len as u64) << 32)
}

fn split(composite: u64) -> (u32, u32) {
    (composite as u32, (composite >> 32) as u32)
}

pub struct SlotTable {
    slots: Box<[CommandSlot]>,
    free: Mutex<FreeList>,
    pending_free: AtomicU64,
}

impl SlotTable {
    /// Allocate `count` slots, each with a pre-allocated PRP list page.
    pub fn new(count: u16, dma: &Arc<dyn DmaOps>) -> Result<Self, DmaError> {
        let mut slots = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let prp_page = DmaBuffer::alloc(dma, PAGE_SIZE, DmaDirection::ToDevice)?;
            let prp_page_io_addr = prp_page.io_addr();
            slots.push(CommandSlot {
                cmd_id: i,
                state: AtomicU32::new(SlotState::Free as u32),
                next_free: AtomicU32::new(0),
                timeout_id: AtomicU32::new(0),
                prp_page_io_addr,
                data: Mutex::new(SlotData {
                    sqe: SubmissionEntry::zeroed(),
                    cqe: CompletionEntry::zeroed(),
                    status: NvmeStatus::Success,
                    ctx: CmdContext::None,
                    prp_page: Some(prp_page),
                }),
            });
        }
        let table = Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(FreeList { head: 0, nr_act: 0 }),
            pending_free: AtomicU64::new(0),
        };
        table.reset();
        Ok(table)
    }

    /// Rebuild the free list with every slot linked `i -> i-1` and drop all
    /// contexts. Only legal while the owning queue is suspended.
    pub fn reset(&self) {
        let mut free = self.free.lock();
        self.pending_free.store(0, Ordering::Release);
        free.head = 0;
        free.nr_act = 0;
        for slot in self.slots.iter() {
            slot.set_state(SlotState::Free);
            slot.next_free.store(free.head, Ordering::Relaxed);
            slot.set_timeout_id(0);
            free.head = slot.cmd_id as u32;
            let mut data = slot.data.lock();
            data.sqe = SubmissionEntry::zeroed();
            data.cqe = CompletionEntry::zeroed();
            data.status = NvmeStatus::Success;
            data.ctx = CmdContext::None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots currently held by in-flight commands.
    pub fn in_use(&self) -> u32 {
        let free = self.free.lock();
        let (_, pending_len) = split(self.pending_free.load(Ordering::Acquire));
        free.nr_act - pending_len
    }

    pub fn get(&self, cmd_id: CmdId) -> Option<&CommandSlot> {
        if cmd_id == 0 {
            return None;
        }
        self.slots.get(cmd_id as usize - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSlot> {
        self.slots.iter()
    }

    /// Pop a free slot and mark it Active. Returns None when every slot is
    /// in flight (queue-full condition for the caller).
    pub fn acquire(&self) -> Option<&CommandSlot> {
        let mut free = self.free.lock();
        if free.head == 0 {
            free.head = self.take_pending(&mut free);
            if free.head == 0 {
                return None;
            }
        }
        let slot = &self.slots[free.head as usize - 1];
        free.head = slot.next_free.load(Ordering::Relaxed);
        free.nr_act += 1;
        slot.set_state(SlotState::Active);
        Some(slot)
    }

    /// Return a slot to the pending-free list. Lock-free; safe from the
    /// completion path while a submitter holds the acquisition lock.
    pub fn release(&self, slot: &CommandSlot) {
        debug_assert_eq!(
            slot.cmd_id as usize - 1,
            self.slots
                .iter()
                .position(|s| core::ptr::eq(s, slot))
                .unwrap_or(usize::MAX)
        );
        slot.set_state(SlotState::Free);
        loop {
            let old = self.pending_free.load(Ordering::Acquire);
            let (head, len) = split(old);
            slot.next_free.store(head, Ordering::Relaxed);
            let new = compose(slot.cmd_id as u32, len + 1);
            if self
                .pending_free
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Swap the whole pending chain out and hand its head to the locked
    /// list. Called with the free-list lock held.
    fn take_pending(&self, free: &mut FreeList) -> u32 {
        loop {
            let old = self.pending_free.load(Ordering::Acquire);
            let (head, len) = split(old);
            if head == 0 {
                debug_assert_eq!(len, 0);
                return 0;
            }
            if self
                .pending_free
                .compare_exchange(old, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                free.nr_act -= len;
                return head;
            }
        }
    }
}
