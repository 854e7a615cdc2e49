/// RAM-backed mock NVMe controller.
///
/// Implements the register seam and executes commands written to the rings,
/// so the whole submission/completion engine runs against it without
/// hardware. Completions can be deferred and statuses injected, which is
/// how the timeout/cancellation and error paths get exercised.
///
/// The mock assumes the identity IO mapping of `HeapDmaOps`: every IO
/// address it dereferences must come from that allocator (ring bases, PRP
/// list pages, bounce buffers).
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::cmd::{CompletionEntry, SubmissionEntry, FEATURE_NUM_QUEUES};
use crate::host::{Clock, HostError, InterruptOps, InterruptType, IntrHandler};
use crate::mem::{DmaConstraints, DmaDirection, DmaError, DmaOps, SgElem, PAGE_SIZE};
use crate::mmio::RegisterIo;
use crate::regs;

/// Identity-mapped, page-aligned heap allocator standing in for the host
/// DMA engine.
pub struct HeapDmaOps {
    constraints: DmaConstraints,
}

impl HeapDmaOps {
    pub fn new() -> Self {
        Self {
            constraints: DmaConstraints::default_io(),
        }
    }

    fn layout_for(len: usize) -> Layout {
        let size = len.max(1).next_multiple_of(PAGE_SIZE);
        Layout::from_size_align(size, PAGE_SIZE).unwrap()
    }
}

impl Default for HeapDmaOps {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaOps for HeapDmaOps {
    fn alloc_raw(&self, len: usize, _dir: DmaDirection) -> Result<(NonNull<u8>, u64), DmaError> {
        if len == 0 {
            return Err(DmaError::InvalidSize);
        }
        let layout = Self::layout_for(len);
        // Zeroed, page-aligned, identity IO mapping (io address == va).
        let ptr = unsafe { alloc_zeroed(layout) };
        match NonNull::new(ptr) {
            Some(va) => Ok((va, va.as_ptr() as u64)),
            None => Err(DmaError::OutOfMemory),
        }
    }

    fn release_raw(&self, va: NonNull<u8>, _io_addr: u64, len: usize) {
        unsafe { dealloc(va.as_ptr(), Self::layout_for(len)) }
    }

    fn map_sg(&self, elems: &[SgElem]) -> Result<Vec<SgElem>, DmaError> {
        Ok(elems.to_vec())
    }

    fn constraints(&self) -> DmaConstraints {
        self.constraints
    }
}

/// Monotonic clock that advances a little on every read, so deadline loops
/// make progress in single-threaded tests.
pub struct MockClock {
    now: AtomicU64,
    step: u64,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            step: 10,
        }
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::Relaxed);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed) + self.step
    }
}

/// Records registrations and lets tests fire vectors by hand.
pub struct MockIntrOps {
    max_vectors: u32,
    granted: AtomicU32,
    handlers: Mutex<BTreeMap<u32, IntrHandler>>,
}

impl MockIntrOps {
    pub fn new(max_vectors: u32) -> Self {
        Self {
            max_vectors,
            granted: AtomicU32::new(0),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Deliver vector `vector` as the platform would.
    pub fn fire(&self, vector: u32) {
        let handler = self.handlers.lock().get(&vector).cloned();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl InterruptOps for MockIntrOps {
    fn alloc_vectors(&self, desired: u32) -> Result<u32, HostError> {
        let granted = desired.min(self.max_vectors);
        if granted == 0 {
            return Err(HostError::NoResources);
        }
        self.granted.store(granted, Ordering::Release);
        self.handlers.lock().clear();
        Ok(granted)
    }

    fn vector_count(&self) -> u32 {
        self.granted.load(Ordering::Acquire)
    }

    fn intr_type(&self) -> InterruptType {
        InterruptType::Msix
    }

    fn register(&self, vector: u32, handler: IntrHandler) -> Result<(), HostError> {
        if vector >= self.vector_count() {
            return Err(HostError::NoResources);
        }
        self.handlers.lock().insert(vector, handler);
        Ok(())
    }

    fn unregister(&self, vector: u32) {
        self.handlers.lock().remove(&vector);
    }

    fn enable(&self, _vector: u32) {}

    fn sync_and_disable(&self, _vector: u32) {}
}

struct MockRegs {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
}

struct MockSq {
    base: u64,
    size: u16,
    cqid: u16,
    /// Consume cursor; also what the completion reports as the SQ head.
    next: u16,
}

struct MockCq {
    base: u64,
    size: u16,
    tail: u16,
    phase: bool,
}

#[derive(Clone, Copy)]
struct PendingCqe {
    cqid: u16,
    sqid: u16,
    cid: u16,
    sq_head: u16,
    dw0: u32,
    sct: u8,
    sc: u8,
    dnr: bool,
}

struct MockState {
    sqs: BTreeMap<u16, MockSq>,
    cqs: BTreeMap<u16, MockCq>,
    defer: bool,
    pending: Vec<PendingCqe>,
    inject: VecDeque<(u8, u8, bool)>,
    issued: Vec<(u16, SubmissionEntry)>,
    /// Per issued command: the PRP list the device would walk, when the
    /// transfer needs one. Captured at consumption time because the slot's
    /// list page is recycled.
    prp_snapshots: Vec<Option<Vec<u64>>>,
    /// 1-based queue count the device grants via Set-Features.
    num_queues_grant: u16,
    backing: Option<Vec<u8>>,
    block_size: u32,
    /// When set, Read/Write actually move data through the PRPs. Off by
    /// default so tests may use fabricated SG addresses.
    execute_data: bool,
}

struct MockShared {
    cap: u64,
    regs: Mutex<MockRegs>,
    state: Mutex<MockState>,
}

#[derive(Clone)]
pub struct MockNvmeDevice {
    shared: Arc<MockShared>,
}

impl MockNvmeDevice {
    pub fn new() -> Self {
        // MQES=1023, TO=10 (5 s), DSTRD=0.
        let cap = 0x3FF | (10u64 << 24);
        Self {
            shared: Arc::new(MockShared {
                cap,
                regs: Mutex::new(MockRegs {
                    cc: 0,
                    csts: 0,
                    aqa: 0,
                    asq: 0,
                    acq: 0,
                }),
                state: Mutex::new(MockState {
                    sqs: BTreeMap::new(),
                    cqs: BTreeMap::new(),
                    defer: false,
                    pending: Vec::new(),
                    inject: VecDeque::new(),
                    issued: Vec::new(),
                    prp_snapshots: Vec::new(),
                    num_queues_grant: 8,
                    backing: None,
                    block_size: 512,
                    execute_data: false,
                }),
            }),
        }
    }

    /// Give the mock a RAM namespace and enable real data movement.
    pub fn with_backing(blocks: u64, block_size: u32) -> Self {
        let device = Self::new();
        {
            let mut state = device.shared.state.lock();
            state.backing = Some(alloc::vec![0u8; (blocks * block_size as u64) as usize]);
            state.block_size = block_size;
            state.execute_data = true;
        }
        device
    }

    pub fn set_defer(&self, defer: bool) {
        self.shared.state.lock().defer = defer;
    }

    /// Deliver every deferred completion.
    pub fn release_pending(&self) {
        let mut state = self.shared.state.lock();
        let pending = core::mem::take(&mut state.pending);
        for cqe in pending {
            Self::deliver(&mut state, cqe);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Queue a status override for the next executed command.
    pub fn inject_status(&self, sct: u8, sc: u8, dnr: bool) {
        self.shared.state.lock().inject.push_back((sct, sc, dnr));
    }

    pub fn set_num_queues_grant(&self, count: u16) {
        self.shared.state.lock().num_queues_grant = count;
    }

    /// Every command consumed from a submission ring, in consumption order.
    pub fn issued(&self) -> Vec<(u16, SubmissionEntry)> {
        self.shared.state.lock().issued.clone()
    }

    /// Commands consumed from I/O rings only.
    pub fn issued_io(&self) -> Vec<SubmissionEntry> {
        self.shared
            .state
            .lock()
            .issued
            .iter()
            .filter(|(qid, _)| *qid > 0)
            .map(|(_, sqe)| *sqe)
            .collect()
    }

    pub fn clear_issued(&self) {
        let mut state = self.shared.state.lock();
        state.issued.clear();
        state.prp_snapshots.clear();
    }

    /// PRP list behind issued command `index`, when that command used one.
    pub fn prp_list_of(&self, index: usize) -> Option<Vec<u64>> {
        self.shared
            .state
            .lock()
            .prp_snapshots
            .get(index)
            .cloned()
            .flatten()
    }

    pub fn read_backing(&self, offset: usize, out: &mut [u8]) {
        let state = self.shared.state.lock();
        let backing = state.backing.as_ref().expect("mock has no backing");
        out.copy_from_slice(&backing[offset..offset + out.len()]);
    }

    pub fn write_backing(&self, offset: usize, data: &[u8]) {
        let mut state = self.shared.state.lock();
        let backing = state.backing.as_mut().expect("mock has no backing");
        backing[offset..offset + data.len()].copy_from_slice(data);
    }

    fn enable_controller(&self) {
        let (aqa, asq, acq) = {
            let regs = self.shared.regs.lock();
            (regs.aqa, regs.asq, regs.acq)
        };
        let mut state = self.shared.state.lock();
        state.sqs.insert(
            0,
            MockSq {
                base: asq,
                size: (aqa & 0xFFF) as u16 + 1,
                cqid: 0,
                next: 0,
            },
        );
        state.cqs.insert(
            0,
            MockCq {
                base: acq,
                size: ((aqa >> 16) & 0xFFF) as u16 + 1,
                tail: 0,
                phase: true,
            },
        );
    }

    fn disable_controller(&self) {
        let mut state = self.shared.state.lock();
        state.sqs.clear();
        state.cqs.clear();
        state.pending.clear();
    }

    fn sq_doorbell(&self, qid: u16, new_tail: u16) {
        let mut state = self.shared.state.lock();
        let Some(sq) = state.sqs.get_mut(&qid) else {
            log::error!("mock: doorbell for unknown sq {}", qid);
            return;
        };
        if new_tail >= sq.size {
            log::error!("mock: tail {} out of range for sq {}", new_tail, qid);
            return;
        }
        let base = sq.base;
        let size = sq.size;
        let cqid = sq.cqid;
        let mut consumed = Vec::new();
        while sq.next != new_tail {
            // Ring memory is identity-mapped test heap.
            let sqe = unsafe {
                core::ptr::read((base as usize + sq.next as usize * 64) as *const SubmissionEntry)
            };
            sq.next = (sq.next + 1) % size;
            consumed.push((sqe, sq.next));
        }
        for (sqe, sq_head) in consumed {
            state.issued.push((qid, sqe));
            let snapshot = Self::snapshot_prp_list(&state, qid, &sqe);
            state.prp_snapshots.push(snapshot);
            self.execute(&mut state, qid, cqid, sqe, sq_head);
        }
    }

    /// Read the PRP list of an NVM read/write whose transfer spans more
    /// than two entries. The list page is real driver memory even when the
    /// data pages are fabricated.
    fn snapshot_prp_list(state: &MockState, qid: u16, sqe: &SubmissionEntry) -> Option<Vec<u64>> {
        if qid == 0 || !matches!(sqe.opcode(), 0x01 | 0x02) {
            return None;
        }
        let block_size = state.block_size as usize;
        let total = ((sqe.cdw12 & 0xFFFF) as usize + 1) * block_size;
        let first_chunk = PAGE_SIZE - (sqe.prp1 as usize & (PAGE_SIZE - 1));
        let remaining = total.saturating_sub(first_chunk);
        if remaining <= PAGE_SIZE {
            return None;
        }
        let entries = remaining.div_ceil(PAGE_SIZE);
        let mut list = Vec::with_capacity(entries);
        for index in 0..entries {
            list.push(unsafe { core::ptr::read((sqe.prp2 as usize + index * 8) as *const u64) });
        }
        Some(list)
    }

    fn execute(
        &self,
        state: &mut MockState,
        sqid: u16,
        cqid: u16,
        sqe: SubmissionEntry,
        sq_head: u16,
    ) {
        let injected = state.inject.pop_front();
        let (dw0, (sct, sc, dnr)) = match injected {
            Some(status) if status != (0, 0, false) => (0, status),
            _ => match self.run_op(state, sqid, &sqe) {
                Ok(dw0) => (dw0, (0, 0, false)),
                Err(err) => (0, err),
            },
        };
        let cqe = PendingCqe {
            cqid,
            sqid,
            cid: sqe.cid(),
            sq_head,
            dw0,
            sct,
            sc,
            dnr,
        };
        if state.defer {
            state.pending.push(cqe);
        } else {
            Self::deliver(state, cqe);
        }
    }

    fn deliver(state: &mut MockState, p: PendingCqe) {
        let Some(cq) = state.cqs.get_mut(&p.cqid) else {
            log::error!("mock: completion for unknown cq {}", p.cqid);
            return;
        };
        let entry = CompletionEntry::new(p.cid, p.sq_head, p.sqid, cq.phase, p.sct, p.sc, p.dnr);
        let entry = CompletionEntry {
            dw0: p.dw0,
            ..entry
        };
        unsafe {
            core::ptr::write(
                (cq.base as usize + cq.tail as usize * 16) as *mut CompletionEntry,
                entry,
            );
        }
        cq.tail += 1;
        if cq.tail == cq.size {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }

    fn run_op(
        &self,
        state: &mut MockState,
        sqid: u16,
        sqe: &SubmissionEntry,
    ) -> Result<u32, (u8, u8, bool)> {
        if sqid == 0 {
            match sqe.opcode() {
                0x06 => {
                    self.fill_identify(state, sqe);
                    Ok(0)
                }
                0x05 => {
                    let qid = (sqe.cdw10 & 0xFFFF) as u16;
                    let size = (sqe.cdw10 >> 16) as u16 + 1;
                    state.cqs.insert(
                        qid,
                        MockCq {
                            base: sqe.prp1,
                            size,
                            tail: 0,
                            phase: true,
                        },
                    );
                    Ok(0)
                }
                0x01 => {
                    let qid = (sqe.cdw10 & 0xFFFF) as u16;
                    let size = (sqe.cdw10 >> 16) as u16 + 1;
                    let cqid = (sqe.cdw11 >> 16) as u16;
                    if !state.cqs.contains_key(&cqid) {
                        // Completion Queue Invalid.
                        return Err((1, 0x00, true));
                    }
                    state.sqs.insert(
                        qid,
                        MockSq {
                            base: sqe.prp1,
                            size,
                            cqid,
                            next: 0,
                        },
                    );
                    Ok(0)
                }
                0x00 => {
                    let qid = (sqe.cdw10 & 0xFFFF) as u16;
                    if state.sqs.remove(&qid).is_none() {
                        // Invalid Queue Identifier.
                        return Err((1, 0x01, true));
                    }
                    Ok(0)
                }
                0x04 => {
                    let qid = (sqe.cdw10 & 0xFFFF) as u16;
                    if state.sqs.values().any(|sq| sq.cqid == qid) {
                        // Invalid Queue Deletion: an SQ still posts here.
                        return Err((1, 0x0C, true));
                    }
                    if state.cqs.remove(&qid).is_none() {
                        return Err((1, 0x01, true));
                    }
                    Ok(0)
                }
                0x09 => {
                    if sqe.cdw10 & 0xFF == FEATURE_NUM_QUEUES {
                        let granted = state.num_queues_grant.saturating_sub(1) as u32;
                        Ok(granted | (granted << 16))
                    } else {
                        Ok(0)
                    }
                }
                _ => Err((0, 0x01, true)), // Invalid Command Opcode
            }
        } else {
            match sqe.opcode() {
                0x01 | 0x02 => {
                    if state.execute_data {
                        self.transfer(state, sqe)?;
                    }
                    Ok(0)
                }
                0x00 | 0x09 => Ok(0), // Flush / Dataset Management
                _ => Err((0, 0x01, true)),
            }
        }
    }

    fn fill_identify(&self, state: &MockState, sqe: &SubmissionEntry) {
        if sqe.prp1 == 0 {
            return;
        }
        let mut page = [0u8; PAGE_SIZE];
        let cns = sqe.cdw10 & 0xFF;
        if cns == 1 {
            let serial = b"MOCK0001";
            page[4..4 + serial.len()].copy_from_slice(serial);
            page[4 + serial.len()..24].fill(b' ');
            let model = b"Mock NVMe Device";
            page[24..24 + model.len()].copy_from_slice(model);
            page[24 + model.len()..64].fill(b' ');
            let firmware = b"1.0";
            page[64..64 + firmware.len()].copy_from_slice(firmware);
            page[64 + firmware.len()..72].fill(b' ');
            page[77] = 0; // unlimited MDTS
            page[516..520].copy_from_slice(&1u32.to_le_bytes());
        } else {
            let blocks = state
                .backing
                .as_ref()
                .map(|b| b.len() as u64 / state.block_size as u64)
                .unwrap_or(0);
            page[0..8].copy_from_slice(&blocks.to_le_bytes());
            page[8..16].copy_from_slice(&blocks.to_le_bytes());
            let lbads = state.block_size.trailing_zeros();
            let lbaf0: u32 = lbads << 16;
            page[128..132].copy_from_slice(&lbaf0.to_le_bytes());
        }
        unsafe {
            core::ptr::copy_nonoverlapping(page.as_ptr(), sqe.prp1 as usize as *mut u8, PAGE_SIZE);
        }
    }

    /// Move data between the RAM namespace and the guest pages named by the
    /// command's PRPs.
    fn transfer(&self, state: &mut MockState, sqe: &SubmissionEntry) -> Result<(), (u8, u8, bool)> {
        let block_size = state.block_size as usize;
        let backing_len = state.backing.as_ref().map_or(0, |b| b.len());
        let nlb = (sqe.cdw12 & 0xFFFF) as usize + 1;
        let slba = (sqe.cdw10 as u64 | ((sqe.cdw11 as u64) << 32)) as usize;
        let total = nlb * block_size;
        if slba * block_size + total > backing_len {
            // LBA Out of Range.
            return Err((0, 0x80, true));
        }

        let mut segments: Vec<(u64, usize)> = Vec::new();
        let mut remaining = total;
        let first_len = remaining.min(PAGE_SIZE - (sqe.prp1 as usize & (PAGE_SIZE - 1)));
        segments.push((sqe.prp1, first_len));
        remaining -= first_len;
        if remaining > 0 {
            if remaining <= PAGE_SIZE {
                segments.push((sqe.prp2, remaining));
            } else {
                let mut index = 0usize;
                while remaining > 0 {
                    let entry = unsafe {
                        core::ptr::read((sqe.prp2 as usize + index * 8) as *const u64)
                    };
                    let len = remaining.min(PAGE_SIZE);
                    segments.push((entry, len));
                    remaining -= len;
                    index += 1;
                }
            }
        }

        let backing = state.backing.as_mut().unwrap();
        let mut disk_offset = slba * block_size;
        let is_write = sqe.opcode() == 0x01;
        for (addr, len) in segments {
            unsafe {
                if is_write {
                    core::ptr::copy_nonoverlapping(
                        addr as usize as *const u8,
                        backing[disk_offset..].as_mut_ptr(),
                        len,
                    );
                } else {
                    core::ptr::copy_nonoverlapping(
                        backing[disk_offset..].as_ptr(),
                        addr as usize as *mut u8,
                        len,
                    );
                }
            }
            disk_offset += len;
        }
        Ok(())
    }
}

impl Default for MockNvmeDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterIo for MockNvmeDevice {
    fn read32(&self, offset: u32) -> u32 {
        let regs_state = self.shared.regs.lock();
        match offset {
            regs::CAP => self.shared.cap as u32,
            x if x == regs::CAP + 4 => (self.shared.cap >> 32) as u32,
            regs::VS => 0x0001_0400, // 1.4
            regs::CC => regs_state.cc,
            regs::CSTS => regs_state.csts,
            regs::AQA => regs_state.aqa,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if offset >= regs::DOORBELL_BASE {
            let index = (offset - regs::DOORBELL_BASE) / 4;
            let qid = (index / 2) as u16;
            if index % 2 == 0 {
                self.sq_doorbell(qid, value as u16);
            }
            // CQ head doorbells just acknowledge consumed entries.
            return;
        }
        let mut regs_state = self.shared.regs.lock();
        match offset {
            regs::CC => {
                let was_enabled = regs_state.cc & regs::CC_EN != 0;
                let now_enabled = value & regs::CC_EN != 0;
                regs_state.cc = value;
                if now_enabled {
                    regs_state.csts |= 1; // RDY
                } else {
                    regs_state.csts &= !1;
                }
                drop(regs_state);
                if !was_enabled && now_enabled {
                    self.enable_controller();
                } else if was_enabled && !now_enabled {
                    self.disable_controller();
                }
            }
            regs::AQA => regs_state.aqa = value,
            regs::ASQ => {
                regs_state.asq = (regs_state.asq & !0xFFFF_FFFF) | value as u64;
            }
            x if x == regs::ASQ + 4 => {
                regs_state.asq = (regs_state.asq & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            regs::ACQ => {
                regs_state.acq = (regs_state.acq & !0xFFFF_FFFF) | value as u64;
            }
            x if x == regs::ACQ + 4 => {
                regs_state.acq = (regs_state.acq & 0xFFFF_FFFF) | ((value as u64) << 32);
            }
            _ => {}
        }
    }

    fn read64(&self, offset: u32) -> u64 {
        match offset {
            regs::CAP => self.shared.cap,
            regs::ASQ => self.shared.regs.lock().asq,
            regs::ACQ => self.shared.regs.lock().acq,
            _ => 0,
        }
    }
}
