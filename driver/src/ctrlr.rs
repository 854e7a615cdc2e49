/// Controller lifecycle: bring-up, admin commands, queue management,
/// interrupts, timeout-driven reset, and teardown.
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::cmd::{Command, CompletionEntry, NvmeStatus, SubmissionEntry};
use crate::config::{ModuleConfig, ADMIN_TIMEOUT_US, MAX_IO_QUEUES, MAX_IO_QUEUE_SIZE};
use crate::host::{Clock, InterruptOps, InterruptType};
use crate::io::{self, DsmRange, IoDone, IoRequest, Namespace};
use crate::mem::{DmaBuffer, DmaConstraints, DmaDirection, DmaOps, PAGE_SIZE};
use crate::mmio::RegisterIo;
use crate::queue::{QueuePair, QueueState};
use crate::regs::{self, Cap, Csts};
use crate::slot::{AsyncCmd, CmdContext, SlotState};
use crate::timeout::TIMEOUT_BUCKETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    pub vendor: u16,
    pub device: u16,
}

/// Devices needing register-level workarounds. The only known class today
/// is AWS-hosted NVMe (vendor 0x1d0f), whose advertised admin-queue sizes
/// are unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workaround {
    None,
    AllAws,
}

/// Fields parsed from the Identify Controller page.
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub serial: [u8; 20],
    pub model: [u8; 40],
    pub firmware: [u8; 8],
    pub num_namespaces: u32,
    /// Maximum Data Transfer Size exponent; 0 = unlimited.
    pub mdts: u8,
}

impl ControllerInfo {
    fn parse(page: &[u8]) -> Self {
        let mut serial = [0u8; 20];
        serial.copy_from_slice(&page[4..24]);
        let mut model = [0u8; 40];
        model.copy_from_slice(&page[24..64]);
        let mut firmware = [0u8; 8];
        firmware.copy_from_slice(&page[64..72]);
        let num_namespaces = u32::from_le_bytes(page[516..520].try_into().unwrap());
        let mdts = page[77];
        Self {
            serial,
            model,
            firmware,
            num_namespaces,
            mdts,
        }
    }
}

/// Everything the host hands the driver at device attach.
pub struct AttachParams {
    pub name: String,
    pub regs: Arc<dyn RegisterIo>,
    pub dma: Arc<dyn DmaOps>,
    pub intr: Arc<dyn InterruptOps>,
    pub clock: Arc<dyn Clock>,
    pub pci_id: PciDeviceId,
    pub config: ModuleConfig,
}

/// Completion hook for `submit_async`.
pub type AsyncDone = alloc::boxed::Box<dyn FnOnce(Command) + Send>;

/// Per-device driver instance. Owns the register window, the queue pairs
/// (index 0 = admin), and the lifecycle flags.
pub struct Controller {
    name: String,
    regs: Arc<dyn RegisterIo>,
    dma: Arc<dyn DmaOps>,
    intr: Arc<dyn InterruptOps>,
    clock: Arc<dyn Clock>,
    config: ModuleConfig,
    pci_id: PciDeviceId,
    workaround: Workaround,
    cap: Cap,
    dstrd: u32,
    queues: RwLock<Vec<Option<Arc<QueuePair>>>>,
    /// Upper bound granted by Set-Features/NumQueues.
    max_io_queues: AtomicU32,
    num_io_queues: AtomicU32,
    removed: AtomicBool,
    in_reset: AtomicBool,
    timeout_id: AtomicU32,
    info: Mutex<Option<ControllerInfo>>,
}

impl Controller {
    /// Attach to a controller: interrupt and admin-queue bring-up, enable,
    /// Identify. The returned controller has no I/O queues yet; callers
    /// continue with `set_io_queues` and `create_io_queue`.
    pub fn attach(params: AttachParams) -> Result<Arc<Controller>, NvmeStatus> {
        let AttachParams {
            name,
            regs,
            dma,
            intr,
            clock,
            pci_id,
            mut config,
        } = params;
        config.validate();

        let cap = Cap(regs.read64(regs::CAP));
        let dstrd = cap.doorbell_stride();
        let workaround = if pci_id.vendor == 0x1d0f {
            Workaround::AllAws
        } else {
            Workaround::None
        };
        if workaround != Workaround::None {
            log::warn!("{}: admin-queue workaround active", name);
        }

        intr.alloc_vectors(1).map_err(|_| NvmeStatus::Failure)?;

        let ctrlr = Arc::new(Controller {
            name,
            regs,
            dma,
            intr,
            clock,
            config,
            pci_id,
            workaround,
            cap,
            dstrd,
            queues: RwLock::new(vec![None; MAX_IO_QUEUES as usize + 1]),
            max_io_queues: AtomicU32::new(0),
            num_io_queues: AtomicU32::new(0),
            removed: AtomicBool::new(false),
            in_reset: AtomicBool::new(false),
            timeout_id: AtomicU32::new(0),
            info: Mutex::new(None),
        });

        let admin_entries = ctrlr.admin_queue_entries();
        let admin_intr = ctrlr.msix_vector_for(0);
        let admin = Arc::new(QueuePair::construct(
            0,
            admin_entries,
            admin_entries,
            admin_intr,
            dstrd,
            ctrlr.regs.clone(),
            &ctrlr.dma,
            ctrlr.config.debug_mask,
        )?);
        if let Some(vector) = admin_intr {
            ctrlr
                .intr
                .register(vector, Self::intr_handler(&admin))
                .map_err(|_| NvmeStatus::Failure)?;
        }
        ctrlr.queues.write()[0] = Some(admin.clone());

        ctrlr.hw_disable()?;
        ctrlr.program_admin_regs(&admin);
        admin.init()?;
        ctrlr.hw_enable()?;
        if let Some(vector) = admin_intr {
            ctrlr.intr.enable(vector);
        }
        admin.resume();

        let mut page = [0u8; PAGE_SIZE];
        ctrlr.identify(1, 0, &mut page)?;
        let info = ControllerInfo::parse(&page);
        log::info!(
            "{}: attached, {} namespaces, mdts {}",
            ctrlr.name,
            info.num_namespaces,
            info.mdts
        );
        *ctrlr.info.lock() = Some(info);

        Ok(ctrlr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> Option<ControllerInfo> {
        self.info.lock().clone()
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Hot-removal notification: nothing touches the bus afterwards.
    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn in_reset(&self) -> bool {
        self.in_reset.load(Ordering::Acquire)
    }

    pub fn num_io_queues(&self) -> u16 {
        self.num_io_queues.load(Ordering::Acquire) as u16
    }

    pub fn queue(&self, qid: u16) -> Option<Arc<QueuePair>> {
        self.queues.read().get(qid as usize)?.clone()
    }

    /// Effective DMA constraints for this device, folding in the 4 KiB
    /// allow-list and the module switch.
    pub fn dma_constraints(&self) -> DmaConstraints {
        let constraints = self.dma.constraints();
        if self.is_ebs_custom_device() || self.is_aws_local_device() || self.config.dma_4k_switch {
            constraints.page_aligned()
        } else {
            constraints
        }
    }

    // ---- Register window surface ----

    pub fn read_reg32(&self, offset: u32) -> Result<u32, NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let mut value = self.regs.read32(offset);
        self.apply_register_workaround(offset, &mut value);
        Ok(value)
    }

    pub fn read_reg64(&self, offset: u32) -> Result<u64, NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        Ok(self.regs.read64(offset))
    }

    pub fn write_reg32(&self, offset: u32, value: u32) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        self.regs.write32(offset, value);
        Ok(())
    }

    /// AQA reads lie on the allow-listed devices: their real values are
    /// unusable. `fakeAdminQSize` is 0-based, like the register fields.
    fn apply_register_workaround(&self, offset: u32, value: &mut u32) {
        if offset != regs::AQA {
            return;
        }
        let fake = self.config.fake_admin_q_size as u32;
        match self.workaround {
            Workaround::AllAws => {
                if fake == 0 {
                    log::warn!("{}: raw AQA={:#x}, faking 0x000f000f", self.name, *value);
                    *value = 0x000F_000F;
                } else {
                    log::warn!("{}: raw AQA={:#x}, faking size {:#x}", self.name, *value, fake);
                    *value = (fake << 16) | fake;
                }
            }
            Workaround::None => {
                if fake != 0 {
                    let sq = *value & 0xFFFF;
                    let cq = *value >> 16;
                    if sq >= fake && cq >= fake {
                        log::warn!(
                            "{}: raw AQA={:#x}, faking size {:#x}",
                            self.name,
                            *value,
                            fake
                        );
                        *value = (fake << 16) | fake;
                    }
                }
            }
        }
    }

    fn is_ebs_custom_device(&self) -> bool {
        self.pci_id.vendor == 0x1d0f
            && (self.pci_id.device == 0x0065 || self.pci_id.device == 0x8061)
    }

    fn is_aws_local_device(&self) -> bool {
        self.pci_id.vendor == 0x1d0f && self.pci_id.device == 0xcd00
    }

    fn admin_queue_entries(&self) -> u16 {
        let mut entries = self
            .config
            .admin_queue_size
            .min(self.cap.max_queue_entries());
        let fake = self.config.fake_admin_q_size;
        match self.workaround {
            Workaround::AllAws => {
                let forced = if fake == 0 { 16 } else { fake + 1 };
                entries = entries.min(forced);
            }
            Workaround::None => {
                if fake != 0 && fake + 1 <= entries {
                    entries = fake + 1;
                }
            }
        }
        entries.max(2)
    }

    fn msix_vector_for(&self, qid: u16) -> Option<u32> {
        if self.config.msi_enabled || self.intr.intr_type() != InterruptType::Msix {
            return None;
        }
        let vector = qid as u32;
        if vector < self.intr.vector_count().max(1) {
            Some(vector)
        } else {
            None
        }
    }

    fn intr_handler(qp: &Arc<QueuePair>) -> crate::host::IntrHandler {
        let qp = qp.clone();
        Arc::new(move || {
            qp.process_completions();
        })
    }

    // ---- Controller enable/disable ----

    fn wait_ready(&self, ready: bool) -> Result<(), NvmeStatus> {
        let target = ready;
        let deadline =
            self.clock.now_us() + self.cap.timeout_500ms().max(1) as u64 * 500_000;
        loop {
            let csts = Csts::from_bits_truncate(self.regs.read32(regs::CSTS));
            if csts.contains(Csts::RDY) == target {
                return Ok(());
            }
            if csts.contains(Csts::CFS) {
                log::error!("{}: controller fatal status", self.name);
                return Err(NvmeStatus::Failure);
            }
            if self.clock.now_us() > deadline {
                log::error!("{}: timed out waiting for CSTS.RDY={}", self.name, ready as u8);
                return Err(NvmeStatus::Timeout);
            }
            core::hint::spin_loop();
        }
    }

    fn hw_disable(&self) -> Result<(), NvmeStatus> {
        let cc = self.regs.read32(regs::CC);
        self.regs.write32(regs::CC, cc & !regs::CC_EN);
        self.wait_ready(false)
    }

    fn hw_enable(&self) -> Result<(), NvmeStatus> {
        self.regs.write32(regs::CC, regs::cc_enable_value());
        self.wait_ready(true)
    }

    /// Program AQA/ACQ/ASQ. Only legal while the controller is disabled.
    fn program_admin_regs(&self, admin: &QueuePair) {
        self.regs.write32(
            regs::AQA,
            regs::aqa_value(admin.sq_size(), admin.cq_size()),
        );
        self.regs.write64(regs::ACQ, admin.cq_ring_io_addr());
        self.regs.write64(regs::ASQ, admin.sq_ring_io_addr());
    }

    // ---- Interrupt allocation policy ----

    /// Tear the single-vector setup down and come back with `count`
    /// vectors; the admin handler moves to the new vector 0.
    fn realloc_intr(&self, count: u32) -> Result<(), NvmeStatus> {
        let admin = self.queue(0).ok_or(NvmeStatus::Failure)?;
        admin.suspend();
        if let Some(vector) = admin.intr_index() {
            self.intr.sync_and_disable(vector);
            self.intr.unregister(vector);
        }
        self.intr
            .alloc_vectors(count)
            .map_err(|_| NvmeStatus::Failure)?;
        if self.intr.intr_type() == InterruptType::Msix {
            self.intr
                .register(0, Self::intr_handler(&admin))
                .map_err(|_| NvmeStatus::Failure)?;
            self.intr.enable(0);
        }
        admin.resume();
        Ok(())
    }

    /// Negotiate the I/O queue count: vector re-allocation, the device
    /// allow-list clamp, then Set-Features/NumQueues. Returns the usable
    /// count.
    pub fn set_io_queues(&self, desired: u16) -> Result<u16, NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let mut nr = desired;
        if nr == 0 {
            return Err(NvmeStatus::InvalidParam);
        }
        if nr > MAX_IO_QUEUES {
            log::warn!(
                "{}: clamping requested {} I/O queues to {}",
                self.name,
                nr,
                MAX_IO_QUEUES
            );
            nr = MAX_IO_QUEUES;
        }
        // A known class of cloud-hosted devices reports arbitrary queue
        // counts but functions only with one.
        if self.is_ebs_custom_device() {
            nr = 1;
        }

        if !self.config.msi_enabled && self.intr.intr_type() == InterruptType::Msix {
            let current = self.intr.vector_count();
            if current == 1 || current != 1 + nr as u32 {
                self.realloc_intr(1 + nr as u32)?;
            }
            nr = nr.min((self.intr.vector_count().saturating_sub(1)).max(1) as u16);
        } else {
            nr = 1;
        }

        let granted = self.request_io_queues(nr)?;
        self.max_io_queues.store(granted as u32, Ordering::Release);
        log::info!("{}: {} I/O queues usable", self.name, granted);
        Ok(granted)
    }

    /// Set-Features/NumQueues; request and response are 0-based, the
    /// device may grant fewer, and the usable count is the minimum.
    fn request_io_queues(&self, desired: u16) -> Result<u16, NvmeStatus> {
        let sqe = SubmissionEntry::set_num_queues(desired - 1, desired - 1);
        let (cqe, status) = self.submit_sync(sqe, None, 0, ADMIN_TIMEOUT_US)?;
        if !status.is_success() {
            log::error!("{}: set-features failed: {}", self.name, status);
            return Err(status);
        }
        let nsqa = (cqe.dw0 & 0xFFFF) as u16;
        let ncqa = (cqe.dw0 >> 16) as u16;
        let mut granted = desired;
        if nsqa + 1 < granted {
            granted = nsqa + 1;
        }
        if ncqa + 1 < granted {
            granted = ncqa + 1;
        }
        Ok(granted)
    }

    // ---- Queue management ----

    /// Create and start I/O queue `qid`: Create-CQ then Create-SQ (the
    /// device must see the completion queue before the submission queue
    /// that posts to it).
    pub fn create_io_queue(&self, qid: u16, qsize: u16) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        if qid == 0 || qid as u32 > self.max_io_queues.load(Ordering::Acquire) {
            return Err(NvmeStatus::InvalidParam);
        }
        if self.queue(qid).is_some() {
            log::warn!("{}: queue {} already exists", self.name, qid);
            return Ok(());
        }
        let qsize = qsize
            .clamp(2, MAX_IO_QUEUE_SIZE)
            .min(self.cap.max_queue_entries());

        let intr_index = self.msix_vector_for(qid);
        let qp = Arc::new(QueuePair::construct(
            qid,
            qsize,
            qsize,
            intr_index,
            self.dstrd,
            self.regs.clone(),
            &self.dma,
            self.config.debug_mask,
        )?);
        if let Some(vector) = intr_index {
            self.intr
                .register(vector, Self::intr_handler(&qp))
                .map_err(|_| NvmeStatus::Failure)?;
        }
        self.queues.write()[qid as usize] = Some(qp.clone());

        if let Err(status) = self.start_queue(&qp) {
            log::error!("{}: failed to start queue {}: {}", self.name, qid, status);
            if let Some(vector) = intr_index {
                self.intr.unregister(vector);
            }
            self.queues.write()[qid as usize] = None;
            return Err(status);
        }
        self.num_io_queues.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stop and free queue `qid`, surfacing `status` to everything still
    /// in flight.
    pub fn destroy_queue(&self, qid: u16, status: NvmeStatus) -> Result<(), NvmeStatus> {
        if qid == 0 || qid > MAX_IO_QUEUES {
            return Err(NvmeStatus::InvalidParam);
        }
        let Some(qp) = self.queue(qid) else {
            return Ok(());
        };
        self.stop_queue(&qp, status);
        self.wait_queue_idle(&qp);
        qp.mark_nonexistent();
        if let Some(vector) = qp.intr_index() {
            self.intr.unregister(vector);
        }
        self.queues.write()[qid as usize] = None;
        self.num_io_queues.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Reset rings and state, then (for I/O queues) create the hardware
    /// queues and go Active.
    fn start_queue(&self, qp: &Arc<QueuePair>) -> Result<(), NvmeStatus> {
        qp.init()?;
        if qp.qid() > 0 {
            self.create_cq(qp)?;
            if let Err(status) = self.create_sq(qp) {
                let _ = self.delete_cq(qp.qid());
                return Err(status);
            }
        }
        if let Some(vector) = qp.intr_index() {
            self.intr.enable(vector);
        }
        qp.resume();
        Ok(())
    }

    /// Suspend, silence the vector, delete the hardware queues (SQ first,
    /// so the device drains it into the CQ), then flush survivors.
    fn stop_queue(&self, qp: &QueuePair, status: NvmeStatus) {
        let prev = qp.suspend();
        if prev == QueueState::Suspended {
            log::warn!("{}: suspending inactive queue {}", self.name, qp.qid());
        }
        if let Some(vector) = qp.intr_index() {
            self.intr.sync_and_disable(vector);
        }
        if !self.is_removed() {
            let csts = Csts::from_bits_truncate(self.regs.read32(regs::CSTS));
            if qp.qid() != 0 && csts.contains(Csts::RDY) && !csts.contains(Csts::CFS) {
                let _ = self.delete_sq(qp.qid());
                let _ = self.delete_cq(qp.qid());
            }
        }
        qp.flush(status);
    }

    /// Submitters cannot acquire slots once the queue is suspended, but one
    /// may already be mid-submit; spin it out.
    fn wait_queue_idle(&self, qp: &QueuePair) {
        let mut spins = 0u64;
        while qp.refcount() != 0 {
            spins += 1;
            if spins % 1_000_000 == 0 {
                log::warn!(
                    "{}: waiting for queue {} refcount to drain",
                    self.name,
                    qp.qid()
                );
            }
            core::hint::spin_loop();
        }
    }

    fn create_cq(&self, qp: &QueuePair) -> Result<(), NvmeStatus> {
        let iv = qp.intr_index().unwrap_or(0) as u16;
        let sqe = SubmissionEntry::create_io_cq(
            qp.qid(),
            qp.cq_size(),
            qp.cq_ring_io_addr(),
            iv,
            qp.intr_index().is_some(),
        );
        let (_, status) = self.submit_sync(sqe, None, 0, ADMIN_TIMEOUT_US)?;
        if status.is_success() {
            log::debug!("{}: cq {} created", self.name, qp.qid());
            Ok(())
        } else {
            log::error!("{}: create cq failed: {}", self.name, status);
            Err(status)
        }
    }

    fn create_sq(&self, qp: &QueuePair) -> Result<(), NvmeStatus> {
        let sqe = SubmissionEntry::create_io_sq(
            qp.qid(),
            qp.sq_size(),
            qp.sq_ring_io_addr(),
            qp.qid(),
        );
        let (_, status) = self.submit_sync(sqe, None, 0, ADMIN_TIMEOUT_US)?;
        if status.is_success() {
            log::debug!("{}: sq {} created", self.name, qp.qid());
            Ok(())
        } else {
            log::error!("{}: create sq failed: {}", self.name, status);
            Err(status)
        }
    }

    fn delete_sq(&self, qid: u16) -> Result<(), NvmeStatus> {
        let sqe = SubmissionEntry::delete_io_sq(qid);
        let (_, status) = self.submit_sync(sqe, None, 0, ADMIN_TIMEOUT_US)?;
        if status.is_success() {
            log::debug!("{}: sq {} deleted", self.name, qid);
            Ok(())
        } else {
            log::error!("{}: delete sq {} failed: {}", self.name, qid, status);
            Err(status)
        }
    }

    fn delete_cq(&self, qid: u16) -> Result<(), NvmeStatus> {
        let sqe = SubmissionEntry::delete_io_cq(qid);
        let (_, status) = self.submit_sync(sqe, None, 0, ADMIN_TIMEOUT_US)?;
        if status.is_success() {
            log::debug!("{}: cq {} deleted", self.name, qid);
            Ok(())
        } else {
            log::error!("{}: delete cq {} failed: {}", self.name, qid, status);
            Err(status)
        }
    }

    // ---- Command submission surface ----

    /// Queue a prepared command; its completion arrives through `done`.
    /// On rejection the command and hook come back to the caller.
    pub fn submit_async(
        &self,
        cmd: Command,
        done: AsyncDone,
        qid: u16,
    ) -> Result<(), (NvmeStatus, Command, AsyncDone)> {
        if self.is_removed() {
            return Err((NvmeStatus::PermanentDeviceLoss, cmd, done));
        }
        let Some(qp) = self.queue(qid) else {
            return Err((NvmeStatus::InvalidParam, cmd, done));
        };
        if !qp.is_active() {
            return Err((NvmeStatus::InReset, cmd, done));
        }
        qp.enter();
        let Some(slot) = qp.slots.acquire() else {
            qp.leave();
            return Err((NvmeStatus::QueueFull, cmd, done));
        };
        {
            let mut data = slot.data.lock();
            data.sqe = cmd.sqe;
            data.status = NvmeStatus::Success;
            data.ctx = CmdContext::Async(AsyncCmd { cmd, done });
        }
        match qp.issue(slot) {
            Ok(()) => {
                qp.leave();
                Ok(())
            }
            Err(status) => {
                log::warn!(
                    "{}: failed to issue command on queue {}: {}",
                    self.name,
                    qid,
                    status
                );
                let ctx = {
                    let mut data = slot.data.lock();
                    core::mem::replace(&mut data.ctx, CmdContext::None)
                };
                qp.slots.release(slot);
                qp.leave();
                let CmdContext::Async(async_cmd) = ctx else {
                    unreachable!()
                };
                Err((status, async_cmd.cmd, async_cmd.done))
            }
        }
    }

    /// Submit and wait. `buf` (at most one page) shadows the command's data
    /// transfer through an internal bounce buffer. On `Timeout` the payload
    /// ownership stays with the eventual completer; the caller just walks
    /// away.
    pub fn submit_sync(
        &self,
        sqe: SubmissionEntry,
        buf: Option<&mut [u8]>,
        qid: u16,
        timeout_us: u64,
    ) -> Result<(CompletionEntry, NvmeStatus), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let Some(qp) = self.queue(qid) else {
            return Err(NvmeStatus::InvalidParam);
        };
        if !qp.is_active() {
            return Err(NvmeStatus::InReset);
        }
        let len = buf.as_ref().map_or(0, |b| b.len());
        if len > PAGE_SIZE {
            // Sync commands never need a PRP list.
            return Err(NvmeStatus::InvalidParam);
        }
        qp.enter();
        let result = self.do_submit_sync(&qp, sqe, buf, len, timeout_us);
        qp.leave();
        result
    }

    fn do_submit_sync(
        &self,
        qp: &QueuePair,
        sqe: SubmissionEntry,
        mut buf: Option<&mut [u8]>,
        len: usize,
        timeout_us: u64,
    ) -> Result<(CompletionEntry, NvmeStatus), NvmeStatus> {
        let Some(slot) = qp.slots.acquire() else {
            return Err(NvmeStatus::QueueFull);
        };

        let caller_cid = sqe.cid();
        let mut sqe = sqe;
        let opcode = sqe.opcode();
        // Opcode bit 0 = host-to-controller transfer, bit 1 = the reverse.
        let dir = if opcode & 0x3 == 0x1 {
            DmaDirection::ToDevice
        } else {
            DmaDirection::FromDevice
        };
        let mut bounce = None;
        if len > 0 && (opcode & 0x3 == 0x1 || opcode & 0x3 == 0x2) {
            let mut b = match DmaBuffer::alloc(&self.dma, len, dir) {
                Ok(b) => b,
                Err(err) => {
                    qp.slots.release(slot);
                    return Err(NvmeStatus::from(err));
                }
            };
            if dir == DmaDirection::ToDevice {
                b.copy_from_slice(buf.as_deref().unwrap());
            }
            sqe.prp1 = b.io_addr();
            bounce = Some(b);
        }

        {
            let mut data = slot.data.lock();
            data.sqe = sqe;
            data.status = NvmeStatus::Success;
            data.ctx = CmdContext::Sync(crate::slot::SyncCmd {
                cmd: Command::new(sqe),
                bounce,
                dir,
            });
        }

        if let Err(status) = qp.issue(slot) {
            let mut data = slot.data.lock();
            data.ctx = CmdContext::None;
            drop(data);
            qp.slots.release(slot);
            return Err(status);
        }

        // Wait for the completer, draining the ring ourselves so the sync
        // path stays live in poll mode; the drain is idempotent with MSI-X
        // delivery.
        let deadline = self.clock.now_us() + timeout_us;
        loop {
            qp.process_completions();
            match slot.state() {
                SlotState::Done => break,
                SlotState::Active => {
                    if self.clock.now_us() > deadline
                        && slot
                            .compare_exchange_state(SlotState::Active, SlotState::FreeOnComplete)
                            .is_ok()
                    {
                        // Ownership of the payload transfers to the
                        // completer; it frees the record if the device
                        // eventually answers.
                        log::warn!(
                            "{}: sync command {:#04x} timed out on queue {}",
                            self.name,
                            opcode,
                            qp.qid()
                        );
                        return Err(NvmeStatus::Timeout);
                    }
                    core::hint::spin_loop();
                }
                state => {
                    debug_assert!(false, "unexpected sync slot state {:?}", state);
                    break;
                }
            }
        }

        let (mut cqe, status) = {
            let mut data = slot.data.lock();
            let ctx = core::mem::replace(&mut data.ctx, CmdContext::None);
            if let CmdContext::Sync(sync_cmd) = ctx {
                if sync_cmd.dir == DmaDirection::FromDevice {
                    if let (Some(buf), Some(bounce)) = (buf.as_deref_mut(), sync_cmd.bounce.as_ref())
                    {
                        buf.copy_from_slice(&bounce.as_slice()[..len]);
                    }
                }
            }
            (data.cqe, data.status)
        };
        qp.slots.release(slot);
        cqe.set_cid(caller_cid);
        Ok((cqe, status))
    }

    /// Identify (controller or namespace) into a caller page.
    pub fn identify(&self, cns: u32, nsid: u32, page: &mut [u8]) -> Result<(), NvmeStatus> {
        if page.len() != PAGE_SIZE {
            return Err(NvmeStatus::InvalidParam);
        }
        let sqe = SubmissionEntry::identify(cns, nsid, 0); // PRP set by the bounce
        let (_, status) = self.submit_sync(sqe, Some(page), 0, ADMIN_TIMEOUT_US)?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    /// Split a block request into hardware commands on queue `qid`.
    pub fn submit_io(&self, ns: &Namespace, request: IoRequest, qid: u16) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let Some(qp) = self.queue(qid) else {
            log::error!("{}: invalid I/O queue {}", self.name, qid);
            return Err(NvmeStatus::Quiesced);
        };
        io::submit_io_request(
            &qp,
            ns,
            request,
            self.in_reset(),
            self.timeout_id.load(Ordering::Relaxed),
            self.dma_constraints().sg_max_entries,
        )
    }

    pub fn submit_flush(&self, ns: &Namespace, qid: u16, done: IoDone) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let Some(qp) = self.queue(qid) else {
            return Err(NvmeStatus::Quiesced);
        };
        io::submit_flush(&qp, ns, self.in_reset(), done)
    }

    pub fn submit_dsm(
        &self,
        ns: &Namespace,
        qid: u16,
        ranges: &[DsmRange],
        done: IoDone,
    ) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        let Some(qp) = self.queue(qid) else {
            return Err(NvmeStatus::Quiesced);
        };
        io::submit_dsm(&qp, ns, self.in_reset(), ranges, done)
    }

    // ---- Completion delivery ----

    /// Drain every active I/O completion queue (storage-poll mode).
    pub fn poll_handler(&self) {
        let queues: Vec<Arc<QueuePair>> = self
            .queues
            .read()
            .iter()
            .skip(1)
            .flatten()
            .cloned()
            .collect();
        for qp in queues {
            if qp.is_active() {
                qp.process_completions();
            }
        }
    }

    /// Drain the admin completion queue (the admin vector's handler path).
    pub fn process_admin_completions(&self) {
        if let Some(admin) = self.queue(0) {
            admin.process_completions();
        }
    }

    /// Interrupt vector backing `qid`, for upstream-managed poll/interrupt
    /// toggling. Single-vector regimes share vector 0.
    pub fn intr_cookie(&self, qid: u16) -> Option<u32> {
        if !self.config.msi_enabled && self.intr.intr_type() == InterruptType::Msix {
            if (qid as u32) < self.intr.vector_count() {
                Some(qid as u32)
            } else {
                None
            }
        } else {
            Some(0)
        }
    }

    // ---- Timeout and reset ----

    /// Coarse timer tick (~1 s). Advances the timeout bucket cursor and
    /// resets the controller when a bucket survives a full revolution.
    pub fn timeout_tick(&self) -> bool {
        let next = (self.timeout_id.load(Ordering::Relaxed) + 1) % TIMEOUT_BUCKETS as u32;
        let queues: Vec<Arc<QueuePair>> = self.queues.read().iter().flatten().cloned().collect();
        let stuck = queues
            .iter()
            .any(|qp| qp.is_active() && qp.timeouts.stuck(next));
        self.timeout_id.store(next, Ordering::Relaxed);
        if stuck {
            log::error!("{}: stuck commands detected, resetting", self.name);
            let _ = self.reset();
            return true;
        }
        false
    }

    /// Full controller reset: every in-flight command surfaces `InReset`,
    /// the device is disabled and re-enabled, and all queues are rebuilt.
    pub fn reset(&self) -> Result<(), NvmeStatus> {
        if self.is_removed() {
            return Err(NvmeStatus::PermanentDeviceLoss);
        }
        if self.in_reset.swap(true, Ordering::AcqRel) {
            return Err(NvmeStatus::InReset);
        }
        log::warn!("{}: controller reset", self.name);

        let io_queues: Vec<Arc<QueuePair>> = self
            .queues
            .read()
            .iter()
            .skip(1)
            .flatten()
            .cloned()
            .collect();
        // Stop I/O queues while the admin queue can still carry the
        // hardware deletes, then the admin queue itself.
        for qp in &io_queues {
            self.stop_queue(qp, NvmeStatus::InReset);
            self.wait_queue_idle(qp);
        }
        let admin = self.queue(0).ok_or(NvmeStatus::Failure)?;
        self.stop_queue(&admin, NvmeStatus::InReset);
        self.wait_queue_idle(&admin);

        let result = (|| {
            self.hw_disable()?;
            self.program_admin_regs(&admin);
            admin.init()?;
            self.hw_enable()?;
            if let Some(vector) = admin.intr_index() {
                self.intr.enable(vector);
            }
            admin.resume();
            for qp in &io_queues {
                self.start_queue(qp)?;
            }
            Ok(())
        })();

        self.in_reset.store(false, Ordering::Release);
        result
    }

    /// Quiesce and release everything. The controller must not be used
    /// afterwards.
    pub fn detach(&self) {
        let io_qids: Vec<u16> = self
            .queues
            .read()
            .iter()
            .skip(1)
            .flatten()
            .map(|qp| qp.qid())
            .collect();
        for qid in io_qids {
            let _ = self.destroy_queue(qid, NvmeStatus::Quiesced);
        }
        if let Some(admin) = self.queue(0) {
            self.stop_queue(&admin, NvmeStatus::Quiesced);
            self.wait_queue_idle(&admin);
            admin.mark_nonexistent();
            if let Some(vector) = admin.intr_index() {
                self.intr.unregister(vector);
            }
            self.queues.write()[0] = None;
        }
        if !self.is_removed() {
            let _ = self.hw_disable();
        }
        log::info!("{}: detached", self.name);
    }

    #[cfg(any(test, feature = "mock-device"))]
    pub(crate) fn queue_for_test(&self, qid: u16) -> Option<Arc<QueuePair>> {
        self.queue(qid)
    }

    /// Walk an I/O queue's slots and report how many are in flight; used
    /// by diagnostics and tests.
    pub fn queue_depth_in_use(&self, qid: u16) -> Option<u32> {
        Some(self.queue(qid)?.slots.in_use())
    }
}
