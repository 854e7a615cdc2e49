/// NVMe queue-entry layouts, command construction and status translation.
///
/// Per NVMe spec 1.x:
/// - Submission Queue Entry (SQE): 64 bytes
/// - Completion Queue Entry (CQE): 16 bytes
use core::fmt;

/// NVMe admin command opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOpcode {
    DeleteIoSq = 0x00,
    CreateIoSq = 0x01,
    DeleteIoCq = 0x04,
    CreateIoCq = 0x05,
    Identify = 0x06,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
}

/// NVMe NVM I/O command opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmOpcode {
    Flush = 0x00,
    Write = 0x01,
    Read = 0x02,
    DatasetMgmt = 0x09,
}

/// Feature identifier for Set-Features/Number-of-Queues.
pub const FEATURE_NUM_QUEUES: u32 = 0x07;

/// Generic status code: Namespace Not Ready. The DNR bit decides whether
/// the host may retry.
pub const SC_NS_NOT_READY: u8 = 0x82;

/// NVMe Submission Queue Entry — 64 bytes.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
pub struct SubmissionEntry {
    /// Command Dword 0: Opcode[7:0], FUSE[9:8], PSDT[15:14], CID[31:16]
    pub cdw0: u32,
    /// Namespace Identifier
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    /// Metadata Pointer
    pub mptr: u64,
    /// PRP Entry 1
    pub prp1: u64,
    /// PRP Entry 2 or PRP List Pointer
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SubmissionEntry>(), 64);

impl SubmissionEntry {
    pub const fn zeroed() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    #[inline]
    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    /// Overwrite the command identifier. The driver always stamps the
    /// owning slot's stable id just before the ring copy.
    #[inline]
    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xFFFF) | ((cid as u32) << 16);
    }

    /// Identify (admin 0x06). `cns`: 0 = namespace, 1 = controller.
    pub fn identify(cns: u32, nsid: u32, data_io_addr: u64) -> Self {
        Self {
            cdw0: AdminOpcode::Identify as u32,
            nsid,
            prp1: data_io_addr,
            cdw10: cns,
            ..Self::zeroed()
        }
    }

    /// Set-Features/Number-of-Queues (admin 0x09). Requested counts are
    /// 0-based.
    pub fn set_num_queues(nsqr: u16, ncqr: u16) -> Self {
        Self {
            cdw0: AdminOpcode::SetFeatures as u32,
            cdw10: FEATURE_NUM_QUEUES,
            cdw11: ((ncqr as u32) << 16) | nsqr as u32,
            ..Self::zeroed()
        }
    }

    /// Create I/O Completion Queue (admin 0x05). PC=1; `iv`/`ien` bind the
    /// interrupt vector.
    pub fn create_io_cq(qid: u16, size: u16, ring_io_addr: u64, iv: u16, ien: bool) -> Self {
        Self {
            cdw0: AdminOpcode::CreateIoCq as u32,
            prp1: ring_io_addr,
            // CDW10: QSIZE[31:16] (0-based) | QID[15:0]
            cdw10: ((size as u32 - 1) << 16) | qid as u32,
            // CDW11: IV[31:16] | IEN[1] | PC[0]
            cdw11: ((iv as u32) << 16) | ((ien as u32) << 1) | 0x1,
            ..Self::zeroed()
        }
    }

    /// Create I/O Submission Queue (admin 0x01). PC=1, priority 0.
    pub fn create_io_sq(qid: u16, size: u16, ring_io_addr: u64, cqid: u16) -> Self {
        Self {
            cdw0: AdminOpcode::CreateIoSq as u32,
            prp1: ring_io_addr,
            cdw10: ((size as u32 - 1) << 16) | qid as u32,
            // CDW11: CQID[31:16] | QPRIO[2:1] | PC[0]
            cdw11: ((cqid as u32) << 16) | 0x1,
            ..Self::zeroed()
        }
    }

    /// Delete I/O Submission Queue (admin 0x00).
    pub fn delete_io_sq(qid: u16) -> Self {
        Self {
            cdw0: AdminOpcode::DeleteIoSq as u32,
            cdw10: qid as u32,
            ..Self::zeroed()
        }
    }

    /// Delete I/O Completion Queue (admin 0x04).
    pub fn delete_io_cq(qid: u16) -> Self {
        Self {
            cdw0: AdminOpcode::DeleteIoCq as u32,
            cdw10: qid as u32,
            ..Self::zeroed()
        }
    }

    /// NVM Read/Write header. PRPs and PI fields are filled by the
    /// submission path.
    pub fn nvm_io(op: NvmOpcode, nsid: u32, start_lba: u64, num_lba_0based: u16) -> Self {
        Self {
            cdw0: op as u32,
            nsid,
            cdw10: start_lba as u32,
            cdw11: (start_lba >> 32) as u32,
            cdw12: num_lba_0based as u32,
            ..Self::zeroed()
        }
    }

    /// NVM Flush (I/O 0x00).
    pub fn flush(nsid: u32) -> Self {
        Self {
            cdw0: NvmOpcode::Flush as u32,
            nsid,
            ..Self::zeroed()
        }
    }

    /// Dataset Management (I/O 0x09) with the Deallocate attribute. The
    /// range list is carried in a single PRP page.
    pub fn dataset_mgmt(nsid: u32, num_ranges: u16, list_io_addr: u64) -> Self {
        Self {
            cdw0: NvmOpcode::DatasetMgmt as u32,
            nsid,
            prp1: list_io_addr,
            cdw10: (num_ranges as u32 - 1), // 0-based
            cdw11: 1 << 2,                  // Deallocate
            ..Self::zeroed()
        }
    }

    /// Force Unit Access bit (CDW12[30]) on Read/Write.
    pub fn set_fua(&mut self, fua: bool) {
        if fua {
            self.cdw12 |= 1 << 30;
        } else {
            self.cdw12 &= !(1 << 30);
        }
    }

    /// Protection Information check bits (CDW12[29:26]) on Read/Write.
    pub fn set_prinfo(&mut self, prinfo: u8) {
        self.cdw12 = (self.cdw12 & !(0xF << 26)) | (((prinfo & 0xF) as u32) << 26);
    }

    /// Expected Initial Logical Block Reference Tag (CDW14).
    pub fn set_exp_ref_tag(&mut self, tag: u32) {
        self.cdw14 = tag;
    }
}

/// NVMe Completion Queue Entry — 16 bytes.
///
/// DW2: SQ Head Pointer[15:0] | SQ Identifier[31:16]
/// DW3: CID[15:0] | Phase[16] | Status Field[31:17] (SC[24:17], SCT[27:25],
/// CRD[29:28], M[30], DNR[31])
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct CompletionEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub dw2: u32,
    pub dw3: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<CompletionEntry>(), 16);

impl CompletionEntry {
    pub const fn zeroed() -> Self {
        Self {
            dw0: 0,
            dw1: 0,
            dw2: 0,
            dw3: 0,
        }
    }

    /// Build an entry; used by the mock controller and by tests.
    pub fn new(cid: u16, sq_head: u16, sq_id: u16, phase: bool, sct: u8, sc: u8, dnr: bool) -> Self {
        let dw3 = cid as u32
            | ((phase as u32) << 16)
            | ((sc as u32) << 17)
            | (((sct & 0x7) as u32) << 25)
            | ((dnr as u32) << 31);
        Self {
            dw0: 0,
            dw1: 0,
            dw2: sq_head as u32 | ((sq_id as u32) << 16),
            dw3,
        }
    }

    #[inline]
    pub fn sq_head(&self) -> u16 {
        (self.dw2 & 0xFFFF) as u16
    }

    #[inline]
    pub fn sq_id(&self) -> u16 {
        (self.dw2 >> 16) as u16
    }

    #[inline]
    pub fn cid(&self) -> u16 {
        (self.dw3 & 0xFFFF) as u16
    }

    #[inline]
    pub fn phase(&self) -> bool {
        (self.dw3 >> 16) & 1 != 0
    }

    /// Status Code.
    #[inline]
    pub fn sc(&self) -> u8 {
        ((self.dw3 >> 17) & 0xFF) as u8
    }

    /// Status Code Type.
    #[inline]
    pub fn sct(&self) -> u8 {
        ((self.dw3 >> 25) & 0x7) as u8
    }

    /// Do-Not-Retry.
    #[inline]
    pub fn dnr(&self) -> bool {
        (self.dw3 >> 31) & 1 != 0
    }

    /// Rewrite the CID field; the driver restores the caller's original CID
    /// in the copy handed back through completion callbacks.
    #[inline]
    pub fn set_cid(&mut self, cid: u16) {
        self.dw3 = (self.dw3 & !0xFFFF) | cid as u32;
    }
}

/// Driver status taxonomy: device completion statuses plus the driver's own
/// rejection and lifecycle codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeStatus {
    Success,
    /// Namespace not ready, DNR clear — upstream retries.
    NamespaceNotReadyRetry,
    /// Namespace not ready, DNR set.
    NamespaceNotReadyNoRetry,
    /// Any other device-reported error.
    Device { sct: u8, sc: u8, dnr: bool },
    /// Completion reported fewer bytes than requested.
    Underrun,
    /// Completion reported more bytes than requested.
    Overrun,
    /// Protection-information validation failed before submission.
    InvalidPi,
    /// CDB validation failed before submission.
    InvalidCdb,
    /// Upstream handed an SG array the PRP translator cannot express.
    InvalidParam,
    /// Namespace offline at submit time.
    Quiesced,
    /// Controller mid-reset.
    InReset,
    /// No free command slot, or the submission ring is full.
    QueueFull,
    OutOfMemory,
    IommuMapFailed,
    /// Sync waiter exceeded its deadline; the completer owns the payload.
    Timeout,
    /// Controller marked removed; nothing touches the bus anymore.
    PermanentDeviceLoss,
    Failure,
}

impl NvmeStatus {
    /// Translate a completion entry into a driver status.
    ///
    /// The mapping: (SCT 0, SC 0) is success; (SCT 0, SC 0x82) splits on the
    /// DNR bit into retry/no-retry; everything else is surfaced verbatim as
    /// a device status.
    pub fn from_cqe(cqe: &CompletionEntry) -> Self {
        let (sct, sc, dnr) = (cqe.sct(), cqe.sc(), cqe.dnr());
        match (sct, sc) {
            (0, 0) => NvmeStatus::Success,
            (0, SC_NS_NOT_READY) => {
                if dnr {
                    NvmeStatus::NamespaceNotReadyNoRetry
                } else {
                    NvmeStatus::NamespaceNotReadyRetry
                }
            }
            _ => NvmeStatus::Device { sct, sc, dnr },
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, NvmeStatus::Success)
    }

    /// Whether the upstream layer may retry the command.
    pub fn is_retryable(&self) -> bool {
        match self {
            NvmeStatus::NamespaceNotReadyRetry => true,
            NvmeStatus::Device { dnr, .. } => !dnr,
            NvmeStatus::QueueFull
            | NvmeStatus::InReset
            | NvmeStatus::OutOfMemory
            | NvmeStatus::IommuMapFailed => true,
            _ => false,
        }
    }
}

impl From<crate::mem::DmaError> for NvmeStatus {
    fn from(err: crate::mem::DmaError) -> Self {
        match err {
            crate::mem::DmaError::IommuMapFailed => NvmeStatus::IommuMapFailed,
            _ => NvmeStatus::OutOfMemory,
        }
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeStatus::Success => write!(f, "success"),
            NvmeStatus::NamespaceNotReadyRetry => write!(f, "namespace not ready (retry)"),
            NvmeStatus::NamespaceNotReadyNoRetry => write!(f, "namespace not ready (no retry)"),
            NvmeStatus::Device { sct, sc, dnr } => {
                write!(f, "device status sct={:#x} sc={:#x} dnr={}", sct, sc, dnr)
            }
            NvmeStatus::Underrun => write!(f, "data underrun"),
            NvmeStatus::Overrun => write!(f, "data overrun"),
            NvmeStatus::InvalidPi => write!(f, "invalid protection information"),
            NvmeStatus::InvalidCdb => write!(f, "invalid CDB"),
            NvmeStatus::InvalidParam => write!(f, "invalid parameter"),
            NvmeStatus::Quiesced => write!(f, "namespace quiesced"),
            NvmeStatus::InReset => write!(f, "controller in reset"),
            NvmeStatus::QueueFull => write!(f, "queue full"),
            NvmeStatus::OutOfMemory => write!(f, "out of memory"),
            NvmeStatus::IommuMapFailed => write!(f, "IOMMU mapping failed"),
            NvmeStatus::Timeout => write!(f, "command timeout"),
            NvmeStatus::PermanentDeviceLoss => write!(f, "permanent device loss"),
            NvmeStatus::Failure => write!(f, "failure"),
        }
    }
}

/// A prepared command and its completion, the unit handed to `submit_async`
/// and returned through the completion callback.
pub struct Command {
    pub sqe: SubmissionEntry,
    pub cqe: CompletionEntry,
    pub status: NvmeStatus,
}

impl Command {
    pub fn new(sqe: SubmissionEntry) -> Self {
        Self {
            sqe,
            cqe: CompletionEntry::zeroed(),
            status: NvmeStatus::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqe_cid_stamping() {
        let mut sqe = SubmissionEntry::identify(1, 0, 0x1000);
        assert_eq!(sqe.opcode(), 0x06);
        sqe.set_cid(42);
        assert_eq!(sqe.cid(), 42);
        assert_eq!(sqe.opcode(), 0x06);
        sqe.set_cid(7);
        assert_eq!(sqe.cid(), 7);
    }

    #[test]
    fn cqe_field_extraction() {
        let cqe = CompletionEntry::new(9, 3, 1, true, 0, 0, false);
        assert_eq!(cqe.cid(), 9);
        assert_eq!(cqe.sq_head(), 3);
        assert_eq!(cqe.sq_id(), 1);
        assert!(cqe.phase());
        assert_eq!(cqe.sct(), 0);
        assert_eq!(cqe.sc(), 0);
        assert!(!cqe.dnr());
    }

    #[test]
    fn create_cq_encoding() {
        let sqe = SubmissionEntry::create_io_cq(2, 64, 0xABC000, 2, true);
        assert_eq!(sqe.opcode(), 0x05);
        assert_eq!(sqe.prp1, 0xABC000);
        assert_eq!(sqe.cdw10, (63 << 16) | 2);
        assert_eq!(sqe.cdw11, (2 << 16) | 0b11);
    }

    #[test]
    fn create_sq_encoding() {
        let sqe = SubmissionEntry::create_io_sq(2, 64, 0xDEF000, 2);
        assert_eq!(sqe.opcode(), 0x01);
        assert_eq!(sqe.cdw10, (63 << 16) | 2);
        assert_eq!(sqe.cdw11, (2 << 16) | 0x1);
    }

    #[test]
    fn nvm_io_lba_split() {
        let sqe = SubmissionEntry::nvm_io(NvmOpcode::Read, 1, 0x1_2345_6789, 15);
        assert_eq!(sqe.cdw10, 0x2345_6789);
        assert_eq!(sqe.cdw11, 0x1);
        assert_eq!(sqe.cdw12, 15);
    }

    #[test]
    fn fua_and_prinfo_bits() {
        let mut sqe = SubmissionEntry::nvm_io(NvmOpcode::Write, 1, 0, 7);
        sqe.set_fua(true);
        sqe.set_prinfo(0x7);
        assert_eq!(sqe.cdw12, 7 | (1 << 30) | (0x7 << 26));
        sqe.set_fua(false);
        assert_eq!(sqe.cdw12, 7 | (0x7 << 26));
    }

    // Status translation mapping, one case per (SCT, SC, DNR) class.

    #[test]
    fn status_success() {
        let cqe = CompletionEntry::new(1, 0, 0, true, 0, 0, false);
        assert_eq!(NvmeStatus::from_cqe(&cqe), NvmeStatus::Success);
    }

    #[test]
    fn status_ns_not_ready_splits_on_dnr() {
        let retry = CompletionEntry::new(1, 0, 0, true, 0, SC_NS_NOT_READY, false);
        assert_eq!(
            NvmeStatus::from_cqe(&retry),
            NvmeStatus::NamespaceNotReadyRetry
        );
        assert!(NvmeStatus::from_cqe(&retry).is_retryable());

        let no_retry = CompletionEntry::new(1, 0, 0, true, 0, SC_NS_NOT_READY, true);
        assert_eq!(
            NvmeStatus::from_cqe(&no_retry),
            NvmeStatus::NamespaceNotReadyNoRetry
        );
        assert!(!NvmeStatus::from_cqe(&no_retry).is_retryable());
    }

    #[test]
    fn status_generic_errors_surface_verbatim() {
        // Invalid opcode, DNR set.
        let cqe = CompletionEntry::new(1, 0, 0, true, 0, 0x01, true);
        assert_eq!(
            NvmeStatus::from_cqe(&cqe),
            NvmeStatus::Device {
                sct: 0,
                sc: 0x01,
                dnr: true
            }
        );
        assert!(!NvmeStatus::from_cqe(&cqe).is_retryable());
    }

    #[test]
    fn status_media_error_retry_follows_dnr() {
        // SCT 2 (media), unrecovered read error, DNR clear -> retryable.
        let cqe = CompletionEntry::new(1, 0, 0, true, 2, 0x81, false);
        let status = NvmeStatus::from_cqe(&cqe);
        assert_eq!(
            status,
            NvmeStatus::Device {
                sct: 2,
                sc: 0x81,
                dnr: false
            }
        );
        assert!(status.is_retryable());
    }
}
