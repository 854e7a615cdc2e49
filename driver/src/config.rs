/// Module configuration.
///
/// Mirrors the recognized module options; one validated value is built at
/// load time and threaded into every controller.
use crate::debug::DebugMask;

/// Driver-wide limits.
pub const MAX_CONTROLLERS: usize = 64;
pub const MAX_IO_QUEUES: u16 = 16;
pub const MAX_IO_QUEUE_SIZE: u16 = 1024;
pub const DEFAULT_ADMIN_QUEUE_SIZE: u16 = 256;

/// Admin command timeout: 2 seconds, in microseconds.
pub const ADMIN_TIMEOUT_US: u64 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Verbose => log::LevelFilter::Debug,
            LogLevel::Debug => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModuleConfig {
    pub log_level: LogLevel,
    pub debug_mask: DebugMask,
    /// Force 4 KiB SG element alignment and size multiples for all devices.
    pub dma_4k_switch: bool,
    /// Force the legacy/MSI single-vector regime.
    pub msi_enabled: bool,
    /// Clamp the admin queue size; hardware workaround for devices whose
    /// advertised admin-queue size is unusable. 0 disables.
    pub fake_admin_q_size: u16,
    pub admin_queue_size: u16,
    /// Hybrid poll options.
    pub poll_act: bool,
    pub poll_oio_thr: u32,
    pub poll_interval_us: u64,
    pub blk_size_aware_poll_act: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            debug_mask: DebugMask::empty(),
            dma_4k_switch: false,
            msi_enabled: false,
            fake_admin_q_size: 0,
            admin_queue_size: DEFAULT_ADMIN_QUEUE_SIZE,
            poll_act: true,
            poll_oio_thr: 30,
            poll_interval_us: 50,
            blk_size_aware_poll_act: true,
        }
    }
}

impl ModuleConfig {
    /// Clamp inconsistent option combinations.
    pub fn validate(&mut self) {
        if self.admin_queue_size == 0 {
            self.admin_queue_size = DEFAULT_ADMIN_QUEUE_SIZE;
        }
        if self.fake_admin_q_size >= self.admin_queue_size {
            self.fake_admin_q_size = self.admin_queue_size - 1;
            log::warn!(
                "clamping fake admin queue size to {}",
                self.fake_admin_q_size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_fake_admin_size() {
        let mut config = ModuleConfig {
            fake_admin_q_size: 4096,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.fake_admin_q_size, config.admin_queue_size - 1);
    }

    #[test]
    fn validate_keeps_sane_options() {
        let mut config = ModuleConfig {
            fake_admin_q_size: 16,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.fake_admin_q_size, 16);
        assert_eq!(config.admin_queue_size, DEFAULT_ADMIN_QUEUE_SIZE);
    }
}
