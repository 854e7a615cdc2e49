/// Driver-wide resources.
///
/// One `DriverResource` is constructed at module load and threaded into
/// every attach; there are no global singletons. Initialization order is
/// logging first, then the controller list; teardown runs in reverse and
/// requires every controller to be detached.
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::cmd::NvmeStatus;
use crate::config::{ModuleConfig, MAX_CONTROLLERS};
use crate::ctrlr::{AttachParams, Controller};

pub struct DriverResource {
    config: ModuleConfig,
    controllers: Mutex<Vec<Arc<Controller>>>,
}

impl DriverResource {
    /// Validate options, set the log severity floor, and bring up the
    /// controller list.
    pub fn new(mut config: ModuleConfig) -> Self {
        config.validate();
        log::set_max_level(config.log_level.to_level_filter());
        log::info!("nvme-pcie driver loaded");
        Self {
            config,
            controllers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Attach a controller and link it into the module-wide list.
    pub fn attach(&self, mut params: AttachParams) -> Result<Arc<Controller>, NvmeStatus> {
        {
            let controllers = self.controllers.lock();
            if controllers.len() >= MAX_CONTROLLERS {
                log::error!("controller limit reached");
                return Err(NvmeStatus::OutOfMemory);
            }
        }
        params.config = self.config;
        let ctrlr = Controller::attach(params)?;
        self.controllers.lock().push(ctrlr.clone());
        Ok(ctrlr)
    }

    /// Detach a controller and unlink it.
    pub fn detach(&self, ctrlr: &Arc<Controller>) {
        ctrlr.detach();
        self.controllers
            .lock()
            .retain(|c| !Arc::ptr_eq(c, ctrlr));
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Host timer tick fan-out: every attached controller gets its timeout
    /// scan.
    pub fn timeout_tick(&self) {
        let controllers: Vec<Arc<Controller>> = self.controllers.lock().clone();
        for ctrlr in controllers {
            ctrlr.timeout_tick();
        }
    }

    /// Module unload. All controllers must already be detached.
    pub fn shutdown(self) {
        let remaining = self.controllers.lock().len();
        if remaining != 0 {
            log::error!("unloading with {} controllers still attached", remaining);
            debug_assert_eq!(remaining, 0, "unload with live controllers");
        }
        log::info!("nvme-pcie driver unloaded");
    }
}
