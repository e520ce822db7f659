//! The staged validation pipeline driving one invocation.
//!
//! Every stage is gated on a single monotonic success latch: the first
//! failure flips it and every later stage becomes a no-op, so nothing
//! raises out of the pipeline and cleanup always runs.

use std::{path::PathBuf, sync::Arc};

use crate::{
    config::PlatformConfig,
    device::{CutterDriver, DeviceDriver},
    registry::PluginRegistry,
    reservation::ReserveOptions,
    testplan::TestPlan,
    topology::Topology,
};

/// The success flag threaded through the stages. Goes false once,
/// never back.
#[derive(Debug)]
pub struct SuccessLatch(bool);

impl SuccessLatch {
    pub fn new() -> Self {
        Self(true)
    }

    pub fn ok(&self) -> bool {
        self.0
    }

    pub fn fail(&mut self) {
        self.0 = false;
    }
}

impl Default for SuccessLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Final determination of one invocation, mapped to a process exit code
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Configuration files could not be loaded or resolved.
    ConfigFailure,
    /// `testable_only` was requested and the image is not supported.
    Unsupported,
    /// Reservation, flashing or testing failed.
    ValidationFailure,
}

/// Per-invocation pipeline context; no state outlives it.
pub struct Pipeline<'r> {
    registry: &'r PluginRegistry,
    image: PathBuf,
    cfg_path: PathBuf,
    lock_root: PathBuf,
    reserve_opts: ReserveOptions,

    latch: SuccessLatch,
    platform: Option<PlatformConfig>,
    device_driver: Option<Arc<dyn DeviceDriver>>,
    cutter: Option<Arc<dyn CutterDriver>>,
    topology: Option<Topology>,
    test_plan: Option<TestPlan>,
    identified: Option<(String, String)>,
}

impl<'r> Pipeline<'r> {
    pub fn new(registry: &'r PluginRegistry, image: impl Into<PathBuf>, cfg_path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            image: image.into(),
            cfg_path: cfg_path.into(),
            lock_root: crate::config::lock_root(),
            reserve_opts: ReserveOptions::default(),
            latch: SuccessLatch::new(),
            platform: None,
            device_driver: None,
            cutter: None,
            topology: None,
            test_plan: None,
            identified: None,
        }
    }

    pub fn with_lock_root(mut self, lock_root: impl Into<PathBuf>) -> Self {
        self.lock_root = lock_root.into();
        self
    }

    pub fn with_reserve_options(mut self, opts: ReserveOptions) -> Self {
        self.reserve_opts = opts;
        self
    }

    pub fn succeeded(&self) -> bool {
        self.latch.ok()
    }

    fn image_name(&self) -> String {
        self.image.to_string_lossy().into_owned()
    }

    /// Select the platform-map section matching the image and resolve
    /// the named drivers through the registry.
    fn load_config(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::debug!("Success already compromised: not loading config");
            return false;
        }
        let platform = match PlatformConfig::select(&self.cfg_path, &self.image_name()) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to load config file: {e}");
                self.latch.fail();
                return false;
            }
        };
        let resolved = self
            .registry
            .resolve_device(&platform.platform)
            .and_then(|d| Ok((d, self.registry.resolve_cutter(&platform.cutter)?)));
        match resolved {
            Ok((device_driver, cutter)) => {
                self.device_driver = Some(device_driver);
                self.cutter = Some(cutter);
                self.platform = Some(platform);
                tracing::info!("Configuration loaded");
                true
            }
            Err(e) => {
                tracing::error!("{e}");
                self.latch.fail();
                false
            }
        }
    }

    /// Build the test plan, init the device driver and the topology.
    async fn init(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::debug!("Success already compromised: not initializing");
            return false;
        }
        // load_config ran: these are set.
        let Some(platform) = self.platform.clone() else {
            self.latch.fail();
            return false;
        };
        let (Some(device_driver), Some(cutter)) = (self.device_driver.clone(), self.cutter.clone())
        else {
            self.latch.fail();
            return false;
        };

        tracing::debug!("Loading test plan");
        match TestPlan::load(&platform.test_plan_path, self.registry) {
            Ok(plan) => self.test_plan = Some(plan),
            Err(e) => {
                tracing::error!("Failed to load test plan file: {e}");
                self.latch.fail();
                return false;
            }
        }

        tracing::debug!("Initializing device class");
        if let Err(e) = device_driver.init(&platform.device_params).await {
            tracing::error!("Failed to initialize device driver: {e}");
            self.latch.fail();
            return false;
        }

        tracing::debug!("Initializing topology");
        match Topology::init(
            &platform.topology_path,
            &platform.catalog_path,
            device_driver,
            cutter,
            &self.lock_root,
        )
        .await
        {
            Ok(topology) => {
                self.topology = Some(topology);
                true
            }
            Err(e) => {
                tracing::error!("Failed to initialize topology: {e}");
                self.latch.fail();
                false
            }
        }
    }

    /// `load_config` + `init`, the combined configuration stage.
    pub async fn load_configuration_files(&mut self) -> bool {
        self.load_config() && self.init().await
    }

    /// Load the topology and check the image resolves to a model/type.
    pub async fn image_is_supported(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::debug!("Success already compromised: not testing for image supported");
            return false;
        }
        let image_name = self.image_name();
        let Some(topology) = self.topology.as_mut() else {
            self.latch.fail();
            return false;
        };
        if let Err(e) = topology.load().await {
            tracing::error!("Failed to load topology: {e}");
            self.latch.fail();
            return false;
        }
        match topology.identify(&image_name) {
            Some(identified) => {
                self.identified = Some(identified);
                true
            }
            None => {
                tracing::error!("Failed to identify model and type");
                self.latch.fail();
                false
            }
        }
    }

    async fn reserve(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::debug!("Success already compromised: not reserving a device");
            return false;
        }
        let (Some(topology), Some((model, device_type))) =
            (self.topology.as_mut(), self.identified.clone())
        else {
            self.latch.fail();
            return false;
        };
        match topology.reserve(&model, &device_type, &self.reserve_opts).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to reserve a device: {e}");
                self.latch.fail();
                false
            }
        }
    }

    async fn write_image(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::error!("Success already compromised: not attempting to write image");
            return false;
        }
        tracing::info!("Writing image to the test device");
        let device = self.topology.as_ref().and_then(Topology::reserved_device);
        let Some(device) = device else {
            tracing::error!("No device was reserved: aborting image write");
            self.latch.fail();
            return false;
        };
        if let Err(e) = device.write_image(&self.image).await {
            tracing::error!("Failed to write image: {e}");
            self.latch.fail();
            return false;
        }
        true
    }

    async fn test(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::error!("Success already compromised: not attempting to test image");
            return false;
        }
        tracing::info!("Testing the image written on the device");
        let device = self
            .topology
            .as_ref()
            .and_then(Topology::reserved_device)
            .cloned();
        let Some(device) = device else {
            tracing::error!("No device was reserved: aborting image test");
            self.latch.fail();
            return false;
        };
        let Some(plan) = self.test_plan.as_mut() else {
            self.latch.fail();
            return false;
        };
        match plan.execute(&device).await {
            Ok(report) if report.all_passed() => true,
            Ok(report) => {
                tracing::error!(
                    "Failed to test image: {} of {} test cases failed",
                    report.failures,
                    report.tests
                );
                self.latch.fail();
                false
            }
            Err(e) => {
                tracing::error!("Failed to test image: {e}");
                self.latch.fail();
                false
            }
        }
    }

    /// Reserve a compatible device, write the image to it and test it.
    pub async fn validate(&mut self) -> bool {
        if !self.latch.ok() {
            tracing::error!("Success already compromised: not attempting to validate image");
            return false;
        }
        tracing::info!("Validating the image");
        self.reserve().await && self.write_image().await && self.test().await
    }

    /// The whole invocation: configuration, supportability and, unless
    /// `testable_only`, the full validate chain. A reserved device is
    /// always detached before returning, whatever the outcome.
    pub async fn run(&mut self, testable_only: bool) -> RunOutcome {
        if !self.load_configuration_files().await {
            return RunOutcome::ConfigFailure;
        }
        let supported = self.image_is_supported().await;
        if testable_only {
            tracing::debug!("Only testability required, execution terminated");
            return if supported {
                RunOutcome::Success
            } else {
                RunOutcome::Unsupported
            };
        }

        let validated = self.validate().await;
        if validated {
            tracing::info!("Validation successful");
        } else {
            tracing::error!("Validation failed");
        }

        if let Some(topology) = self.topology.as_mut() {
            if let Some(device) = topology.reserved_device().cloned() {
                if let Err(e) = device.detach().await {
                    tracing::warn!("Failed to detach {}: {e}", device.name());
                }
            }
            topology.release();
        }

        if validated {
            RunOutcome::Success
        } else {
            RunOutcome::ValidationFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_is_monotonic() {
        let mut latch = SuccessLatch::new();
        assert!(latch.ok());
        latch.fail();
        assert!(!latch.ok());
        // There is no way back up; failing again changes nothing.
        latch.fail();
        assert!(!latch.ok());
    }

    #[tokio::test]
    async fn failed_stage_short_circuits_the_rest() {
        let registry = PluginRegistry::new();
        let mut pipeline = Pipeline::new(&registry, "img.bin", "/nonexistent/platform.cfg");
        assert!(!pipeline.load_configuration_files().await);
        assert!(!pipeline.succeeded());
        // Every later stage is a no-op returning failure.
        assert!(!pipeline.image_is_supported().await);
        assert!(!pipeline.validate().await);
        assert!(!pipeline.succeeded());
    }

    #[tokio::test]
    async fn run_maps_config_failure() {
        let registry = PluginRegistry::new();
        let mut pipeline = Pipeline::new(&registry, "img.bin", "/nonexistent/platform.cfg");
        assert_eq!(pipeline.run(false).await, RunOutcome::ConfigFailure);
    }
}
