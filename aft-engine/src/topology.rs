//! Topology of devices and cutters connected to the host, and the
//! reservation protocol layered on it.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use ini::Ini;

use crate::{
    catalog::Catalog,
    device::{Channel, CutterDriver, Device, DeviceDescriptor, DeviceDriver},
    error::{Error, Result},
    reservation::{ReservationLock, ReserveOptions},
};

struct Reserved {
    device: Device,
    // Held for its flock; dropping it releases the device.
    _lock: ReservationLock,
}

/// The recorded mapping of DUTs to their cutter/channel wiring.
pub struct Topology {
    topology_path: PathBuf,
    lock_root: PathBuf,
    catalog: Catalog,
    cutter: Arc<dyn CutterDriver>,
    device_driver: Arc<dyn DeviceDriver>,
    devices: Vec<Device>,
    reserved: Option<Reserved>,
}

impl Topology {
    /// Load the catalog and initialize the cutter driver; either failing
    /// fails the whole init.
    pub async fn init(
        topology_path: impl Into<PathBuf>,
        catalog_path: &Path,
        device_driver: Arc<dyn DeviceDriver>,
        cutter: Arc<dyn CutterDriver>,
        lock_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let catalog = Catalog::load(catalog_path)?;
        cutter.init().await?;
        Ok(Self {
            topology_path: topology_path.into(),
            lock_root: lock_root.into(),
            catalog,
            cutter,
            device_driver,
            devices: Vec::new(),
            reserved: None,
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Parse the topology file into devices. Any parse or I/O error, or
    /// a row wired to a channel the cutter driver does not know, aborts
    /// the whole load and leaves the previous device set untouched.
    pub async fn load(&mut self) -> Result<()> {
        tracing::debug!("Loading topology file {:?}", self.topology_path);
        let ini = Ini::load_from_file(&self.topology_path)
            .map_err(|e| Error::config(&self.topology_path, e.to_string()))?;

        let mut descriptors = Vec::new();
        for (section, props) in ini.iter() {
            let Some(name) = section else { continue };
            let mut field = |key: &str| -> Result<String> {
                match props.get(key) {
                    Some(v) if !v.is_empty() => Ok(v.to_owned()),
                    _ => Err(Error::config(
                        &self.topology_path,
                        format!("missing {key:?} in device {name:?}"),
                    )),
                }
            };
            descriptors.push(DeviceDescriptor {
                name: name.to_owned(),
                model: field("model")?,
                device_id: field("id")?,
                cutter_id: field("cutter")?,
                channel_id: field("channel")?,
            });
        }

        let devices = self.build_devices(descriptors, true).await?;
        tracing::debug!("Topology loaded: {devices:?}");
        self.devices = devices;
        Ok(())
    }

    async fn build_devices(
        &self,
        descriptors: Vec<DeviceDescriptor>,
        verify_channels: bool,
    ) -> Result<Vec<Device>> {
        let mut devices = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if verify_channels
                && !self
                    .cutter
                    .channel_exists(&descriptor.cutter_id, &descriptor.channel_id)
                    .await?
            {
                return Err(Error::config(
                    &self.topology_path,
                    format!(
                        "device {:?} wired to unknown channel {}:{}",
                        descriptor.name, descriptor.cutter_id, descriptor.channel_id
                    ),
                ));
            }
            let channel = Channel::new(
                self.cutter.clone(),
                descriptor.cutter_id.clone(),
                descriptor.channel_id.clone(),
            );
            // Declared type comes from the catalog entry for the row's
            // model; rows with no catalog entry never match a reserve.
            let device_type = self
                .catalog
                .entry_for_model(&descriptor.model)
                .map(|e| e.device_type.clone())
                .unwrap_or_default();
            devices.push(Device::new(
                &descriptor,
                device_type,
                channel,
                self.device_driver.clone(),
            ));
        }
        Ok(devices)
    }

    /// Physically enumerate hardware via the device and cutter drivers.
    ///
    /// Refuses to overwrite an already-populated in-memory topology
    /// unless `force` is set; returns whether detection ran.
    pub async fn detect(&mut self, force: bool) -> Result<bool> {
        if !self.devices.is_empty() && !force {
            return Ok(false);
        }
        let descriptors = self.device_driver.detect(&self.cutter).await?;
        self.devices = self.build_devices(descriptors, false).await?;
        Ok(true)
    }

    /// Force detection and persist the result.
    pub async fn generate(&mut self) -> Result<()> {
        self.detect(true).await?;
        self.save()
    }

    /// Persist the current device set. The file is written with fixed,
    /// predictable permissions (0o644): owner-writable, world-readable.
    /// Callers must not place secrets in it.
    fn save(&self) -> Result<()> {
        let mut ini = Ini::new();
        for device in &self.devices {
            ini.with_section(Some(device.name()))
                .set("model", device.model())
                .set("id", device.device_id())
                .set("cutter", device.channel().cutter_id())
                .set("channel", device.channel().channel_id());
        }
        ini.write_to_file(&self.topology_path)?;
        std::fs::set_permissions(&self.topology_path, std::fs::Permissions::from_mode(0o644))?;
        tracing::info!("Topology written to {:?}", self.topology_path);
        Ok(())
    }

    /// Resolve `(model, type)` for the candidate image via the catalog.
    pub fn identify(&self, file_name: &str) -> Option<(String, String)> {
        self.catalog.model_and_type_by_file_name(file_name)
    }

    /// Search and reserve a device compatible with the image.
    ///
    /// Scans the device list in topology order; the first matching
    /// device whose lock succeeds is reserved and returned. When every
    /// matching device is held elsewhere, sleeps `opts.retry_interval`
    /// and rescans, forever by default. When no matching device exists
    /// at all, returns [`Error::NoDevice`] without sleeping.
    pub async fn reserve(
        &mut self,
        model: &str,
        device_type: &str,
        opts: &ReserveOptions,
    ) -> Result<Device> {
        let mut attempts: u64 = 0;
        loop {
            let mut present = false;
            let mut acquired = None;
            for (idx, device) in self.devices.iter().enumerate() {
                if device.device_type() != device_type || device.model() != model {
                    continue;
                }
                present = true;
                tracing::info!("Attempting to acquire {} {}", model, device.device_id());
                if let Some(lock) =
                    ReservationLock::try_acquire(&self.lock_root, device.device_id())?
                {
                    acquired = Some((idx, lock));
                    break;
                }
            }

            if let Some((idx, lock)) = acquired {
                let device = self.devices[idx].clone();
                tracing::info!("Device acquired: {device:?}");
                self.reserved = Some(Reserved {
                    device: device.clone(),
                    _lock: lock,
                });
                return Ok(device);
            }
            if !present {
                return Err(Error::NoDevice {
                    model: model.to_owned(),
                    device_type: device_type.to_owned(),
                });
            }
            attempts += 1;
            if let Some(max) = opts.max_attempts {
                if attempts >= max {
                    return Err(Error::ReserveAttemptsExhausted(attempts));
                }
            }
            tracing::info!("All devices busy, retrying in {:?}", opts.retry_interval);
            tokio::time::sleep(opts.retry_interval).await;
        }
    }

    pub fn reserved_device(&self) -> Option<&Device> {
        self.reserved.as_ref().map(|r| &r.device)
    }

    /// Put the reserved device back to the pool. The OS would release
    /// the lock on process exit anyway; this also removes the lock file.
    /// A no-op when nothing is reserved.
    pub fn release(&mut self) {
        self.reserved = None;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::testing::{NullCutter, NullDeviceDriver, CATALOG_CFG};

    async fn topology_with(
        dir: &Path,
        topology_cfg: &str,
        driver: Arc<NullDeviceDriver>,
    ) -> Topology {
        let catalog_path = dir.join("catalog.cfg");
        std::fs::write(&catalog_path, CATALOG_CFG).unwrap();
        let topology_path = dir.join("topology.cfg");
        let mut f = std::fs::File::create(&topology_path).unwrap();
        f.write_all(topology_cfg.as_bytes()).unwrap();
        Topology::init(
            &topology_path,
            &catalog_path,
            driver,
            Arc::new(NullCutter::default()),
            dir.join("locks"),
        )
        .await
        .unwrap()
    }

    const TOPOLOGY_CFG: &str = "\
[edison-1]
model = edison-mini
id = dev-1
cutter = cutter0
channel = 1

[edison-2]
model = edison-mini
id = dev-2
cutter = cutter0
channel = 2
";

    #[tokio::test]
    async fn load_builds_devices_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();
        let names: Vec<_> = topo.devices().iter().map(|d| d.name().to_owned()).collect();
        assert_eq!(names, ["edison-1", "edison-2"]);
        assert_eq!(topo.devices()[0].device_type(), "edison");
    }

    #[tokio::test]
    async fn malformed_row_leaves_no_partial_device_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut topo = topology_with(
            dir.path(),
            "[ok]\nmodel = edison-mini\nid = dev-1\ncutter = cutter0\nchannel = 1\n\
             [broken]\nmodel = edison-mini\nid = dev-2\n",
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        assert!(topo.load().await.is_err());
        assert!(topo.devices().is_empty());
    }

    #[tokio::test]
    async fn detect_refuses_to_overwrite_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(NullDeviceDriver::default().with_detected(vec![DeviceDescriptor {
            name: "edison-9".into(),
            model: "edison-mini".into(),
            device_id: "dev-9".into(),
            cutter_id: "cutter0".into(),
            channel_id: "9".into(),
        }]));
        let mut topo = topology_with(dir.path(), TOPOLOGY_CFG, driver).await;
        topo.load().await.unwrap();
        assert!(!topo.detect(false).await.unwrap());
        assert_eq!(topo.devices().len(), 2);
        assert!(topo.detect(true).await.unwrap());
        assert_eq!(topo.devices().len(), 1);
        assert_eq!(topo.devices()[0].name(), "edison-9");
    }

    #[tokio::test]
    async fn generate_then_load_round_trips_names_models_and_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let detected = vec![
            DeviceDescriptor {
                name: "edison-a".into(),
                model: "edison-mini".into(),
                device_id: "id-a".into(),
                cutter_id: "cutter0".into(),
                channel_id: "1".into(),
            },
            DeviceDescriptor {
                name: "edison-b".into(),
                model: "edison-mini".into(),
                device_id: "id-b".into(),
                cutter_id: "cutter1".into(),
                channel_id: "4".into(),
            },
        ];
        let driver = Arc::new(NullDeviceDriver::default().with_detected(detected));
        let mut topo = topology_with(dir.path(), "", driver).await;
        topo.generate().await.unwrap();

        let mode = std::fs::metadata(dir.path().join("topology.cfg"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);

        let mut reloaded = topology_with(
            dir.path(),
            &std::fs::read_to_string(dir.path().join("topology.cfg")).unwrap(),
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.devices().len(), 2);
        let b = &reloaded.devices()[1];
        assert_eq!(b.name(), "edison-b");
        assert_eq!(b.model(), "edison-mini");
        assert_eq!(b.channel().cutter_id(), "cutter1");
        assert_eq!(b.channel().channel_id(), "4");
    }

    #[tokio::test]
    async fn identify_goes_through_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        assert!(topo.identify("core-edison.ext4").is_some());
        assert!(topo.identify("unknown.img").is_none());
    }

    #[tokio::test]
    async fn reserve_with_no_matching_device_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("locks")).unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();
        let started = std::time::Instant::now();
        let err = topo
            .reserve("minnowboard", "minnow", &ReserveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoDevice { .. }));
        // "No device" must not go through the retry sleep.
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reserve_and_release_are_idempotent_and_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("locks")).unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();
        let device = topo
            .reserve("edison-mini", "edison", &ReserveOptions::default())
            .await
            .unwrap();
        assert_eq!(device.device_id(), "dev-1");
        assert!(dir.path().join("locks").join("aft_dev-1").exists());
        topo.release();
        assert!(!dir.path().join("locks").join("aft_dev-1").exists());
        // Releasing again is a no-op.
        topo.release();
    }

    #[tokio::test]
    async fn reserve_skips_held_devices_within_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("locks")).unwrap();
        let _held = ReservationLock::try_acquire(&dir.path().join("locks"), "dev-1")
            .unwrap()
            .unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();
        let device = topo
            .reserve("edison-mini", "edison", &ReserveOptions::default())
            .await
            .unwrap();
        assert_eq!(device.device_id(), "dev-2");
    }

    #[tokio::test]
    async fn reserve_retries_until_a_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("locks")).unwrap();
        let locks = dir.path().join("locks");
        let one = ReservationLock::try_acquire(&locks, "dev-1").unwrap().unwrap();
        let _two = ReservationLock::try_acquire(&locks, "dev-2").unwrap().unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();

        // Free one device after a few polling cycles.
        let holder = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(35)).await;
            drop(one);
        });
        let opts = ReserveOptions {
            retry_interval: std::time::Duration::from_millis(10),
            max_attempts: Some(100),
        };
        let device = topo
            .reserve("edison-mini", "edison", &opts)
            .await
            .unwrap();
        assert_eq!(device.device_id(), "dev-1");
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn bounded_retry_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("locks")).unwrap();
        let locks = dir.path().join("locks");
        let _one = ReservationLock::try_acquire(&locks, "dev-1").unwrap().unwrap();
        let _two = ReservationLock::try_acquire(&locks, "dev-2").unwrap().unwrap();
        let mut topo = topology_with(
            dir.path(),
            TOPOLOGY_CFG,
            Arc::new(NullDeviceDriver::default()),
        )
        .await;
        topo.load().await.unwrap();
        let opts = ReserveOptions {
            retry_interval: std::time::Duration::from_millis(10),
            max_attempts: Some(3),
        };
        let err = topo
            .reserve("edison-mini", "edison", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReserveAttemptsExhausted(3)));
    }
}
