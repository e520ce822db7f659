//! In-memory driver doubles shared by the unit tests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    device::{CutterDriver, Device, DeviceDescriptor, DeviceDriver},
    runner::{CmdOutcome, CmdResult},
};

/// Catalog matching the device set the topology tests wire up.
pub const CATALOG_CFG: &str = "\
[edison-mini]
device_type = edison
device_regex = usb.*edison
file_name_regex = .*edison.*
";

/// Cutter that accepts every channel and records the states it was asked
/// to program.
#[derive(Debug, Default)]
pub struct NullCutter {
    states: Mutex<HashMap<(String, String), bool>>,
}

impl NullCutter {
    pub fn last_state(&self, cutter_id: &str, channel_id: &str) -> Option<bool> {
        self.states
            .lock()
            .unwrap()
            .get(&(cutter_id.to_owned(), channel_id.to_owned()))
            .copied()
    }
}

#[async_trait]
impl CutterDriver for NullCutter {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn channel_exists(&self, _cutter_id: &str, _channel_id: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn detect_channels(&self) -> anyhow::Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    async fn set_connected(
        &self,
        cutter_id: &str,
        channel_id: &str,
        connected: bool,
    ) -> anyhow::Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert((cutter_id.to_owned(), channel_id.to_owned()), connected);
        Ok(())
    }
}

/// Device driver where everything succeeds and detection returns a
/// preconfigured descriptor list.
#[derive(Default)]
pub struct NullDeviceDriver {
    detected: Vec<DeviceDescriptor>,
}

impl NullDeviceDriver {
    pub fn with_detected(mut self, detected: Vec<DeviceDescriptor>) -> Self {
        self.detected = detected;
        self
    }
}

#[async_trait]
impl DeviceDriver for NullDeviceDriver {
    async fn init(&self, _params: &HashMap<String, String>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn write_image(&self, _device: &Device, _image: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        _device: &Device,
        _argv: &[String],
        _timeout: Duration,
        _user: &str,
        _verbose: bool,
    ) -> anyhow::Result<CmdOutcome> {
        Ok(CmdOutcome::Completed(CmdResult {
            return_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }))
    }

    async fn detect(
        &self,
        _cutter: &Arc<dyn CutterDriver>,
    ) -> anyhow::Result<Vec<DeviceDescriptor>> {
        Ok(self.detected.clone())
    }
}
