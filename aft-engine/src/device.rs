//! Devices under test, cutter channels and the driver seams.
//!
//! Concrete flash/shell commands and relay protocols live in driver
//! implementations resolved through the plugin registry; the engine only
//! sees the traits defined here.

use std::{collections::HashMap, fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::runner::CmdOutcome;

/// One persisted topology row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub model: String,
    pub device_id: String,
    pub cutter_id: String,
    pub channel_id: String,
}

/// Driver for a relay device power-cycling DUTs via addressable channels.
#[async_trait]
pub trait CutterDriver: std::fmt::Debug + Send + Sync {
    /// Probe the relay hardware or its controlling tool.
    async fn init(&self) -> anyhow::Result<()>;

    /// Verify the `(cutter, channel)` pair exists; topology loading
    /// fails on rows wired to channels the driver does not know.
    async fn channel_exists(&self, cutter_id: &str, channel_id: &str) -> anyhow::Result<bool>;

    /// Physically enumerate `(cutter_id, channel_id)` pairs.
    async fn detect_channels(&self) -> anyhow::Result<Vec<(String, String)>>;

    /// Program the state of one relay output.
    async fn set_connected(
        &self,
        cutter_id: &str,
        channel_id: &str,
        connected: bool,
    ) -> anyhow::Result<()>;
}

/// Reference to one addressable cutter output wired to exactly one DUT.
#[derive(Clone)]
pub struct Channel {
    driver: Arc<dyn CutterDriver>,
    cutter_id: String,
    channel_id: String,
}

impl Channel {
    pub fn new(
        driver: Arc<dyn CutterDriver>,
        cutter_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            cutter_id: cutter_id.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn cutter_id(&self) -> &str {
        &self.cutter_id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Close the relay, powering the DUT.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.driver
            .set_connected(&self.cutter_id, &self.channel_id, true)
            .await
    }

    /// Open the relay, cutting power to the DUT.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.driver
            .set_connected(&self.cutter_id, &self.channel_id, false)
            .await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("cutter_id", &self.cutter_id)
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// Platform-specific driver for one family of DUTs.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Initialize with the pass-through keys of the platform-map section.
    async fn init(&self, params: &HashMap<String, String>) -> anyhow::Result<()>;

    /// Flash the image onto the device.
    async fn write_image(&self, device: &Device, image: &Path) -> anyhow::Result<()>;

    /// Run a command on the DUT, returning log and errorlevel.
    async fn execute(
        &self,
        device: &Device,
        argv: &[String],
        timeout: Duration,
        user: &str,
        verbose: bool,
    ) -> anyhow::Result<CmdOutcome>;

    /// Physically enumerate attached DUTs and their cutter wiring.
    async fn detect(&self, cutter: &Arc<dyn CutterDriver>)
        -> anyhow::Result<Vec<DeviceDescriptor>>;
}

/// A DUT: a catalog-resolved model/type plus its cutter channel and the
/// platform driver that knows how to flash and talk to it.
///
/// Identity is the `device_id`; equality considers nothing else.
#[derive(Clone)]
pub struct Device {
    name: String,
    model: String,
    device_id: String,
    device_type: String,
    channel: Channel,
    driver: Arc<dyn DeviceDriver>,
}

impl Device {
    pub fn new(
        descriptor: &DeviceDescriptor,
        device_type: impl Into<String>,
        channel: Channel,
        driver: Arc<dyn DeviceDriver>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            model: descriptor.model.clone(),
            device_id: descriptor.device_id.clone(),
            device_type: device_type.into(),
            channel,
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn write_image(&self, image: &Path) -> anyhow::Result<()> {
        self.driver.write_image(self, image).await
    }

    pub async fn execute(
        &self,
        argv: &[String],
        timeout: Duration,
        user: &str,
        verbose: bool,
    ) -> anyhow::Result<CmdOutcome> {
        self.driver.execute(self, argv, timeout, user, verbose).await
    }

    /// Close the associated cutter channel.
    pub async fn attach(&self) -> anyhow::Result<()> {
        self.channel.connect().await
    }

    /// Open the associated cutter channel.
    pub async fn detach(&self) -> anyhow::Result<()> {
        self.channel.disconnect().await
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device(name={}, model={}, device_id={}, channel={:?})",
            self.name, self.model, self.device_id, self.channel
        )
    }
}
