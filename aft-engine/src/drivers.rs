//! Reference drivers delegating to external commands.
//!
//! These cover the common case where the relay, the flashing helper and
//! the tests are all host-side command line tools; platform-specific
//! drivers with their own protocols register alongside them in the
//! plugin registry.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    sync::Mutex,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;

use crate::{
    config,
    device::{CutterDriver, Device, DeviceDescriptor, DeviceDriver},
    runner::{self, CmdOutcome, CommandRunner},
    testplan::{TestContext, TesterDriver},
};

/// Cutter driven by an external relay tool.
///
/// The tool is expected to understand `<command> list`, printing one
/// `<cutter_id> <channel_id>` pair per line, and
/// `<command> <cutter_id> <channel_id> on|off`.
#[derive(Debug)]
pub struct ShellCutter {
    runner: CommandRunner,
}

impl ShellCutter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            runner: CommandRunner::new(command),
        }
    }
}

#[async_trait]
impl CutterDriver for ShellCutter {
    async fn init(&self) -> anyhow::Result<()> {
        if !self.runner.probe().await? {
            anyhow::bail!("relay tool {:?} not found", self.runner.command());
        }
        Ok(())
    }

    async fn channel_exists(&self, cutter_id: &str, channel_id: &str) -> anyhow::Result<bool> {
        let channels = self.detect_channels().await?;
        Ok(channels
            .iter()
            .any(|(c, ch)| c == cutter_id && ch == channel_id))
    }

    async fn detect_channels(&self) -> anyhow::Result<Vec<(String, String)>> {
        let outcome = self.runner.run(["list"], None, false).await;
        let result = match outcome.completed() {
            Some(res) if res.success() => res.clone(),
            Some(res) => anyhow::bail!(
                "relay tool list failed with returncode {}",
                res.return_code
            ),
            None => anyhow::bail!("relay tool list timed out"),
        };
        Ok(result
            .stdout_lossy()
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some((parts.next()?.to_owned(), parts.next()?.to_owned()))
            })
            .collect())
    }

    async fn set_connected(
        &self,
        cutter_id: &str,
        channel_id: &str,
        connected: bool,
    ) -> anyhow::Result<()> {
        let state = if connected { "on" } else { "off" };
        let outcome = self
            .runner
            .run([cutter_id, channel_id, state], None, false)
            .await;
        match outcome.completed() {
            Some(res) if res.success() => Ok(()),
            Some(res) => anyhow::bail!(
                "relay tool failed to turn {cutter_id}:{channel_id} {state}: returncode {}",
                res.return_code
            ),
            None => anyhow::bail!("relay tool timed out turning {cutter_id}:{channel_id} {state}"),
        }
    }
}

#[derive(Debug)]
struct ShellDeviceConfig {
    flash: CommandRunner,
    shell: Option<String>,
    detect: Option<String>,
}

/// Device driver shelling out to configured helper tools.
///
/// Platform-map keys: `flash_command` (required), `flash_timeout`
/// (seconds, default 900), `shell_command` and `detect_command`
/// (optional). The flash helper is invoked as
/// `<flash_command> <device_id> <image>`; the shell helper as
/// `<shell_command> <user> <device_id> <argv…>`; the detect helper must
/// print one `<name> <model> <id> <cutter> <channel>` row per device.
#[derive(Default)]
pub struct ShellDevice {
    cfg: Mutex<Option<ShellDeviceConfig>>,
}

impl ShellDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn configured(&self) -> anyhow::Result<ShellDeviceConfig> {
        let cfg = self.cfg.lock().expect("shell device config poisoned");
        let cfg = cfg
            .as_ref()
            .context("shell device driver used before init")?;
        Ok(ShellDeviceConfig {
            flash: cfg.flash.clone(),
            shell: cfg.shell.clone(),
            detect: cfg.detect.clone(),
        })
    }
}

const DEFAULT_FLASH_TIMEOUT: Duration = Duration::from_secs(900);
const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(300);

#[async_trait]
impl DeviceDriver for ShellDevice {
    async fn init(&self, params: &HashMap<String, String>) -> anyhow::Result<()> {
        let command = params
            .get("flash_command")
            .context("missing \"flash_command\" platform key")?;
        let timeout = match params.get("flash_timeout") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("bad \"flash_timeout\" value {raw:?}"))?,
            ),
            None => DEFAULT_FLASH_TIMEOUT,
        };
        let flash = CommandRunner::new(command).with_timeout(timeout);
        if !flash.probe().await? {
            anyhow::bail!("flash tool {command:?} not found");
        }
        *self.cfg.lock().expect("shell device config poisoned") = Some(ShellDeviceConfig {
            flash,
            shell: params.get("shell_command").cloned(),
            detect: params.get("detect_command").cloned(),
        });
        Ok(())
    }

    async fn write_image(&self, device: &Device, image: &Path) -> anyhow::Result<()> {
        let cfg = self.configured()?;
        let image = image.to_string_lossy();
        let outcome = cfg
            .flash
            .run([device.device_id(), image.as_ref()], None, true)
            .await;
        match outcome.completed() {
            Some(res) if res.success() => Ok(()),
            Some(res) => anyhow::bail!(
                "flashing {} failed with returncode {}: {}",
                device.name(),
                res.return_code,
                res.stderr_lossy()
            ),
            None => anyhow::bail!("flashing {} timed out", device.name()),
        }
    }

    async fn execute(
        &self,
        device: &Device,
        argv: &[String],
        timeout: Duration,
        user: &str,
        verbose: bool,
    ) -> anyhow::Result<CmdOutcome> {
        let cfg = self.configured()?;
        let shell = cfg
            .shell
            .context("no \"shell_command\" configured for this platform")?;
        let full: Vec<String> = [shell, user.to_owned(), device.device_id().to_owned()]
            .into_iter()
            .chain(argv.iter().cloned())
            .collect();
        Ok(runner::run(full, timeout, verbose).await)
    }

    async fn detect(
        &self,
        _cutter: &Arc<dyn CutterDriver>,
    ) -> anyhow::Result<Vec<DeviceDescriptor>> {
        let cfg = self.configured()?;
        let detect = cfg
            .detect
            .context("no \"detect_command\" configured for this platform")?;
        let outcome = runner::run([detect], DEFAULT_EXECUTE_TIMEOUT, false).await;
        let result = match outcome.completed() {
            Some(res) if res.success() => res.clone(),
            Some(res) => anyhow::bail!("device detection failed: returncode {}", res.return_code),
            None => anyhow::bail!("device detection timed out"),
        };
        let mut descriptors = Vec::new();
        for line in result.stdout_lossy().lines() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, model, device_id, cutter_id, channel_id] = fields[..] else {
                anyhow::bail!("malformed detection row {line:?}");
            };
            descriptors.push(DeviceDescriptor {
                name: name.to_owned(),
                model: model.to_owned(),
                device_id: device_id.to_owned(),
                cutter_id: cutter_id.to_owned(),
                channel_id: channel_id.to_owned(),
            });
        }
        Ok(descriptors)
    }
}

/// Tester with two operations: `shell` runs the case's parameters as a
/// host-side command inside the case working directory; `remote` runs
/// them on the DUT through the device driver.
///
/// Bare `shell` command names are first looked up in the test-module
/// directory (`AFT_TEST_MODULES`), then left to the regular `PATH`
/// search.
#[derive(Debug)]
pub struct ShellTester {
    timeout: Duration,
    module_path: Option<PathBuf>,
}

impl Default for ShellTester {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellTester {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_EXECUTE_TIMEOUT,
            module_path: config::test_module_path(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    fn resolve_command(&self, command: &str) -> String {
        if command.contains('/') {
            return command.to_owned();
        }
        if let Some(root) = &self.module_path {
            let candidate = root.join(command);
            if candidate.is_file() {
                return candidate.to_string_lossy().into_owned();
            }
        }
        command.to_owned()
    }
}

#[async_trait]
impl TesterDriver for ShellTester {
    fn has_operation(&self, selector: &str) -> bool {
        matches!(selector, "shell" | "remote")
    }

    async fn run(&self, selector: &str, ctx: TestContext<'_>) -> anyhow::Result<CmdOutcome> {
        let mut argv: Vec<String> =
            ctx.parameters.split_whitespace().map(str::to_owned).collect();
        if argv.is_empty() {
            anyhow::bail!("test case {:?} has empty parameters", ctx.name);
        }
        match selector {
            "shell" => {
                argv[0] = self.resolve_command(&argv[0]);
                Ok(runner::run_in(argv, self.timeout, true, Some(ctx.test_dir)).await)
            }
            "remote" => {
                ctx.device
                    .execute(&argv, self.timeout, ctx.user, true)
                    .await
            }
            other => anyhow::bail!("unknown test operation {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `true` exists everywhere and accepts the `<id> <channel> on` argv.
    #[tokio::test]
    async fn shell_cutter_reports_relay_tool_failures() {
        let ok = ShellCutter::new("true");
        ok.set_connected("cutter0", "1", true).await.unwrap();

        let failing = ShellCutter::new("false");
        assert!(failing.set_connected("cutter0", "1", false).await.is_err());
    }

    #[tokio::test]
    async fn shell_cutter_parses_channel_listing() {
        // `echo list` prints a single word, which is not a channel pair.
        let cutter = ShellCutter::new("echo");
        assert!(cutter.detect_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shell_device_init_requires_a_flash_command() {
        let driver = ShellDevice::new();
        assert!(driver.init(&HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn shell_device_rejects_use_before_init() {
        let driver = ShellDevice::new();
        let err = driver.configured().unwrap_err();
        assert!(err.to_string().contains("before init"));
    }

    #[test]
    fn shell_tester_knows_its_operations() {
        let tester = ShellTester::new();
        assert!(tester.has_operation("shell"));
        assert!(tester.has_operation("remote"));
        assert!(!tester.has_operation("telepathy"));
    }

    fn null_device() -> Device {
        let cutter: Arc<dyn CutterDriver> = Arc::new(crate::testing::NullCutter::default());
        let descriptor = DeviceDescriptor {
            name: "edison-1".into(),
            model: "edison-mini".into(),
            device_id: "id-1".into(),
            cutter_id: "cutter0".into(),
            channel_id: "1".into(),
        };
        Device::new(
            &descriptor,
            "edison",
            crate::device::Channel::new(cutter, "cutter0", "1"),
            Arc::new(crate::testing::NullDeviceDriver::default()),
        )
    }

    #[tokio::test]
    async fn shell_tester_prefers_the_test_module_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\necho from-modules\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tester = ShellTester::new().with_module_path(dir.path());
        let device = null_device();
        let ctx = TestContext {
            name: "mod-test",
            parameters: "mytool",
            user: "root",
            device: &device,
            test_dir: dir.path(),
        };
        let outcome = tester.run("shell", ctx).await.unwrap();
        assert_eq!(outcome.completed().unwrap().stdout_lossy(), "from-modules\n");
    }

    #[test]
    fn bare_names_missing_from_the_module_dir_fall_back_to_path_search() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ShellTester::new().with_module_path(dir.path());
        assert_eq!(tester.resolve_command("echo"), "echo");
        // Qualified paths are never rewritten.
        assert_eq!(tester.resolve_command("/bin/echo"), "/bin/echo");
    }
}
