//! Platform map loading and the handful of environment knobs.
//!
//! All four config classes (platform map, device catalog, topology, test
//! plan) share one named-section `key=value` file format. Section order is
//! load-bearing everywhere: the first section whose pattern matches wins,
//! so parsing goes through `rust-ini`, which keeps insertion order.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use ini::Ini;

use crate::{
    error::{Error, Result},
    pattern,
};

/// Default location of the master platform map.
pub const DEFAULT_PLATFORM_CFG: &str = "/usr/share/aft/cfg/platform.cfg";

/// Directory holding the per-device advisory lock files.
///
/// Overridable through `AFT_LOCKROOT`.
pub fn lock_root() -> PathBuf {
    std::env::var_os("AFT_LOCKROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lock"))
}

/// Prefix for the per-invocation test execution root; the process id is
/// appended to it, so `./aft_results.` becomes `./aft_results.1234`.
///
/// Overridable through `AFT_EXECROOT`.
pub fn exec_root() -> String {
    std::env::var("AFT_EXECROOT").unwrap_or_else(|_| String::from("./aft_results."))
}

/// Search-path hint for external test modules, surfaced to tester
/// drivers. `AFT_TEST_MODULES` if set.
pub fn test_module_path() -> Option<PathBuf> {
    std::env::var_os("AFT_TEST_MODULES").map(PathBuf::from)
}

/// One resolved section of the platform map.
///
/// The fixed keys (`regex`, `platform`, `catalog`, `cutter`, `test_plan`)
/// are consumed here; everything else in the section passes through to
/// the device driver untouched.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Device-driver identifier, resolved via the plugin registry.
    pub platform: String,
    /// Cutter-driver identifier, resolved via the plugin registry.
    pub cutter: String,
    pub catalog_path: PathBuf,
    pub topology_path: PathBuf,
    pub test_plan_path: PathBuf,
    /// Platform-specific keys handed to the device driver's init.
    pub device_params: HashMap<String, String>,
}

impl PlatformConfig {
    /// Load the platform map and select the first section whose `regex`
    /// matches the candidate image file name.
    ///
    /// Any section missing a required key fails the whole load, as does
    /// an image no section recognises.
    pub fn select(cfg_path: &Path, image_name: &str) -> Result<Self> {
        let ini = Ini::load_from_file(cfg_path)
            .map_err(|e| Error::config(cfg_path, e.to_string()))?;

        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };
            let regex = props.get("regex").ok_or_else(|| {
                Error::config(cfg_path, format!("section {section:?} has no \"regex\" key"))
            })?;
            if !pattern::matches_start(regex, image_name)
                .map_err(|e| Error::config(cfg_path, e.to_string()))?
            {
                continue;
            }
            tracing::info!("Loading configuration for platform {section}");

            let mut required = |key: &str| -> Result<String> {
                props.get(key).map(str::to_owned).ok_or_else(|| {
                    Error::config(cfg_path, format!("section {section:?} has no {key:?} key"))
                })
            };
            let platform = required("platform")?;
            let catalog = required("catalog")?;
            let cutter = required("cutter")?;
            let test_plan = required("test_plan")?;

            let base = cfg_path.parent().unwrap_or_else(|| Path::new("."));
            let device_params = props
                .iter()
                .filter(|(k, _)| {
                    !matches!(*k, "regex" | "platform" | "catalog" | "cutter" | "test_plan")
                })
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();

            return Ok(Self {
                platform,
                cutter,
                catalog_path: base.join(format!("{catalog}_catalog.cfg")),
                topology_path: base.join(format!("{catalog}_topology.cfg")),
                test_plan_path: base.join("test_plan").join(format!("{test_plan}_test_plan.cfg")),
                device_params,
            });
        }

        Err(Error::config(
            cfg_path,
            format!("no platform compatible with image {image_name:?}"),
        ))
    }
}
