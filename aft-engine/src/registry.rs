//! Typed plugin registry.
//!
//! Driver implementations register under a bare identifier at startup;
//! the pipeline and the test-plan builder resolve identifiers found in
//! config files through here and get an explicit error for unknown
//! names instead of a silent miss.

use std::{collections::HashMap, sync::Arc};

use crate::{
    device::{CutterDriver, DeviceDriver},
    error::{Error, Result},
    testplan::TesterDriver,
};

#[derive(Default)]
pub struct PluginRegistry {
    devices: HashMap<String, Arc<dyn DeviceDriver>>,
    cutters: HashMap<String, Arc<dyn CutterDriver>>,
    testers: HashMap<String, Arc<dyn TesterDriver>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, name: impl Into<String>, driver: Arc<dyn DeviceDriver>) {
        self.devices.insert(name.into(), driver);
    }

    pub fn register_cutter(&mut self, name: impl Into<String>, driver: Arc<dyn CutterDriver>) {
        self.cutters.insert(name.into(), driver);
    }

    pub fn register_tester(&mut self, name: impl Into<String>, driver: Arc<dyn TesterDriver>) {
        self.testers.insert(name.into(), driver);
    }

    pub fn resolve_device(&self, name: &str) -> Result<Arc<dyn DeviceDriver>> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginResolution(name.to_owned()))
    }

    pub fn resolve_cutter(&self, name: &str) -> Result<Arc<dyn CutterDriver>> {
        self.cutters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginResolution(name.to_owned()))
    }

    pub fn resolve_tester(&self, name: &str) -> Result<Arc<dyn TesterDriver>> {
        self.testers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PluginResolution(name.to_owned()))
    }
}
