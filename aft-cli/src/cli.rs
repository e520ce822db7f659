use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Opt {
    /// OS image to flash onto a device under test and validate.
    ///
    /// Optional on purpose: a missing image maps to its own exit code
    /// instead of a generic usage error.
    pub image: Option<PathBuf>,

    #[arg(long)]
    /// Only check whether the image maps to a known device model.
    pub testable: bool,

    #[arg(long, default_value = aft_engine::config::DEFAULT_PLATFORM_CFG)]
    /// Platform map selecting drivers and config files per image.
    pub cfg: PathBuf,
}
