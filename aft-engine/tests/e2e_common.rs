//! Shared helpers for E2E-style integration tests.
//!
//! The fixtures build a full config tree (platform map, catalog,
//! topology, test plan) in a temp directory, with relay and flash
//! helpers faked by small shell scripts, so a whole validation run can
//! execute against nothing but the host shell.

use std::{io::Write, os::unix::fs::PermissionsExt, path::Path, path::PathBuf};

/// Write an executable `#!/bin/sh` script and return its absolute path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "#!/bin/sh").unwrap();
    f.write_all(body.as_bytes()).unwrap();
    drop(f);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lay out a complete config tree for one edison-like platform.
///
/// Returns the platform map path and the relay script path. The relay
/// script answers `list` with a single `cutter0 1` channel and accepts
/// every on/off command; the flash script accepts anything.
pub fn write_config_tree(dir: &Path) -> (PathBuf, PathBuf) {
    let relay = write_script(
        dir,
        "relay.sh",
        "if [ \"$1\" = list ]; then echo 'cutter0 1'; fi\nexit 0\n",
    );
    let flash = write_script(dir, "flash.sh", "exit 0\n");

    std::fs::create_dir_all(dir.join("test_plan")).unwrap();
    std::fs::write(
        dir.join("test_plan").join("smoke_test_plan.cfg"),
        "[echo-ok]\n\
         tester = shelltester\n\
         test = shell\n\
         parameters = echo OK\n\
         pass_regex = OK\n\
         user = root\n",
    )
    .unwrap();

    std::fs::write(
        dir.join("edison_catalog.cfg"),
        "[edison-mini]\n\
         device_type = edison\n\
         device_regex = usb.*edison\n\
         file_name_regex = .*edison.*\n",
    )
    .unwrap();

    std::fs::write(
        dir.join("edison_topology.cfg"),
        "[edison-1]\n\
         model = edison-mini\n\
         id = dev-1\n\
         cutter = cutter0\n\
         channel = 1\n",
    )
    .unwrap();

    let platform_cfg = dir.join("platform.cfg");
    std::fs::write(
        &platform_cfg,
        format!(
            "[edison]\n\
             regex = .*edison.*\n\
             platform = shelldevice\n\
             catalog = edison\n\
             cutter = usbrelay\n\
             test_plan = smoke\n\
             flash_command = {}\n\
             flash_timeout = 30\n",
            flash.display()
        ),
    )
    .unwrap();
    (platform_cfg, relay)
}
