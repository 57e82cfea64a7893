use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use failure::ResultExt;

use crate::{ErrorKind, Result};

/// Interface to the live device-mapper. Production code drives `dmsetup`;
/// tests substitute a recording mock.
pub trait DeviceMapper {
    /// Create a dm device from a complete table line. Either the device
    /// exists and is live afterwards, or the call failed and left nothing
    /// behind.
    fn dm_create(&self, name: &str, uuid: &str, table: &str, readonly: bool) -> Result<PathBuf>;

    /// Remove a dm device created earlier.
    fn dm_remove(&self, name: &str) -> Result<()>;
}

/// Device-mapper control via the `dmsetup` utility.
pub struct DmSetup;

impl DmSetup {
    const DMSETUP: &'static str = "/usr/sbin/dmsetup";

    fn run(args: &[&str]) -> Result<()> {
        verbose!("{} {}", Self::DMSETUP, args.join(" "));
        let status = Command::new(Self::DMSETUP)
            .args(args)
            .stderr(Stdio::inherit())
            .status()
            .context(ErrorKind::Io)?;
        if !status.success() {
            fail!(ErrorKind::Io, "{} {} failed with status {}",
                  Self::DMSETUP, args.join(" "), status);
        }
        Ok(())
    }
}

impl DeviceMapper for DmSetup {
    fn dm_create(&self, name: &str, uuid: &str, table: &str, readonly: bool) -> Result<PathBuf> {
        let mut args = vec!["create", name, "--uuid", uuid];
        if readonly {
            args.push("--readonly");
        }
        args.push("--table");
        args.push(table);
        DmSetup::run(&args)?;

        let node = Path::new("/dev/mapper").join(name);
        if !node.exists() {
            // dmsetup reported success but the node never appeared; make
            // sure nothing half-created is left behind.
            if let Err(e) = self.dm_remove(name) {
                warn!("Removing incomplete device {}: {}", name, crate::format_error(&e));
            }
            fail!(ErrorKind::Io, "device node {} was not created", node.display());
        }
        Ok(node)
    }

    fn dm_remove(&self, name: &str) -> Result<()> {
        DmSetup::run(&["remove", name])
    }
}
