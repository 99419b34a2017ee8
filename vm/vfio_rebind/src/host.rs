// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The real sysfs backend.

use crate::PciSysfs;
use pci_bdf::PciAddress;
use std::io;
use std::path::Path;
use std::path::PathBuf;

/// [`PciSysfs`] over a live `/sys` mount.
///
/// The root is configurable so the backend can be pointed at a staged
/// directory tree in tests.
pub struct HostSysfs {
    root: PathBuf,
}

impl HostSysfs {
    /// Creates a backend rooted at `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn device_dir(&self, addr: PciAddress) -> PathBuf {
        self.root
            .join("bus/pci/devices")
            .join(addr.to_string())
    }

    fn driver_path(&self, addr: PciAddress) -> PathBuf {
        self.device_dir(addr).join("driver")
    }
}

impl Default for HostSysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl PciSysfs for HostSysfs {
    fn device_exists(&self, addr: PciAddress) -> bool {
        self.device_dir(addr).is_dir()
    }

    fn current_driver(&self, addr: PciAddress) -> io::Result<Option<String>> {
        let driver = self.driver_path(addr);
        match fs_err::read_link(&driver) {
            Ok(target) => {
                // A dangling link is an unexpected sysfs state, not an
                // unbound device, and must not satisfy verification.
                if !driver.is_dir() {
                    return Err(io::Error::other(format!(
                        "{} does not resolve to a driver directory",
                        driver.display()
                    )));
                }
                Ok(Some(link_basename(&target)?))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn unbind_current(&self, addr: PciAddress) -> io::Result<()> {
        let driver = self.driver_path(addr);
        // The driver link must resolve to a directory before the unbind
        // control file can exist underneath it.
        if !driver.is_dir() {
            return Err(io::Error::other(format!(
                "{} does not resolve to a driver directory",
                driver.display()
            )));
        }
        fs_err::write(driver.join("unbind"), addr.to_string())
    }

    fn set_driver_override(&self, addr: PciAddress, driver: &str) -> io::Result<()> {
        fs_err::write(self.device_dir(addr).join("driver_override"), driver)
    }

    fn probe(&self, addr: PciAddress) -> io::Result<()> {
        fs_err::write(
            self.root.join("bus/pci/drivers_probe"),
            addr.to_string(),
        )
    }
}

fn link_basename(target: &Path) -> io::Result<String> {
    let name = target
        .file_name()
        .ok_or_else(|| io::Error::other(format!("driver link target {} has no basename", target.display())))?;
    Ok(name.to_string_lossy().into_owned())
}
