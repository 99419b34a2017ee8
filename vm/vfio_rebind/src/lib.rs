// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rebinds PCI devices to the vfio-pci driver through sysfs.
//!
//! The kernel performs driver binding asynchronously and offers no completion
//! notification through this interface, so each mutating write is followed by
//! a settle delay and a single verification read. A device that fails
//! verification is treated as permanently failed; a device that cannot be
//! freed from its current driver must never be handed to a guest, so both
//! conditions abort the whole run.

#![forbid(unsafe_code)]

mod host;

pub use host::HostSysfs;

use pci_bdf::PciAddress;
use std::io;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// The driver every pass-through device is moved onto.
pub const TARGET_DRIVER: &str = "vfio-pci";

/// Access to the kernel's PCI device/driver binding state.
///
/// The real implementation is [`HostSysfs`]; tests substitute an in-memory
/// double so the rebind state machine can run against simulated kernel
/// behavior.
pub trait PciSysfs {
    /// Returns whether the device is present on the host.
    fn device_exists(&self, addr: PciAddress) -> bool;
    /// Returns the name of the driver currently bound to the device, or
    /// `None` if no driver is bound.
    fn current_driver(&self, addr: PciAddress) -> io::Result<Option<String>>;
    /// Asks the currently bound driver to release the device.
    fn unbind_current(&self, addr: PciAddress) -> io::Result<()>;
    /// Forces the next probe of the device to prefer `driver`.
    fn set_driver_override(&self, addr: PciAddress, driver: &str) -> io::Result<()>;
    /// Asks the kernel to run a probe/bind cycle for the device.
    fn probe(&self, addr: PciAddress) -> io::Result<()>;
}

/// A fatal rebinding failure. Any of these aborts the remaining devices.
#[derive(Debug, Error)]
pub enum RebindError {
    /// The bound driver did not release the device within the settle window.
    #[error("unable to unbind driver {driver:?} from device {addr}")]
    UnbindFailed {
        /// The device being unbound.
        addr: PciAddress,
        /// The driver that refused to let go.
        driver: String,
    },
    /// After a probe request the device was not bound to [`TARGET_DRIVER`].
    #[error("unable to reassociate device {addr} with driver \"vfio-pci\" (currently bound to {driver:?})")]
    RebindFailed {
        /// The device that failed to reassign.
        addr: PciAddress,
        /// What the device ended up bound to, if anything.
        driver: Option<String>,
    },
    /// A sysfs read or write failed outright.
    #[error("sysfs access failed for device {addr}")]
    Sysfs {
        /// The device being manipulated.
        addr: PciAddress,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// What a device is currently bound to.
enum Binding {
    Absent,
    Bound(String),
    Unbound,
}

/// Drives devices onto [`TARGET_DRIVER`], one at a time.
pub struct Rebinder<S> {
    sysfs: S,
    settle_delay: Duration,
}

impl<S: PciSysfs> Rebinder<S> {
    /// Creates a rebinder that waits `settle_delay` after each mutating
    /// write before verifying its effect.
    pub fn new(sysfs: S, settle_delay: Duration) -> Self {
        Self {
            sysfs,
            settle_delay,
        }
    }

    /// Rebinds each device in order. The first fatal failure aborts the
    /// remaining devices; there is no rollback of devices already moved.
    pub fn rebind_all(&self, addresses: &[PciAddress]) -> Result<(), RebindError> {
        for &addr in addresses {
            self.rebind_one(addr)?;
        }
        Ok(())
    }

    fn rebind_one(&self, addr: PciAddress) -> Result<(), RebindError> {
        match self.inspect(addr)? {
            Binding::Absent => {
                // Let the VM start surface the failure if the device was
                // actually required; it may be configured as optional.
                tracing::warn!(device = %addr, "no such pci device on the host, skipping");
                return Ok(());
            }
            Binding::Bound(driver) if driver == TARGET_DRIVER => {
                tracing::debug!(device = %addr, "already bound to vfio-pci");
                return Ok(());
            }
            Binding::Bound(driver) => self.unbind(addr, &driver)?,
            Binding::Unbound => {}
        }
        self.bind(addr)
    }

    fn inspect(&self, addr: PciAddress) -> Result<Binding, RebindError> {
        if !self.sysfs.device_exists(addr) {
            return Ok(Binding::Absent);
        }
        match self.current_driver(addr)? {
            Some(driver) => Ok(Binding::Bound(driver)),
            None => Ok(Binding::Unbound),
        }
    }

    fn unbind(&self, addr: PciAddress, driver: &str) -> Result<(), RebindError> {
        tracing::info!(device = %addr, driver, "unbinding current driver");
        self.sysfs
            .unbind_current(addr)
            .map_err(|source| RebindError::Sysfs { addr, source })?;
        thread::sleep(self.settle_delay);
        match self.current_driver(addr)? {
            Some(driver) => Err(RebindError::UnbindFailed { addr, driver }),
            None => Ok(()),
        }
    }

    fn bind(&self, addr: PciAddress) -> Result<(), RebindError> {
        tracing::info!(device = %addr, "binding to vfio-pci");
        self.sysfs
            .set_driver_override(addr, TARGET_DRIVER)
            .map_err(|source| RebindError::Sysfs { addr, source })?;
        self.sysfs
            .probe(addr)
            .map_err(|source| RebindError::Sysfs { addr, source })?;
        thread::sleep(self.settle_delay);
        match self.current_driver(addr)? {
            Some(driver) if driver == TARGET_DRIVER => Ok(()),
            driver => Err(RebindError::RebindFailed { addr, driver }),
        }
    }

    fn current_driver(&self, addr: PciAddress) -> Result<Option<String>, RebindError> {
        self.sysfs
            .current_driver(addr)
            .map_err(|source| RebindError::Sysfs { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SysfsWrite {
        Unbind(PciAddress),
        Override(PciAddress, String),
        Probe(PciAddress),
    }

    impl SysfsWrite {
        fn addr(&self) -> PciAddress {
            match *self {
                SysfsWrite::Unbind(addr)
                | SysfsWrite::Override(addr, _)
                | SysfsWrite::Probe(addr) => addr,
            }
        }
    }

    #[derive(Default)]
    struct FakeDevice {
        driver: Option<String>,
        driver_override: Option<String>,
        /// The driver refuses to release the device on unbind.
        stuck: bool,
        /// `None` means the probe honors `driver_override`; `Some(x)` forces
        /// the outcome to `x` (a probe that ignores the override).
        probe_binds: Option<Option<String>>,
    }

    #[derive(Default)]
    struct FakeSysfs {
        devices: RefCell<BTreeMap<PciAddress, FakeDevice>>,
        writes: RefCell<Vec<SysfsWrite>>,
    }

    impl FakeSysfs {
        fn add(&self, addr: PciAddress, device: FakeDevice) {
            self.devices.borrow_mut().insert(addr, device);
        }

        fn writes(&self) -> Vec<SysfsWrite> {
            self.writes.borrow().clone()
        }
    }

    impl PciSysfs for &FakeSysfs {
        fn device_exists(&self, addr: PciAddress) -> bool {
            self.devices.borrow().contains_key(&addr)
        }

        fn current_driver(&self, addr: PciAddress) -> io::Result<Option<String>> {
            Ok(self.devices.borrow()[&addr].driver.clone())
        }

        fn unbind_current(&self, addr: PciAddress) -> io::Result<()> {
            self.writes.borrow_mut().push(SysfsWrite::Unbind(addr));
            let mut devices = self.devices.borrow_mut();
            let device = devices.get_mut(&addr).unwrap();
            if !device.stuck {
                device.driver = None;
            }
            Ok(())
        }

        fn set_driver_override(&self, addr: PciAddress, driver: &str) -> io::Result<()> {
            self.writes
                .borrow_mut()
                .push(SysfsWrite::Override(addr, driver.to_string()));
            self.devices.borrow_mut().get_mut(&addr).unwrap().driver_override =
                Some(driver.to_string());
            Ok(())
        }

        fn probe(&self, addr: PciAddress) -> io::Result<()> {
            self.writes.borrow_mut().push(SysfsWrite::Probe(addr));
            let mut devices = self.devices.borrow_mut();
            let device = devices.get_mut(&addr).unwrap();
            device.driver = match &device.probe_binds {
                Some(forced) => forced.clone(),
                None => device.driver_override.clone(),
            };
            Ok(())
        }
    }

    fn addr(bus: u8) -> PciAddress {
        PciAddress::new(0, bus, 0, 0).unwrap()
    }

    fn rebinder(sysfs: &FakeSysfs) -> Rebinder<&FakeSysfs> {
        Rebinder::new(sysfs, Duration::ZERO)
    }

    fn bound(driver: &str) -> FakeDevice {
        FakeDevice {
            driver: Some(driver.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn already_on_target_is_a_no_op() {
        let sysfs = FakeSysfs::default();
        sysfs.add(addr(1), bound(TARGET_DRIVER));

        rebinder(&sysfs).rebind_all(&[addr(1)]).unwrap();
        assert!(sysfs.writes().is_empty());
    }

    #[test]
    fn full_rebind_sequence() {
        let sysfs = FakeSysfs::default();
        sysfs.add(addr(1), bound("foo"));

        rebinder(&sysfs).rebind_all(&[addr(1)]).unwrap();
        assert_eq!(
            sysfs.writes(),
            [
                SysfsWrite::Unbind(addr(1)),
                SysfsWrite::Override(addr(1), TARGET_DRIVER.to_string()),
                SysfsWrite::Probe(addr(1)),
            ]
        );
        assert_eq!(
            sysfs.devices.borrow()[&addr(1)].driver.as_deref(),
            Some(TARGET_DRIVER)
        );
    }

    #[test]
    fn unbound_device_skips_unbind() {
        let sysfs = FakeSysfs::default();
        sysfs.add(addr(1), FakeDevice::default());

        rebinder(&sysfs).rebind_all(&[addr(1)]).unwrap();
        assert_eq!(
            sysfs.writes(),
            [
                SysfsWrite::Override(addr(1), TARGET_DRIVER.to_string()),
                SysfsWrite::Probe(addr(1)),
            ]
        );
    }

    #[test]
    fn absent_device_is_skipped() {
        let sysfs = FakeSysfs::default();
        sysfs.add(addr(2), FakeDevice::default());

        // addr(1) does not exist; addr(2) must still be processed.
        rebinder(&sysfs).rebind_all(&[addr(1), addr(2)]).unwrap();
        assert!(sysfs.writes().iter().all(|w| w.addr() == addr(2)));
        assert_eq!(
            sysfs.devices.borrow()[&addr(2)].driver.as_deref(),
            Some(TARGET_DRIVER)
        );
    }

    #[test]
    fn stuck_driver_aborts_without_bind_attempt() {
        let sysfs = FakeSysfs::default();
        sysfs.add(
            addr(1),
            FakeDevice {
                stuck: true,
                ..bound("foo")
            },
        );

        let err = rebinder(&sysfs).rebind_all(&[addr(1)]).unwrap_err();
        assert!(
            matches!(&err, RebindError::UnbindFailed { driver, .. } if driver == "foo"),
            "{err}"
        );
        // No override/probe writes may follow a failed unbind.
        assert_eq!(sysfs.writes(), [SysfsWrite::Unbind(addr(1))]);
    }

    #[test]
    fn probe_ignoring_override_is_fatal() {
        let sysfs = FakeSysfs::default();
        sysfs.add(
            addr(1),
            FakeDevice {
                probe_binds: Some(Some("foo".to_string())),
                ..bound("foo")
            },
        );
        sysfs.add(addr(2), FakeDevice::default());

        let err = rebinder(&sysfs).rebind_all(&[addr(1), addr(2)]).unwrap_err();
        assert!(
            matches!(&err, RebindError::RebindFailed { driver: Some(d), .. } if d == "foo"),
            "{err}"
        );
        // The failure aborts the run; the second device is never touched.
        assert!(sysfs.writes().iter().all(|w| w.addr() == addr(1)));
    }

    #[test]
    fn domain_definition_to_rebind_end_to_end() {
        let addresses = match domain_xml::extract(
            r#"<domain type="kvm">
                 <devices>
                   <hostdev mode="subsystem" type="pci" managed="no">
                     <source>
                       <address domain="0x0000" bus="0x01" slot="0x00" function="0x0"/>
                     </source>
                   </hostdev>
                 </devices>
               </domain>"#,
        )
        .unwrap()
        {
            domain_xml::Extraction::Applicable(addresses) => addresses,
            other => panic!("{other:?}"),
        };

        let sysfs = FakeSysfs::default();
        sysfs.add(addresses[0], bound("foo"));
        rebinder(&sysfs).rebind_all(&addresses).unwrap();
        assert_eq!(
            sysfs.writes(),
            [
                SysfsWrite::Unbind(addr(1)),
                SysfsWrite::Override(addr(1), TARGET_DRIVER.to_string()),
                SysfsWrite::Probe(addr(1)),
            ]
        );
    }

    #[test]
    fn probe_leaving_device_unbound_is_fatal() {
        let sysfs = FakeSysfs::default();
        sysfs.add(
            addr(1),
            FakeDevice {
                probe_binds: Some(None),
                ..Default::default()
            },
        );

        let err = rebinder(&sysfs).rebind_all(&[addr(1)]).unwrap_err();
        assert!(
            matches!(err, RebindError::RebindFailed { driver: None, .. }),
            "{err}"
        );
    }
}
