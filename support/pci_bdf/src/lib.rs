// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI address handling in BDF (`domain:bus:slot.function`) notation.
//!
//! The canonical textual form is the fixed-width lowercase hex rendering the
//! kernel uses for sysfs directory names, e.g. `0000:01:00.0`. Two addresses
//! are equal exactly when their canonical forms are equal.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An invalid PCI address or address component.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// A component was numeric but outside its valid range.
    #[error("pci address {component} {value:#x} out of range (max {max:#x})")]
    OutOfRange {
        /// Which component was out of range.
        component: &'static str,
        /// The value as parsed.
        value: u64,
        /// The largest permitted value.
        max: u64,
    },
    /// A component (or a whole address) could not be parsed at all.
    #[error("invalid pci address {component} {value:?}")]
    Invalid {
        /// Which component failed to parse.
        component: &'static str,
        /// The offending input text.
        value: String,
    },
}

/// The address of a single PCI function.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    domain: u16,
    bus: u8,
    slot: u8,
    function: u8,
}

impl PciAddress {
    /// Largest valid slot (device) number.
    pub const MAX_SLOT: u8 = 0x1f;
    /// Largest valid function number.
    pub const MAX_FUNCTION: u8 = 7;

    /// Creates an address, validating that `slot` and `function` are within
    /// their 5-bit and 3-bit ranges.
    pub fn new(domain: u16, bus: u8, slot: u8, function: u8) -> Result<Self, AddressError> {
        Self::from_components(domain as u64, bus as u64, slot as u64, function as u64)
    }

    /// Creates an address from the textual attribute values of a device
    /// description.
    ///
    /// Each component may be decimal, `0x`-prefixed hex, or `0`-prefixed
    /// octal, matching how the libvirt schema permits its address attributes
    /// to be written.
    pub fn from_text_components(
        domain: &str,
        bus: &str,
        slot: &str,
        function: &str,
    ) -> Result<Self, AddressError> {
        Self::from_components(
            parse_component("domain", domain)?,
            parse_component("bus", bus)?,
            parse_component("slot", slot)?,
            parse_component("function", function)?,
        )
    }

    fn from_components(
        domain: u64,
        bus: u64,
        slot: u64,
        function: u64,
    ) -> Result<Self, AddressError> {
        fn check(component: &'static str, value: u64, max: u64) -> Result<u64, AddressError> {
            if value > max {
                Err(AddressError::OutOfRange {
                    component,
                    value,
                    max,
                })
            } else {
                Ok(value)
            }
        }
        Ok(Self {
            domain: check("domain", domain, 0xffff)? as u16,
            bus: check("bus", bus, 0xff)? as u8,
            slot: check("slot", slot, Self::MAX_SLOT as u64)? as u8,
            function: check("function", function, Self::MAX_FUNCTION as u64)? as u8,
        })
    }

    /// The PCI domain (segment) number.
    pub fn domain(&self) -> u16 {
        self.domain
    }

    /// The bus number.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// The slot (device) number.
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// The function number.
    pub fn function(&self) -> u8 {
        self.function
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = AddressError;

    /// Parses the canonical form only: fixed-width lowercase-or-uppercase hex
    /// with `:`/`:`/`.` separators, as found under `/sys/bus/pci/devices`.
    fn from_str(s: &str) -> Result<Self, AddressError> {
        let invalid = || AddressError::Invalid {
            component: "address",
            value: s.to_string(),
        };
        let (domain, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;
        if domain.len() != 4 || bus.len() != 2 || slot.len() != 2 || function.len() != 1 {
            return Err(invalid());
        }
        Self::from_components(
            u64::from_str_radix(domain, 16).map_err(|_| invalid())?,
            u64::from_str_radix(bus, 16).map_err(|_| invalid())?,
            u64::from_str_radix(slot, 16).map_err(|_| invalid())?,
            u64::from_str_radix(function, 16).map_err(|_| invalid())?,
        )
    }
}

fn parse_component(component: &'static str, text: &str) -> Result<u64, AddressError> {
    let text = text.trim();
    let invalid = || AddressError::Invalid {
        component,
        value: text.to_string(),
    };
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        // Leading zero means octal, as in Ruby's and C's integer literals.
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_formatting() {
        let addr = PciAddress::new(0, 0, 0x1f, 7).unwrap();
        assert_eq!(addr.to_string(), "0000:00:1f.7");
        let addr = PciAddress::new(0x10, 0x3, 0x4, 0).unwrap();
        assert_eq!(addr.to_string(), "0010:03:04.0");
    }

    #[test]
    fn boundary_values() {
        PciAddress::new(0xffff, 0xff, PciAddress::MAX_SLOT, PciAddress::MAX_FUNCTION).unwrap();
        assert!(matches!(
            PciAddress::from_text_components("0", "0", "0x20", "0"),
            Err(AddressError::OutOfRange {
                component: "slot",
                value: 0x20,
                ..
            })
        ));
        assert!(matches!(
            PciAddress::from_text_components("0", "0", "0", "8"),
            Err(AddressError::OutOfRange {
                component: "function",
                ..
            })
        ));
    }

    #[test]
    fn attribute_text_radixes() {
        let addr = PciAddress::from_text_components("0x0000", "0x01", "0x00", "0x0").unwrap();
        assert_eq!(addr.to_string(), "0000:01:00.0");
        // Decimal and octal both occur in hand-written domain XML.
        let addr = PciAddress::from_text_components("0", "11", "010", "7").unwrap();
        assert_eq!(addr.to_string(), "0000:0b:08.7");
    }

    #[test]
    fn malformed_attribute_text() {
        for text in ["", "0x", "zz", "-1", "0x1g"] {
            assert!(matches!(
                PciAddress::from_text_components("0", text, "0", "0"),
                Err(AddressError::Invalid {
                    component: "bus",
                    ..
                })
            ));
        }
    }

    #[test]
    fn canonical_round_trip() {
        let addr: PciAddress = "0000:65:1f.3".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 0x65, 0x1f, 3).unwrap());
        assert_eq!(addr.to_string(), "0000:65:1f.3");
        assert!("0000:65:1f".parse::<PciAddress>().is_err());
        assert!("00:65:1f.3".parse::<PciAddress>().is_err());
        assert!("0000:65:20.0".parse::<PciAddress>().is_err());
    }
}
