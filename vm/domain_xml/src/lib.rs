// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Extracts pass-through PCI device addresses from a libvirt domain
//! definition.
//!
//! Only a small slice of the domain XML is consumed: the root element's name
//! and `type` attribute (the applicability gate), and every
//! `/domain/devices/hostdev[@type="pci"]/source/address` element. PCI
//! hostdevs are always addressed this way; hostdevs of other types (usb,
//! scsi, mdev, ...) identify their source differently and are ignored.

#![forbid(unsafe_code)]

use pci_bdf::AddressError;
use pci_bdf::PciAddress;
use quick_xml::Reader;
use quick_xml::events::BytesStart;
use quick_xml::events::Event;
use thiserror::Error;

/// The outcome of scanning a domain definition.
#[derive(Debug)]
pub enum Extraction {
    /// The document describes a KVM domain; these are its pass-through PCI
    /// addresses, in document order.
    Applicable(Vec<PciAddress>),
    /// The document is not something this hook applies to. Not an error;
    /// the hook is invoked for domain types it should leave alone.
    NotApplicable {
        /// Human-readable explanation for the warning log.
        reason: String,
    },
}

/// A fatal extraction failure.
///
/// A malformed address means the domain definition itself cannot be trusted,
/// so these abort the invocation rather than skip the device.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// A declared PCI address component was out of range or non-numeric.
    #[error("malformed pci address in domain definition")]
    MalformedAddress(#[from] AddressError),
    /// A source address element lacked one of its four components.
    #[error("pci source address is missing its {0:?} attribute")]
    MissingAttribute(&'static str),
    /// The document is not well-formed XML.
    #[error("malformed domain definition")]
    Xml(#[from] quick_xml::Error),
    /// The document ended with elements still open. The reader reports EOF
    /// rather than an error here, so this is caught separately; a cut-off
    /// document must not pass for a valid domain with fewer devices.
    #[error("domain definition is truncated")]
    Truncated,
    /// An element carried a malformed attribute list.
    #[error("malformed attribute in domain definition")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    /// An attribute value failed to unescape.
    #[error("unreadable attribute value: {0}")]
    AttrValue(String),
}

struct Frame {
    name: Vec<u8>,
    pci_hostdev: bool,
}

/// Scans a domain definition for pass-through PCI device addresses.
pub fn extract(xml: &str) -> Result<Extraction, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<Frame> = Vec::new();
    let mut addresses = Vec::new();
    let mut seen_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if path.is_empty() {
                    seen_root = true;
                    if let Some(miss) = root_gate(&e)? {
                        return Ok(miss);
                    }
                } else if at_pci_source(&path) && e.name().as_ref() == b"address" {
                    addresses.push(parse_address(&e)?);
                }
                path.push(frame(&e)?);
            }
            Event::Empty(e) => {
                if path.is_empty() {
                    // A self-closing root. The gate still applies; a KVM
                    // domain with no content simply has no devices.
                    seen_root = true;
                    if let Some(miss) = root_gate(&e)? {
                        return Ok(miss);
                    }
                    break;
                }
                if at_pci_source(&path) && e.name().as_ref() == b"address" {
                    addresses.push(parse_address(&e)?);
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => {
                if !path.is_empty() {
                    return Err(ExtractError::Truncated);
                }
                break;
            }
            _ => {}
        }
    }

    if !seen_root {
        return Ok(Extraction::NotApplicable {
            reason: "document has no root element".to_string(),
        });
    }
    Ok(Extraction::Applicable(addresses))
}

fn frame(e: &BytesStart<'_>) -> Result<Frame, ExtractError> {
    let name = e.name().as_ref().to_vec();
    let pci_hostdev =
        name == b"hostdev".as_slice() && attr_text(e, "type")?.as_deref() == Some("pci");
    Ok(Frame { name, pci_hostdev })
}

/// Checks the applicability gate on the root element: it must be `<domain>`
/// with `type="kvm"`.
fn root_gate(e: &BytesStart<'_>) -> Result<Option<Extraction>, ExtractError> {
    let name = e.name();
    let name = name.as_ref();
    if name != b"domain" {
        return Ok(Some(Extraction::NotApplicable {
            reason: format!(
                "expected root element {:?} to be \"domain\"",
                String::from_utf8_lossy(name)
            ),
        }));
    }
    let reason = match attr_text(e, "type")? {
        Some(ty) if ty == "kvm" => return Ok(None),
        Some(ty) => format!("expected domain type {ty:?} to be \"kvm\""),
        None => "domain has no type attribute".to_string(),
    };
    Ok(Some(Extraction::NotApplicable { reason }))
}

fn at_pci_source(path: &[Frame]) -> bool {
    match path {
        [domain, devices, hostdev, source] => {
            domain.name == b"domain".as_slice()
                && devices.name == b"devices".as_slice()
                && hostdev.name == b"hostdev".as_slice()
                && hostdev.pci_hostdev
                && source.name == b"source".as_slice()
        }
        _ => false,
    }
}

fn parse_address(e: &BytesStart<'_>) -> Result<PciAddress, ExtractError> {
    let domain = require_attr(e, "domain")?;
    let bus = require_attr(e, "bus")?;
    let slot = require_attr(e, "slot")?;
    let function = require_attr(e, "function")?;
    Ok(PciAddress::from_text_components(
        &domain, &bus, &slot, &function,
    )?)
}

fn require_attr(e: &BytesStart<'_>, key: &'static str) -> Result<String, ExtractError> {
    attr_text(e, key)?.ok_or(ExtractError::MissingAttribute(key))
}

fn attr_text(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, ExtractError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| ExtractError::AttrValue(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}
