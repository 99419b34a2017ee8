// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! libvirt QEMU hook that prepares pass-through PCI devices before a VM
//! starts.
//!
//! Reads the domain XML from stdin, and rebinds every declared pass-through
//! PCI device to vfio-pci so QEMU can hand it to the guest. Installed as (or
//! invoked from) `/etc/libvirt/hooks/qemu`; libvirt aborts the VM start if
//! this process exits nonzero, which is exactly what a device that cannot be
//! freed from its driver requires.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use domain_xml::ExtractError;
use domain_xml::Extraction;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use vfio_rebind::HostSysfs;
use vfio_rebind::RebindError;
use vfio_rebind::Rebinder;

/// Exit code for an untrustworthy domain definition (bad PCI address, bad
/// XML).
const EXIT_BAD_DOMAIN: u8 = 2;
/// Exit code for a device that failed to move onto vfio-pci.
const EXIT_REBIND_FAILED: u8 = 3;

#[derive(Parser)]
#[command(
    name = "prepare_passthrough",
    about = "Rebind a libvirt domain's pass-through PCI devices to vfio-pci"
)]
struct Options {
    /// Milliseconds to wait after a sysfs write before verifying its effect.
    #[arg(long, default_value_t = 100)]
    settle_delay_ms: u64,
    /// Root of the sysfs mount to operate on.
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,
    /// The positional arguments libvirt passes to hooks (guest name,
    /// operation, sub-operation, extra). Accepted but unused; the domain XML
    /// on stdin drives everything.
    hook_args: Vec<String>,
}

fn main() -> ExitCode {
    let options = Options::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("device preparation failed: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(options: &Options) -> anyhow::Result<()> {
    if !options.hook_args.is_empty() {
        tracing::debug!(args = ?options.hook_args, "hook invocation arguments");
    }

    let mut xml = String::new();
    std::io::stdin()
        .read_to_string(&mut xml)
        .context("failed to read domain definition from stdin")?;

    let addresses = match domain_xml::extract(&xml)? {
        Extraction::NotApplicable { reason } => {
            tracing::warn!(%reason, "hook does not apply to this domain");
            return Ok(());
        }
        Extraction::Applicable(addresses) => addresses,
    };
    if addresses.is_empty() {
        tracing::info!("domain declares no pass-through pci devices");
        return Ok(());
    }

    tracing::info!(count = addresses.len(), "preparing pci devices for pass-through");
    let rebinder = Rebinder::new(
        HostSysfs::new(&options.sysfs_root),
        Duration::from_millis(options.settle_delay_ms),
    );
    rebinder.rebind_all(&addresses)?;
    Ok(())
}

/// Maps the failure class to a distinguishable exit status; libvirt only
/// cares that it is nonzero, operators care which stage broke.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ExtractError>().is_some() {
        EXIT_BAD_DOMAIN
    } else if err.downcast_ref::<RebindError>().is_some() {
        EXIT_REBIND_FAILED
    } else {
        1
    }
}
