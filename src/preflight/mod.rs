//! Preflight checks for build validation.
//!
//! Validates that the host system has the tools the pipelines shell out to.
//! This turns a spawn failure deep inside a build into a clear list of
//! missing packages up front.
//!
//! # Example
//!
//! ```rust
//! use kernel_image_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("sfdisk") {
//!     println!("util-linux not installed");
//! }
//!
//! let tools = &[("make", "make"), ("bash", "bash")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{Error, Result};

/// Check if a command exists on the host system, either as a path or in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the embedded image script runs, as (command, package).
pub const IMAGE_TOOLS: &[(&str, &str)] = &[
    ("bash", "bash"),
    ("truncate", "coreutils"),
    ("sfdisk", "util-linux"),
    ("losetup", "util-linux"),
    ("mountpoint", "util-linux"),
    ("mkfs.ext4", "e2fsprogs"),
    ("ssh-keygen", "openssh-client"),
    ("grub-install", "grub-pc-bin"),
];

/// Check that specific tools are available.
///
/// Fails with the list of missing tools and the packages providing them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::Config(format!(
            "Missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}

/// Check the build tool and compiler a kernel build will invoke.
pub fn check_kernel_tools(make: &str, compiler: &str) -> Result<()> {
    check_required_tools(&[(make, "make"), (compiler, "compiler toolchain")])
}

/// Check everything the image script needs.
pub fn check_image_tools() -> Result<()> {
    check_required_tools(IMAGE_TOOLS)
}
