//! Kernel and disk image pipelines.
//!
//! - [`kernel`] - configure, compile and clean a kernel tree
//! - [`image`] - assemble a bootable disk image around a built kernel
//! - [`target`] - supported targets and VM kinds

pub mod image;
pub mod kernel;
pub mod target;
