//! Kernel build orchestration, build failure diagnosis and disk image
//! assembly for fuzzing and testing VMs.
//!
//! - **Kernel builds** - configure, compile and clean a Linux source tree
//! - **Failure diagnosis** - pick the root-cause line out of build output
//! - **Image assembly** - turn a userspace tree and a kernel into a bootable disk
//! - **Process runner** - deadline-bound child processes with optional
//!   privilege, filesystem and network restrictions
//! - **Preflight checks** - host tool validation before builds
//!
//! # Architecture
//!
//! ```text
//! kernel-image-builder (this crate)
//!     │
//!     ├── build::kernel ──┐
//!     │                   ├── process (sandboxed, deadline-bound)
//!     ├── build::image ───┘
//!     │       │
//!     │       └── scripts/create-image.sh (embedded)
//!     │
//!     └── diagnose (applied to failed kernel builds)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use kernel_image_builder::{BuilderConfig, KernelBuilder};
//! use std::path::Path;
//!
//! let builder = KernelBuilder::new(BuilderConfig::default());
//! if let Err(e) = builder.build(Path::new("/src/linux"), "gcc", b"CONFIG_KASAN=y\n") {
//!     eprintln!("{}", e);
//! }
//! ```

pub mod build;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod preflight;
pub mod process;

pub use build::image::{ImageBuilder, ImageRequest};
pub use build::kernel::KernelBuilder;
pub use config::BuilderConfig;
pub use diagnose::{extract_root_cause, BuildFailure, Diagnosis};
pub use error::{Error, Result};
