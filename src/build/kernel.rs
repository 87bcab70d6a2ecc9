//! Kernel building.
//!
//! Drives the kernel's own build system: write `.config`, let `make`
//! fill in defaults for options the config does not mention, then build
//! `bzImage`. Modules are not built.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kernel_image_builder::build::kernel;
//!
//! let kconfig = std::fs::read("kasan.config")?;
//! kernel::build(Path::new("/src/linux"), "gcc", &kconfig)?;
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::config::BuilderConfig;
use crate::diagnose::BuildFailure;
use crate::error::{Error, Result};
use crate::process::sandbox::resolve_build_user;
use crate::process::{self, BuildUser, Restrictions, SandboxedCommand};

const CONFIG_FILE: &str = ".config";
const LOCK_FILE: &str = ".kernel-image-builder.lock";

/// Builds and cleans kernel source trees.
///
/// Holds no per-build state; one builder can serve concurrent builds of
/// different source trees.
#[derive(Debug, Clone, Default)]
pub struct KernelBuilder {
    config: BuilderConfig,
}

impl KernelBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Build the kernel in `source_dir` with `kconfig` as its configuration.
    ///
    /// A compilation failure comes back as [`Error::Build`], titled with the
    /// log line that most likely caused it.
    pub fn build(&self, source_dir: &Path, compiler: &str, kconfig: &[u8]) -> Result<()> {
        let user = resolve_build_user(self.config.sandbox, &self.config.build_user)?;
        tracing::info!(
            source = %source_dir.display(),
            compiler,
            sandboxed = user.is_some(),
            "building kernel"
        );
        let _lock = lock_tree(source_dir)?;

        let config_path = source_dir.join(CONFIG_FILE);
        fs::write(&config_path, kconfig)
            .map_err(|e| Error::io_at("writing kernel config", &config_path, e))?;
        if let Some(user) = user {
            user.chown(&config_path)?;
        }

        // oldconfig with no stdin takes the default for every new option,
        // same as olddefconfig, which kernels before 3.7 lack. CC matters:
        // since 4.17 the compiler is recorded in the config.
        tracing::info!("resolving config defaults");
        let cmd = self
            .make(source_dir, user)
            .arg("oldconfig")
            .arg(cc_arg(compiler));
        process::run(
            &cmd,
            self.config.timeouts.resolve_defaults(),
            restrictions(user),
        )?;

        let jobs = self.config.jobs();
        tracing::info!(jobs, "compiling bzImage");
        let cmd = self.make(source_dir, user).args([
            "bzImage".to_string(),
            "-j".to_string(),
            jobs.to_string(),
            cc_arg(compiler),
        ]);
        match process::run(&cmd, self.config.timeouts.compile(), restrictions(user)) {
            Ok(outcome) => {
                tracing::info!(elapsed_secs = outcome.wall_time.as_secs(), "kernel built");
                Ok(())
            }
            Err(Error::Execution(raw)) => {
                let failure = BuildFailure::diagnose(raw);
                match failure.title() {
                    Some(title) => tracing::info!(title, "kernel build failed"),
                    None => tracing::info!("kernel build failed, no root cause found"),
                }
                Err(Error::Build(failure))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove all build products and configuration from `source_dir`.
    pub fn clean(&self, source_dir: &Path) -> Result<()> {
        let user = resolve_build_user(self.config.sandbox, &self.config.build_user)?;
        tracing::info!(source = %source_dir.display(), "cleaning kernel tree");
        let _lock = lock_tree(source_dir)?;

        let cmd = self.make(source_dir, user).args([
            "distclean".to_string(),
            "-j".to_string(),
            self.config.jobs().to_string(),
        ]);
        process::run(&cmd, self.config.timeouts.clean(), restrictions(user))?;
        Ok(())
    }

    fn make(&self, source_dir: &Path, user: Option<BuildUser>) -> SandboxedCommand {
        let cmd = SandboxedCommand::new(&self.config.make, source_dir);
        match user {
            Some(user) => cmd.run_as(user),
            None => cmd,
        }
    }
}

/// Build the kernel in `source_dir` using the default configuration.
pub fn build(source_dir: &Path, compiler: &str, kconfig: &[u8]) -> Result<()> {
    KernelBuilder::default().build(source_dir, compiler, kconfig)
}

/// Clean `source_dir` using the default configuration.
pub fn clean(source_dir: &Path) -> Result<()> {
    KernelBuilder::default().clean(source_dir)
}

/// Take the per-tree lock; released when the returned file is dropped.
///
/// The lock file is never unlinked. Removing a file another process still
/// holds a lock on would let a third process lock a fresh file at the same
/// path.
fn lock_tree(source_dir: &Path) -> Result<File> {
    let path = source_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| Error::io_at("creating lock file", &path, e))?;
    if file.try_lock_exclusive().is_err() {
        return Err(Error::Config(format!(
            "kernel tree '{}' is in use by another build",
            source_dir.display()
        )));
    }
    Ok(file)
}

fn cc_arg(compiler: &str) -> String {
    format!("CC={}", compiler)
}

fn restrictions(user: Option<BuildUser>) -> Restrictions {
    if user.is_some() {
        Restrictions::FULL
    } else {
        Restrictions::NONE
    }
}
