//! `kernel-image-builder` - build kernels, diagnose failed builds and
//! assemble VM disk images.
//!
//! ## Commands
//!
//! - `build`: configure and compile a kernel tree
//! - `clean`: remove build products from a kernel tree
//! - `create-image`: assemble a bootable disk image
//! - `diagnose`: extract the root cause from a saved build log
//! - `preflight`: check host tools

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use kernel_image_builder::{
    preflight, BuilderConfig, Diagnosis, Error, ImageBuilder, ImageRequest, KernelBuilder,
};

#[derive(Parser)]
#[command(name = "kernel-image-builder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build kernels and disk images for test VMs", long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/kernel-image-builder/config.toml)
    #[arg(long, global = true, env = "KERNEL_IMAGE_BUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure and compile a kernel source tree
    Build {
        /// Kernel source directory
        #[arg(long)]
        source: PathBuf,

        /// C compiler passed to the build as CC
        #[arg(long, default_value = "gcc")]
        compiler: String,

        /// Kernel config to build with
        #[arg(long)]
        kconfig: PathBuf,
    },

    /// Remove build products from a kernel source tree
    Clean {
        /// Kernel source directory
        #[arg(long)]
        source: PathBuf,
    },

    /// Assemble a bootable disk image from a userspace tree and a built kernel
    CreateImage {
        #[arg(long, default_value = "linux")]
        os: String,

        #[arg(long, default_value = "amd64")]
        arch: String,

        /// VM kind: qemu or gce
        #[arg(long, default_value = "qemu")]
        vm: String,

        /// Kernel source directory the kernel was built in
        #[arg(long)]
        kernel: PathBuf,

        /// Root filesystem tree
        #[arg(long)]
        userspace: PathBuf,

        /// Extra kernel command line arguments
        #[arg(long)]
        cmdline: Option<PathBuf>,

        /// Extra sysctl settings
        #[arg(long)]
        sysctl: Option<PathBuf>,

        /// Output disk image
        #[arg(long)]
        image: PathBuf,

        /// Output root SSH private key
        #[arg(long)]
        key: PathBuf,
    },

    /// Extract the root cause from a saved build log
    Diagnose {
        /// Build log file
        log: PathBuf,

        /// Print a JSON report instead of the bare title
        #[arg(long)]
        json: bool,
    },

    /// Check that the host has the required tools
    Preflight {
        /// Also check the tools image assembly needs
        #[arg(long)]
        image: bool,

        /// C compiler to check for
        #[arg(long, default_value = "gcc")]
        compiler: String,
    },
}

fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    match cli.command {
        Commands::Diagnose { log, json } => diagnose(log, json),
        command => {
            let config = BuilderConfig::load(cli.config.as_deref()).context("loading config")?;
            run(command, config)
        }
    }
}

fn run(command: Commands, config: BuilderConfig) -> Result<()> {
    match command {
        Commands::Build {
            source,
            compiler,
            kconfig,
        } => {
            let kconfig_bytes = fs::read(&kconfig)
                .with_context(|| format!("reading kernel config '{}'", kconfig.display()))?;
            let builder = KernelBuilder::new(config);
            if let Err(err) = builder.build(&source, &compiler, &kconfig_bytes) {
                report_output(&err);
                return Err(err)
                    .with_context(|| format!("building kernel in '{}'", source.display()));
            }
            info!("kernel built in {}", source.display());
            Ok(())
        }
        Commands::Clean { source } => {
            KernelBuilder::new(config)
                .clean(&source)
                .map_err(|err| {
                    report_output(&err);
                    err
                })
                .with_context(|| format!("cleaning '{}'", source.display()))
        }
        Commands::CreateImage {
            os,
            arch,
            vm,
            kernel,
            userspace,
            cmdline,
            sysctl,
            image,
            key,
        } => {
            let req = ImageRequest {
                target_os: os,
                target_arch: arch,
                vm_kind: vm,
                kernel_dir: kernel,
                userspace_dir: userspace,
                cmdline_file: cmdline,
                sysctl_file: sysctl,
                output_image: image,
                output_key: key,
            };
            if let Err(err) = ImageBuilder::new(config).create_image(&req) {
                report_output(&err);
                return Err(err).context("creating image");
            }
            info!(
                "image written to {} (key: {})",
                req.output_image.display(),
                req.output_key.display()
            );
            Ok(())
        }
        Commands::Preflight { image, compiler } => {
            preflight::check_kernel_tools(&config.make, &compiler)?;
            if image {
                preflight::check_image_tools()?;
            }
            println!("all required host tools found");
            Ok(())
        }
        Commands::Diagnose { log, json } => diagnose(log, json),
    }
}

fn diagnose(log: PathBuf, json: bool) -> Result<()> {
    let output = fs::read(&log).with_context(|| format!("reading '{}'", log.display()))?;
    let diagnosis = Diagnosis::of(&output);

    if json {
        let report = serde_json::to_string_pretty(&diagnosis)?;
        println!("{}", report);
        return Ok(());
    }
    match diagnosis.title {
        Some(title) => {
            println!("{}", title);
            Ok(())
        }
        None => bail!("no root cause found in '{}'", log.display()),
    }
}

/// Dump captured process output so the full log is not lost behind the
/// one-line error.
fn report_output(err: &Error) {
    if let Some(output) = err.output() {
        error!("process output follows");
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(output);
        let _ = stderr.flush();
    }
}
