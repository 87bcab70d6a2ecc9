//! Bootable disk image assembly.
//!
//! The heavy lifting is done by an embedded shell script (partitioning,
//! loop mounts, bootloader, SSH key). This module stages it in a private
//! temporary directory, runs it, and copies `disk.raw` and `key` out.
//!
//! Script contract:
//! - `$1`: userspace root filesystem directory
//! - `$2`: kernel image
//! - `IMAGE_VM_TYPE`: `qemu` or `gce`
//! - `IMAGE_CMDLINE_FILE`: absolute path of extra kernel command line, or empty
//! - `IMAGE_SYSCTL_FILE`: absolute path of extra sysctl settings, or empty
//! - writes `disk.raw` and `key` into its working directory

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::build::target::{Target, VmKind};
use crate::config::BuilderConfig;
use crate::error::{Error, Result};
use crate::process::{self, Restrictions, SandboxedCommand};

const CREATE_IMAGE_SCRIPT: &str = include_str!("../../scripts/create-image.sh");

const SCRIPT_NAME: &str = "create-image.sh";
const DISK_IMAGE: &str = "disk.raw";
const SSH_KEY: &str = "key";
const STAGING_PREFIX: &str = "kernel-image-";

pub const ENV_VM_TYPE: &str = "IMAGE_VM_TYPE";
pub const ENV_CMDLINE_FILE: &str = "IMAGE_CMDLINE_FILE";
pub const ENV_SYSCTL_FILE: &str = "IMAGE_SYSCTL_FILE";

/// Everything needed to assemble one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub target_os: String,
    pub target_arch: String,
    pub vm_kind: String,
    /// Kernel source tree the kernel was built in.
    pub kernel_dir: PathBuf,
    pub userspace_dir: PathBuf,
    /// Appended to the kernel command line.
    pub cmdline_file: Option<PathBuf>,
    /// Appended to the image's /etc/sysctl.conf.
    pub sysctl_file: Option<PathBuf>,
    pub output_image: PathBuf,
    /// Root SSH private key for the image.
    pub output_key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    config: BuilderConfig,
    script: &'static str,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

impl ImageBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            script: CREATE_IMAGE_SCRIPT,
        }
    }

    /// Produce `output_image` and `output_key` for `req`.
    ///
    /// Unsupported targets and VM kinds are rejected before anything touches
    /// the filesystem. The staging directory is removed on every path out.
    pub fn create_image(&self, req: &ImageRequest) -> Result<()> {
        let target = Target::parse(&req.target_os, &req.target_arch)?;
        let vm_kind: VmKind = req.vm_kind.parse()?;

        let staging_root = self.config.staging_root();
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&staging_root)
            .map_err(|e| Error::io_at("creating staging directory in", &staging_root, e))?;
        tracing::info!(
            %target,
            vm = %vm_kind,
            staging = %staging.path().display(),
            "assembling image"
        );

        let result = self.assemble(target, vm_kind, req, staging.path());
        let cleanup = staging
            .close()
            .map_err(|e| Error::io("removing staging directory", e));
        result.and(cleanup)
    }

    fn assemble(
        &self,
        target: Target,
        vm_kind: VmKind,
        req: &ImageRequest,
        staging: &Path,
    ) -> Result<()> {
        let script = staging.join(SCRIPT_NAME);
        fs::write(&script, self.script)
            .map_err(|e| Error::io_at("writing image script", &script, e))?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::io_at("setting permissions on", &script, e))?;

        let kernel_image = req.kernel_dir.join(target.kernel_image());
        // Run via bash: exec of a just-written file fails with ETXTBSY while
        // a concurrent fork still holds its write descriptor.
        let cmd = SandboxedCommand::new("bash", staging)
            .arg(&script)
            .arg(&req.userspace_dir)
            .arg(&kernel_image)
            .env(ENV_VM_TYPE, vm_kind.as_str())
            .env(ENV_CMDLINE_FILE, absolute(req.cmdline_file.as_deref())?)
            .env(ENV_SYSCTL_FILE, absolute(req.sysctl_file.as_deref())?);
        let outcome = process::execute(&cmd, self.config.timeouts.image(), Restrictions::NONE)?;
        outcome.into_result().map_err(Error::ImageBuild)?;

        // Copy, not rename: staging and destination may be on different
        // filesystems.
        copy_artifact(&staging.join(DISK_IMAGE), &req.output_image)?;
        copy_artifact(&staging.join(SSH_KEY), &req.output_key)?;
        fs::set_permissions(&req.output_key, fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io_at("restricting permissions on", &req.output_key, e))?;

        tracing::info!(
            image = %req.output_image.display(),
            key = %req.output_key.display(),
            "image ready"
        );
        Ok(())
    }
}

/// Assemble an image using the default configuration.
pub fn create_image(req: &ImageRequest) -> Result<()> {
    ImageBuilder::default().create_image(req)
}

fn copy_artifact(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| {
        Error::io(
            format!("copying '{}' to '{}'", src.display(), dst.display()),
            e,
        )
    })?;
    Ok(())
}

/// Absolute form of an optional path; empty when absent.
fn absolute(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        None => Ok(PathBuf::new()),
        Some(p) if p.as_os_str().is_empty() => Ok(PathBuf::new()),
        Some(p) if p.is_absolute() => Ok(p.to_path_buf()),
        Some(p) => std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .map_err(|e| Error::io("resolving current directory", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records what it was given into the two artifacts.
    const RECORDING_SCRIPT: &str = r#"#!/bin/bash
set -eu
{
    echo "userspace=$1"
    echo "kernel=$2"
    echo "vm=$IMAGE_VM_TYPE"
    echo "cmdline=$IMAGE_CMDLINE_FILE"
    echo "sysctl=$IMAGE_SYSCTL_FILE"
} > disk.raw
echo "PRIVATE KEY" > key
"#;

    const FAILING_SCRIPT: &str = "#!/bin/bash\necho 'mkfs.ext4: no space left' >&2\nexit 3\n";

    /// Produces the disk but never the key, so the second copy fails.
    const NO_KEY_SCRIPT: &str = "#!/bin/bash\necho disk > disk.raw\n";

    struct Fixture {
        staging_root: tempfile::TempDir,
        out: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                staging_root: tempfile::tempdir().unwrap(),
                out: tempfile::tempdir().unwrap(),
            }
        }

        fn builder(&self, script: &'static str) -> ImageBuilder {
            let config = BuilderConfig {
                staging_root: Some(self.staging_root.path().to_path_buf()),
                ..BuilderConfig::default()
            };
            ImageBuilder {
                config,
                script,
            }
        }

        fn request(&self) -> ImageRequest {
            ImageRequest {
                target_os: "linux".into(),
                target_arch: "amd64".into(),
                vm_kind: "qemu".into(),
                kernel_dir: PathBuf::from("/src/linux"),
                userspace_dir: PathBuf::from("/images/bullseye"),
                cmdline_file: None,
                sysctl_file: None,
                output_image: self.out.path().join("image"),
                output_key: self.out.path().join("key"),
            }
        }

        fn staging_is_empty(&self) -> bool {
            fs::read_dir(self.staging_root.path()).unwrap().next().is_none()
        }
    }

    #[test]
    fn test_create_image() {
        let fx = Fixture::new();
        let mut req = fx.request();
        req.vm_kind = "gce".into();
        req.sysctl_file = Some(PathBuf::from("/etc/extra-sysctl.conf"));

        fx.builder(RECORDING_SCRIPT).create_image(&req).unwrap();

        let disk = fs::read_to_string(&req.output_image).unwrap();
        assert!(disk.contains("userspace=/images/bullseye\n"));
        assert!(disk.contains("kernel=/src/linux/arch/x86/boot/bzImage\n"));
        assert!(disk.contains("vm=gce\n"));
        assert!(disk.contains("cmdline=\n"));
        assert!(disk.contains("sysctl=/etc/extra-sysctl.conf\n"));

        let key_mode = fs::metadata(&req.output_key).unwrap().permissions().mode();
        assert_eq!(key_mode & 0o777, 0o600);
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_relative_optional_files_become_absolute() {
        let fx = Fixture::new();
        let mut req = fx.request();
        req.cmdline_file = Some(PathBuf::from("cmdline.txt"));

        fx.builder(RECORDING_SCRIPT).create_image(&req).unwrap();

        let disk = fs::read_to_string(&req.output_image).unwrap();
        let expected = std::env::current_dir().unwrap().join("cmdline.txt");
        assert!(disk.contains(&format!("cmdline={}\n", expected.display())));
    }

    #[test]
    fn test_unsupported_os_has_no_side_effects() {
        let fx = Fixture::new();
        let mut req = fx.request();
        req.target_os = "windows".into();

        let err = fx.builder(RECORDING_SCRIPT).create_image(&req).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(fx.staging_is_empty());
        assert!(!req.output_image.exists());
        assert!(!req.output_key.exists());
    }

    #[test]
    fn test_unsupported_vm_kind_rejected() {
        let fx = Fixture::new();
        let mut req = fx.request();
        req.vm_kind = "vbox".into();

        let err = fx.builder(RECORDING_SCRIPT).create_image(&req).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_script_failure_is_not_diagnosed() {
        let fx = Fixture::new();
        let req = fx.request();

        let err = fx.builder(FAILING_SCRIPT).create_image(&req).unwrap_err();
        match &err {
            Error::ImageBuild(verr) => {
                assert!(String::from_utf8_lossy(verr.output()).contains("no space left"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().starts_with("image build failed: "));
        assert!(fx.staging_is_empty());
        assert!(!req.output_image.exists());
    }

    #[test]
    fn test_staging_removed_when_copy_fails() {
        let fx = Fixture::new();
        let req = fx.request();

        let err = fx.builder(NO_KEY_SCRIPT).create_image(&req).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(fx.staging_is_empty());
        assert!(req.output_image.exists());
        assert!(!req.output_key.exists());
    }

    #[test]
    fn test_staging_removed_when_destination_unwritable() {
        let fx = Fixture::new();
        let mut req = fx.request();
        req.output_image = fx.out.path().join("missing-dir/image");

        let err = fx.builder(RECORDING_SCRIPT).create_image(&req).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_embedded_script_contract() {
        assert!(CREATE_IMAGE_SCRIPT.starts_with("#!/bin/bash"));
        for needle in [ENV_VM_TYPE, ENV_CMDLINE_FILE, ENV_SYSCTL_FILE, DISK_IMAGE] {
            assert!(CREATE_IMAGE_SCRIPT.contains(needle), "script lacks {needle}");
        }
        assert!(CREATE_IMAGE_SCRIPT.contains("-f key"));
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute(None).unwrap(), PathBuf::new());
        assert_eq!(absolute(Some(Path::new(""))).unwrap(), PathBuf::new());
        assert_eq!(
            absolute(Some(Path::new("/etc/sysctl.d/x.conf"))).unwrap(),
            PathBuf::from("/etc/sysctl.d/x.conf")
        );
        assert!(absolute(Some(Path::new("rel"))).unwrap().is_absolute());
    }
}
