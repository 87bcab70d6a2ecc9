//! Supported image targets.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;

/// An OS/architecture pair images can be assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    LinuxAmd64,
}

impl Target {
    pub fn parse(os: &str, arch: &str) -> Result<Self, Error> {
        match (os, arch) {
            ("linux", "amd64") => Ok(Target::LinuxAmd64),
            _ => Err(Error::Config(format!(
                "unsupported target {}/{}: only linux/amd64 is supported",
                os, arch
            ))),
        }
    }

    /// Kernel image produced by the kernel build, relative to its source dir.
    pub fn kernel_image(&self) -> &'static Path {
        match self {
            Target::LinuxAmd64 => Path::new("arch/x86/boot/bzImage"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::LinuxAmd64 => write!(f, "linux/amd64"),
        }
    }
}

/// Virtual machine flavour the image is prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    Qemu,
    Gce,
}

impl VmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmKind::Qemu => "qemu",
            VmKind::Gce => "gce",
        }
    }
}

impl FromStr for VmKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(VmKind::Qemu),
            "gce" => Ok(VmKind::Gce),
            other => Err(Error::Config(format!(
                "unsupported vm type '{}': images can be built only for qemu/gce machines",
                other
            ))),
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_linux_amd64() {
        assert_eq!(Target::parse("linux", "amd64").unwrap(), Target::LinuxAmd64);
        for (os, arch) in [("windows", "amd64"), ("linux", "arm64"), ("freebsd", "amd64"), ("", "")] {
            assert!(matches!(Target::parse(os, arch), Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_kernel_image_path() {
        assert_eq!(
            Target::LinuxAmd64.kernel_image(),
            Path::new("arch/x86/boot/bzImage")
        );
    }

    #[test]
    fn test_vm_kind() {
        assert_eq!("qemu".parse::<VmKind>().unwrap(), VmKind::Qemu);
        assert_eq!("gce".parse::<VmKind>().unwrap(), VmKind::Gce);
        assert!("QEMU".parse::<VmKind>().is_err());
        assert!("kvm".parse::<VmKind>().is_err());
        assert_eq!(VmKind::Gce.to_string(), "gce");
    }
}
