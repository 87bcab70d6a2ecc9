//! Privilege, filesystem and network restrictions for build steps.
//!
//! Restrictions are applied in the forked child before `exec`, in this
//! order: namespaces -> every mount read-only except the working directory
//! -> supplementary groups -> GID -> UID -> parent-death signal.
//! A failing step aborts the spawn, so the workload never starts with
//! fewer restrictions than requested.

use std::ffi::{CString, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use crate::config::SandboxMode;
use crate::error::{Error, Result};

/// Which restrictions a sandboxed invocation runs under.
///
/// The flags are independent; any combination may be requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Restrictions {
    /// Drop to the command's build identity.
    pub privileges: bool,
    /// Make everything but the working directory read-only.
    pub filesystem: bool,
    /// Private network, IPC and UTS namespaces.
    pub network: bool,
}

impl Restrictions {
    pub const NONE: Restrictions = Restrictions {
        privileges: false,
        filesystem: false,
        network: false,
    };

    pub const FULL: Restrictions = Restrictions {
        privileges: true,
        filesystem: true,
        network: true,
    };

    pub fn any(&self) -> bool {
        self.privileges || self.filesystem || self.network
    }
}

/// Unprivileged identity build steps run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildUser {
    pub uid: u32,
    pub gid: u32,
}

impl BuildUser {
    /// Resolve a user name via the system password database.
    ///
    /// Returns `Ok(None)` when no such user exists.
    pub fn lookup(name: &str) -> Result<Option<BuildUser>> {
        if name.contains('\0') {
            return Err(Error::Config(format!("invalid user name '{}'", name)));
        }
        let user = nix::unistd::User::from_name(name).map_err(|e| {
            Error::Sandbox(format!("looking up user '{}': {}", name, e))
        })?;
        Ok(user.map(|u| BuildUser {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        }))
    }

    /// Hand a file over to this user, so steps running as it can rewrite it.
    pub fn chown(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))
            .map_err(|e| Error::io_at("changing owner of", path, e))
    }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Decide which identity sandboxed build steps run as.
///
/// `None` means steps run with the caller's credentials and no
/// restrictions. Under [`SandboxMode::Enforce`] that is never the answer.
pub fn resolve_build_user(mode: SandboxMode, name: &str) -> Result<Option<BuildUser>> {
    match mode {
        SandboxMode::Off => Ok(None),
        SandboxMode::Auto => {
            if !is_root() {
                tracing::debug!("not running as root, build steps run unsandboxed");
                return Ok(None);
            }
            let user = BuildUser::lookup(name)?;
            if user.is_none() {
                tracing::warn!(
                    user = name,
                    "build user does not exist, build steps run unsandboxed as root"
                );
            }
            Ok(user)
        }
        SandboxMode::Enforce => {
            if !is_root() {
                return Err(Error::Sandbox(
                    "sandboxed builds require root privileges".into(),
                ));
            }
            match BuildUser::lookup(name)? {
                Some(user) => Ok(Some(user)),
                None => Err(Error::Sandbox(format!(
                    "build user '{}' does not exist",
                    name
                ))),
            }
        }
    }
}

/// Restrictions resolved against one command, ready to apply in the child.
///
/// Everything that allocates happens in [`Confinement::prepare`]; `apply`
/// only issues raw syscalls, which is all that is allowed between fork and
/// exec.
#[derive(Debug)]
pub(crate) struct Confinement {
    restrictions: Restrictions,
    user: Option<BuildUser>,
    work_dir: CString,
    /// Mount points to flip read-only, in mount table order.
    read_only: Vec<ReadOnlyMount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadOnlyMount {
    target: CString,
    /// Per-mount flags to keep across the remount.
    flags: libc::c_ulong,
}

impl Confinement {
    pub(crate) fn prepare(
        restrictions: Restrictions,
        user: Option<BuildUser>,
        work_dir: &Path,
    ) -> Result<Option<Confinement>> {
        if !restrictions.any() {
            return Ok(None);
        }
        if !cfg!(target_os = "linux") {
            return Err(Error::Sandbox(
                "restrictions are only supported on Linux".into(),
            ));
        }
        if !is_root() {
            return Err(Error::Sandbox(
                "restricted execution requires root privileges".into(),
            ));
        }
        if restrictions.privileges {
            match user {
                None => {
                    return Err(Error::Sandbox(
                        "privilege restriction requested without a build user".into(),
                    ))
                }
                Some(u) if u.uid == 0 || u.gid == 0 => {
                    return Err(Error::Sandbox(format!(
                        "refusing to use root credentials (uid={}, gid={}) as build user",
                        u.uid, u.gid
                    )))
                }
                Some(_) => {}
            }
        }

        let work_dir = fs::canonicalize(work_dir)
            .map_err(|e| Error::io_at("resolving working directory", work_dir, e))?;
        let read_only = if restrictions.filesystem {
            let table = fs::read_to_string(MOUNT_TABLE)
                .map_err(|e| Error::io_at("reading", Path::new(MOUNT_TABLE), e))?;
            read_only_mounts(&table, &work_dir)?
        } else {
            Vec::new()
        };

        Ok(Some(Confinement {
            restrictions,
            user: if restrictions.privileges { user } else { None },
            work_dir: c_path(&work_dir)?,
            read_only,
        }))
    }

    /// Runs in the child between fork and exec.
    #[cfg(target_os = "linux")]
    pub(crate) fn apply(&self) -> io::Result<()> {
        let mut flags = 0;
        if self.restrictions.filesystem {
            flags |= libc::CLONE_NEWNS;
        }
        if self.restrictions.network {
            flags |= libc::CLONE_NEWNET | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS;
        }
        if flags != 0 {
            // SAFETY: plain syscall on the child's own task.
            check(unsafe { libc::unshare(flags) })?;
        }

        if self.restrictions.filesystem {
            self.confine_writes()?;
        }

        if let Some(user) = self.user {
            drop_privileges(user)?;
        }

        // Must follow the credential change, which clears it.
        // SAFETY: PR_SET_PDEATHSIG takes a signal number.
        check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) })?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn apply(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    #[cfg(target_os = "linux")]
    fn confine_writes(&self) -> io::Result<()> {
        let root = b"/\0".as_ptr() as *const libc::c_char;
        let dir = self.work_dir.as_ptr();
        let null = std::ptr::null::<libc::c_char>();

        // SAFETY: NUL-terminated paths, null fs type and data are permitted
        // for propagation changes, binds and remounts.
        unsafe {
            // Keep our mount changes out of the host namespace.
            check(libc::mount(
                null,
                root,
                null,
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ))?;
            // The working directory becomes its own mount and stays writable.
            check(libc::mount(
                dir,
                dir,
                null,
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            ))?;
            for mount in &self.read_only {
                let rc = libc::mount(
                    null,
                    mount.target.as_ptr(),
                    null,
                    libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | mount.flags,
                    std::ptr::null(),
                );
                if rc == -1 {
                    let err = io::Error::last_os_error();
                    // Shadowed by a later mount or gone since the table was read.
                    match err.raw_os_error() {
                        Some(libc::ENOENT) | Some(libc::EINVAL) => continue,
                        _ => return Err(err),
                    }
                }
            }
            // cwd still points below the read-only parent mount.
            check(libc::chdir(dir))?;
        }
        Ok(())
    }
}

const MOUNT_TABLE: &str = "/proc/self/mountinfo";

/// Every mount point in `table` (mountinfo format) outside `work_dir`,
/// with `/` guaranteed to be among them.
fn read_only_mounts(table: &str, work_dir: &Path) -> Result<Vec<ReadOnlyMount>> {
    if work_dir == Path::new("/") {
        return Ok(Vec::new());
    }
    let mut mounts = Vec::new();
    let mut saw_root = false;
    for (target, flags) in parse_mount_table(table) {
        if target.starts_with(work_dir) {
            continue;
        }
        saw_root |= target == Path::new("/");
        mounts.push(ReadOnlyMount {
            target: c_path(&target)?,
            flags,
        });
    }
    if !saw_root {
        mounts.insert(
            0,
            ReadOnlyMount {
                target: c_path(Path::new("/"))?,
                flags: 0,
            },
        );
    }
    Ok(mounts)
}

/// Mount points and their per-mount flags.
///
/// Field 5 of a mountinfo line is the mount point, field 6 its options.
fn parse_mount_table(table: &str) -> Vec<(PathBuf, libc::c_ulong)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace().skip(4);
            let target = fields.next()?;
            let options = fields.next()?;
            Some((unescape_mount_path(target), mount_flags(options)))
        })
        .collect()
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(digits) = bytes.get(i + 1..i + 4) {
                if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                    let value = digits
                        .iter()
                        .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                    if let Ok(byte) = u8::try_from(value) {
                        out.push(byte);
                        i += 4;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(out))
}

#[cfg(target_os = "linux")]
fn mount_flags(options: &str) -> libc::c_ulong {
    options
        .split(',')
        .map(|opt| match opt {
            "nosuid" => libc::MS_NOSUID,
            "nodev" => libc::MS_NODEV,
            "noexec" => libc::MS_NOEXEC,
            "noatime" => libc::MS_NOATIME,
            "nodiratime" => libc::MS_NODIRATIME,
            "relatime" => libc::MS_RELATIME,
            _ => 0,
        })
        .fold(0, |acc, flag| acc | flag)
}

#[cfg(not(target_os = "linux"))]
fn mount_flags(_options: &str) -> libc::c_ulong {
    0
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Sandbox(format!("path contains a NUL byte: {}", path.display())))
}

/// setgroups -> setresgid -> setresuid -> verify. GID before UID, or the
/// GID change is no longer permitted.
#[cfg(target_os = "linux")]
fn drop_privileges(user: BuildUser) -> io::Result<()> {
    // SAFETY: raw credential syscalls on the child's own task.
    unsafe {
        check(libc::setgroups(0, std::ptr::null()))?;
        check(libc::setresgid(user.gid, user.gid, user.gid))?;
        check(libc::setresuid(user.uid, user.uid, user.uid))?;

        if libc::getuid() != user.uid
            || libc::geteuid() != user.uid
            || libc::getgid() != user.gid
            || libc::getegid() != user.gid
        {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        // Regaining root must be impossible.
        if libc::setuid(0) == 0 {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
    }
    Ok(())
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
