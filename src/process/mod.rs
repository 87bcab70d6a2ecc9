//! Bounded execution of external build tools.
//!
//! Every invocation gets a hard wall-clock deadline. The child runs in its
//! own process group; on timeout the whole group is killed, so nothing the
//! build tool forked outlives the step. stdout and stderr are captured into
//! one buffer. The interleaving between the two is best-effort, consumers
//! scan it line by line.
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_image_builder::process::{run, Restrictions, SandboxedCommand};
//! use std::time::Duration;
//!
//! let cmd = SandboxedCommand::new("make", "/src/linux").args(["distclean"]);
//! run(&cmd, Duration::from_secs(600), Restrictions::NONE)?;
//! ```

pub mod sandbox;

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};

pub use sandbox::{BuildUser, Restrictions};
use sandbox::Confinement;

/// How long to wait for output pipes to close once the child is gone.
/// Only exceeded when a descendant escaped the process group.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on the sleep between exit polls.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often a blocked reader checks whether it was told to stop.
const READER_POLL_MS: libc::c_int = 100;

/// One external invocation, fully described before it runs.
///
/// The environment starts as a copy of the current process environment;
/// [`SandboxedCommand::env`] overrides inherited values.
#[derive(Debug, Clone)]
pub struct SandboxedCommand {
    program: OsString,
    args: Vec<OsString>,
    working_dir: PathBuf,
    env: BTreeMap<OsString, OsString>,
    run_as: Option<BuildUser>,
}

impl SandboxedCommand {
    pub fn new(program: impl AsRef<OsStr>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: std::env::vars_os().collect(),
            run_as: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    /// Identity to drop to when privilege restriction is requested.
    pub fn run_as(mut self, user: BuildUser) -> Self {
        self.run_as = Some(user);
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn environment(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    pub fn build_user(&self) -> Option<BuildUser> {
        self.run_as
    }
}

impl fmt::Display for SandboxedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Result of one invocation that got as far as running.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    /// stdout and stderr, combined. May end mid-line after a timeout.
    pub output: Vec<u8>,
    pub wall_time: Duration,
    summary: String,
}

impl ExecutionOutcome {
    /// Turn a failed outcome into the error that carries its output.
    pub fn into_result(self) -> std::result::Result<ExecutionOutcome, VerboseError> {
        if self.succeeded {
            Ok(self)
        } else {
            Err(VerboseError {
                message: self.summary,
                output: self.output,
                wall_time: self.wall_time,
            })
        }
    }
}

/// A process that ran and failed, with everything it printed.
///
/// Non-zero exit and timeout both end up here.
#[derive(Debug, Clone)]
pub struct VerboseError {
    message: String,
    output: Vec<u8>,
    wall_time: Duration,
}

impl VerboseError {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }
}

impl fmt::Display for VerboseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.output.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(
                f,
                "{}\n\n{}",
                self.message,
                String::from_utf8_lossy(&self.output)
            )
        }
    }
}

impl std::error::Error for VerboseError {}

/// Run `cmd` and fail unless it exits successfully within `timeout`.
///
/// Non-zero exit and timeout produce [`Error::Execution`] with the captured
/// output. Start-up problems produce [`Error::Sandbox`] or [`Error::Spawn`].
pub fn run(
    cmd: &SandboxedCommand,
    timeout: Duration,
    restrictions: Restrictions,
) -> Result<ExecutionOutcome> {
    execute(cmd, timeout, restrictions)?
        .into_result()
        .map_err(Error::Execution)
}

/// Run `cmd` and report how it ended. Only start-up problems are errors.
pub fn execute(
    cmd: &SandboxedCommand,
    timeout: Duration,
    restrictions: Restrictions,
) -> Result<ExecutionOutcome> {
    if !cmd.working_dir.is_dir() {
        return Err(Error::io_at(
            "missing working directory",
            &cmd.working_dir,
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }
    let confinement = Confinement::prepare(restrictions, cmd.run_as, &cmd.working_dir)?;

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .current_dir(&cmd.working_dir)
        .env_clear()
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if restrictions.filesystem {
        // The rest of the filesystem is read-only for the child.
        command.env("TMPDIR", &cmd.working_dir);
    }
    if let Some(confinement) = confinement {
        // SAFETY: apply() only performs async-signal-safe syscalls and does
        // not allocate.
        unsafe {
            command.pre_exec(move || confinement.apply());
        }
    }

    tracing::debug!(
        command = %cmd,
        dir = %cmd.working_dir.display(),
        timeout_secs = timeout.as_secs(),
        ?restrictions,
        "spawning"
    );
    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| Error::Spawn {
        program: cmd.program.to_string_lossy().into_owned(),
        source,
    })?;
    let pgid = child.id() as libc::pid_t;

    let output = Arc::new(Mutex::new(Vec::new()));
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();
    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Arc::clone(&output), Arc::clone(&stop), done_tx.clone());
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Arc::clone(&output), Arc::clone(&stop), done_tx.clone());
        readers += 1;
    }
    drop(done_tx);

    let waited = wait_with_deadline(&mut child, pgid, start.checked_add(timeout));
    let (status, timed_out) = match waited {
        Ok(waited) => waited,
        Err(e) => {
            kill_group(pgid);
            stop.store(true, Ordering::Relaxed);
            return Err(Error::io(format!("waiting for '{}'", cmd), e));
        }
    };

    drain_readers(&done_rx, readers);
    stop.store(true, Ordering::Relaxed);
    let wall_time = start.elapsed();
    let output = {
        let mut buf = output.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buf)
    };

    let summary = if timed_out {
        tracing::warn!(command = %cmd, timeout_secs = timeout.as_secs(), "timed out, killed");
        format!("'{}' timed out after {}", cmd, format_duration(timeout))
    } else if status.success() {
        String::new()
    } else {
        format!("'{}' failed: {}", cmd, status)
    };

    Ok(ExecutionOutcome {
        succeeded: !timed_out && status.success(),
        output,
        wall_time,
        summary,
    })
}

/// Copy `pipe` into `sink` until EOF or until `stop` is set.
///
/// A descendant that left the process group can hold the pipe open
/// indefinitely; `stop` bounds how long the thread outlives its run.
fn spawn_reader<R>(
    mut pipe: R,
    sink: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    done: Sender<()>,
) -> thread::JoinHandle<()>
where
    R: Read + AsRawFd + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 64 * 1024];
        while !stop.load(Ordering::Relaxed) {
            match readable(pipe.as_raw_fd(), READER_POLL_MS) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(_) => break,
            }
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = done.send(());
    })
}

/// Wait up to `timeout_ms` for `fd` to have data or reach EOF.
fn readable(fd: RawFd, timeout_ms: libc::c_int) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    match rc {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Wait for exit, killing the process group once `deadline` passes.
/// `None` means a deadline too far out to represent.
///
/// The group is killed before the leader is reaped, so its id cannot have
/// been handed to an unrelated group yet. Returns the exit status and
/// whether the deadline was hit.
fn wait_with_deadline(
    child: &mut Child,
    pgid: libc::pid_t,
    deadline: Option<Instant>,
) -> io::Result<(ExitStatus, bool)> {
    let mut interval = Duration::from_millis(1);
    let timed_out = loop {
        if has_exited(pgid)? {
            break false;
        }
        let now = Instant::now();
        let left = match deadline {
            Some(d) if now >= d => break true,
            Some(d) => d - now,
            None => MAX_POLL_INTERVAL,
        };
        thread::sleep(interval.min(left));
        interval = (interval * 2).min(MAX_POLL_INTERVAL);
    };
    // Whatever the child left running in its group goes too.
    kill_group(pgid);
    let status = child.wait()?;
    Ok((status, timed_out))
}

/// Whether `pid` has exited, leaving it unreaped.
fn has_exited(pid: libc::pid_t) -> io::Result<bool> {
    loop {
        // SAFETY: zeroed siginfo_t is a valid out-parameter for waitid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: waitid on our own child; WNOWAIT leaves it waitable.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            // SAFETY: waitid filled in the SIGCHLD fields.
            return Ok(unsafe { info.si_pid() } != 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn kill_group(pgid: libc::pid_t) {
    // ESRCH just means the group is already gone.
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

/// Give readers [`OUTPUT_DRAIN_GRACE`] to hit EOF. Stragglers are stopped
/// by the caller within [`READER_POLL_MS`].
fn drain_readers(done: &Receiver<()>, mut pending: usize) {
    let deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
    while pending > 0 {
        let left = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(left) {
            Ok(()) => pending -= 1,
            Err(_) => {
                tracing::warn!(
                    "output pipes still open after the process exited; returning partial output"
                );
                return;
            }
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else if secs > 0 && d.subsec_millis() == 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
