//! The operating-system collaborator: external commands and job signals.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use tracing::debug;

use crate::Error;
use crate::task::Job;

/// What an external command runs with besides its arguments.
pub struct Attributes {
    /// Environment passed to the child, replacing the interpreter's own.
    pub env: Vec<(String, String)>,
    /// Job the new process is recorded in.
    pub job: Arc<Job>,
    /// Hand the controlling terminal to the new process group.
    pub foreground: bool,
}

pub trait Processes: Send + Sync {
    /// Runs `path` to completion and returns its status.
    fn execute(&self, path: &Path, argv: &[String], attributes: &Attributes) -> Result<u8, Error>;
    fn terminate(&self, pid: u32) -> Result<(), Error>;
    fn suspend(&self, pid: u32) -> Result<(), Error>;
    fn resume(&self, pid: u32) -> Result<(), Error>;
    /// Process group owning the controlling terminal, if there is one.
    fn foreground(&self) -> Option<i32>;
    fn set_foreground(&self, group: i32) -> Result<(), Error>;
}

/// Resolves a command name. Names containing `/` are paths; anything else
/// is searched along `path`.
pub fn search(name: &str, path: Option<&str>) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    std::env::split_paths(path?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Shell-style status: the exit code, or 128 plus the signal that killed it.
fn exit_status(status: ExitStatus) -> u8 {
    if let Some(code) = status.code() {
        return u8::try_from(code & 0xff).unwrap_or(u8::MAX);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return u8::try_from(128 + (signal & 0x7f)).unwrap_or(u8::MAX);
        }
    }
    1
}

/// Processes backed by the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

impl Processes for System {
    fn execute(&self, path: &Path, argv: &[String], attributes: &Attributes) -> Result<u8, Error> {
        let mut command = Command::new(path);
        command.args(argv).env_clear().envs(
            attributes
                .env
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str())),
        );

        let text = std::iter::once(path.display().to_string())
            .chain(argv.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut child = attributes.job.launch(&text, |group| {
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(group.unwrap_or(0));
            }
            #[cfg(not(unix))]
            let _ = group;
            command.spawn()
        })?;
        let pid = child.id();
        debug!(pid, group = ?attributes.job.group(), command = %text, "started");
        if attributes.foreground
            && self.foreground().is_some()
            && let Some(group) = attributes.job.group()
            && let Err(error) = self.set_foreground(group)
        {
            debug!(%error, "couldn't hand over the terminal");
        }
        let status = child.wait();
        attributes.job.finish(pid);
        Ok(exit_status(status?))
    }

    fn terminate(&self, pid: u32) -> Result<(), Error> {
        signal(pid, Signal::Terminate)
    }

    fn suspend(&self, pid: u32) -> Result<(), Error> {
        signal(pid, Signal::Stop)
    }

    fn resume(&self, pid: u32) -> Result<(), Error> {
        signal(pid, Signal::Continue)
    }

    #[cfg(unix)]
    fn foreground(&self) -> Option<i32> {
        // SAFETY: tcgetpgrp only reads the terminal state of stdin.
        let group = unsafe { libc::tcgetpgrp(libc::STDIN_FILENO) };
        (group >= 0).then_some(group)
    }

    #[cfg(not(unix))]
    fn foreground(&self) -> Option<i32> {
        None
    }

    #[cfg(unix)]
    fn set_foreground(&self, group: i32) -> Result<(), Error> {
        // SAFETY: tcsetpgrp takes plain integers and reports failure via errno.
        if unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, group) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_foreground(&self, _: i32) -> Result<(), Error> {
        Err(Error::runtime("job control is not supported on this platform"))
    }
}

/// Lets an interactive shell take the terminal back from a finished
/// foreground job without being stopped for it.
#[cfg(unix)]
pub fn ignore_terminal_signals() {
    // SAFETY: installing SIG_IGN for job-control signals has no preconditions.
    unsafe {
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
pub fn ignore_terminal_signals() {}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Stop,
    Continue,
}

#[cfg(unix)]
fn signal(pid: u32, signal: Signal) -> Result<(), Error> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| Error::runtime(format!("bad pid {pid}")))?;
    let number = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Stop => libc::SIGSTOP,
        Signal::Continue => libc::SIGCONT,
    };
    // SAFETY: kill takes plain integers and reports failure via errno.
    if unsafe { libc::kill(pid, number) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal(pid: u32, signal: Signal) -> Result<(), Error> {
    Err(Error::runtime(format!("can't deliver {signal:?} to {pid} on this platform")))
}
