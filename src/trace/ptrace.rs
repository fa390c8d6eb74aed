//! ptrace(2) debugger backend.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::TraceError;
use crate::trace::{Debugger, SyscallInfo, TraceEvent};

/// [`Debugger`] backed by ptrace on the calling thread.
///
/// The thread that spawns the child is its tracer; every later call must
/// come from that same thread.
#[derive(Debug, Default)]
pub struct Ptrace {
    waiter: Option<Waiter>,
}

impl Ptrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started on the first timed wait.
    fn waiter(&mut self) -> Result<&mut Waiter, TraceError> {
        let waiter = match self.waiter.take() {
            Some(waiter) => waiter,
            None => Waiter::spawn()?,
        };
        Ok(self.waiter.insert(waiter))
    }
}

fn ptrace_err(op: &'static str) -> impl FnOnce(Errno) -> TraceError {
    move |source| TraceError::Ptrace { op, source }
}

/// Thread blocked in waitpid(2) on the tracer's behalf, so a wait can be
/// abandoned when its timeout passes. Any thread of the tracing process
/// may wait for the tracee; only ptrace requests are bound to the tracer.
#[derive(Debug)]
struct Waiter {
    requests: Sender<Pid>,
    statuses: Receiver<nix::Result<WaitStatus>>,
    /// A request is out and its answer has not been taken yet.
    pending: bool,
}

impl Waiter {
    fn spawn() -> Result<Self, TraceError> {
        let (requests, incoming) = mpsc::channel::<Pid>();
        let (answers, statuses) = mpsc::channel();
        std::thread::Builder::new()
            .name("sdbg-waitpid".to_string())
            .spawn(move || {
                for pid in incoming {
                    let status = loop {
                        match waitpid(pid, None) {
                            Err(Errno::EINTR) => continue,
                            other => break other,
                        }
                    };
                    if answers.send(status).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| TraceError::Ptrace {
                op: "spawn wait thread",
                source: Errno::from_raw(e.raw_os_error().unwrap_or(nix::libc::EAGAIN)),
            })?;
        Ok(Self {
            requests,
            statuses,
            pending: false,
        })
    }

    /// Next wait status of `pid`, or `None` once `timeout` passes. A wait
    /// that timed out stays outstanding and answers the next call.
    fn next(&mut self, pid: Pid, timeout: Duration) -> Result<Option<WaitStatus>, TraceError> {
        if !self.pending {
            self.requests.send(pid).map_err(|_| Self::gone())?;
            self.pending = true;
        }
        match self.statuses.recv_timeout(timeout) {
            Ok(status) => {
                self.pending = false;
                status.map(Some).map_err(ptrace_err("waitpid"))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Self::gone()),
        }
    }

    fn gone() -> TraceError {
        TraceError::Ptrace {
            op: "waitpid",
            source: Errno::ECHILD,
        }
    }
}

/// Turn a wait status into an event. `None` means keep waiting.
fn classify(pid: Pid, status: WaitStatus) -> Result<Option<TraceEvent>, TraceError> {
    match status {
        WaitStatus::PtraceSyscall(_) => Ok(Some(TraceEvent::SyscallStop)),
        WaitStatus::Stopped(_, sig) => Ok(Some(TraceEvent::Signaled(sig))),
        WaitStatus::Exited(_, code) => Ok(Some(TraceEvent::Exited(code))),
        WaitStatus::Signaled(_, sig, _) => Ok(Some(TraceEvent::Killed(sig))),
        WaitStatus::PtraceEvent(_, _, event) => {
            // Exec event stops sit inside execve; absorb them so the
            // entry/exit pairing seen by the loop is unchanged.
            tracing::debug!("pid {} ptrace event {}", pid, event);
            ptrace::syscall(pid, None).map_err(ptrace_err("syscall"))?;
            Ok(None)
        }
        WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(None),
    }
}

impl Debugger for Ptrace {
    fn spawn_traced(
        &mut self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Pid, TraceError> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }
        // SAFETY: only the async-signal-safe ptrace(2) call runs between
        // fork and exec.
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
        }
        let child = command.spawn().map_err(TraceError::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);

        // The exec delivers SIGTRAP; the child is stopped once we see it.
        match waitpid(pid, None).map_err(ptrace_err("waitpid"))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            other => {
                return Err(TraceError::UnexpectedStatus {
                    pid: pid.as_raw(),
                    status: format!("{:?}", other),
                })
            }
        }

        ptrace::setoptions(
            pid,
            ptrace::Options::PTRACE_O_TRACESYSGOOD
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_EXITKILL,
        )
        .map_err(ptrace_err("setoptions"))?;

        Ok(pid)
    }

    fn step(&mut self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError> {
        ptrace::syscall(pid, signal).map_err(ptrace_err("syscall"))
    }

    fn wait_event(&mut self, pid: Pid, timeout: Option<Duration>) -> Result<TraceEvent, TraceError> {
        let Some(timeout) = timeout else {
            loop {
                match waitpid(pid, None) {
                    Ok(status) => {
                        if let Some(event) = classify(pid, status)? {
                            return Ok(event);
                        }
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(ptrace_err("waitpid")(e)),
                }
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(status) = self.waiter()?.next(pid, remaining)? else {
                return Err(TraceError::Timeout(timeout));
            };
            if let Some(event) = classify(pid, status)? {
                return Ok(event);
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn syscall_info(&mut self, pid: Pid) -> Option<SyscallInfo> {
        let regs = ptrace::getregs(pid).ok()?;
        Some(SyscallInfo {
            number: regs.orig_rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
        })
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn syscall_info(&mut self, _pid: Pid) -> Option<SyscallInfo> {
        None
    }

    fn kill(&mut self, pid: Pid) -> Result<(), TraceError> {
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(ptrace_err("kill")(e)),
        }
        // Reap so no zombie is left behind.
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    return Ok(())
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(ptrace_err("waitpid")(e)),
            }
        }
    }
}
