//! Syscall tracing event loop.
//!
//! A traced child is single-stepped from one syscall boundary to the next.
//! Each iteration issues exactly one step and waits for exactly one event;
//! only an exit ends the loop.

pub mod ptrace;
pub mod syscalls;

use std::fmt;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::TraceError;
use crate::utils::CancellationToken;

pub use ptrace::Ptrace;

/// Classified debugger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// Stopped at a syscall entry or exit.
    SyscallStop,
    /// Stopped by an incoming signal.
    Signaled(Signal),
    /// Exited normally with a status code.
    Exited(i32),
    /// Killed by a signal.
    Killed(Signal),
}

/// Lifecycle of the traced child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Running,
    StoppedAtSyscall,
    Signaled,
    Exited,
}

/// Registers of the syscall the child is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallInfo {
    pub number: u64,
    pub args: [u64; 6],
}

impl fmt::Display for SyscallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match syscalls::name(self.number) {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "syscall_{}", self.number)?,
        }
        let args: Vec<String> = self.args.iter().map(|a| format!("{:#x}", a)).collect();
        write!(f, "({})", args.join(", "))
    }
}

/// Debugger backend.
pub trait Debugger {
    /// Spawn `program` stopped under trace.
    fn spawn_traced(
        &mut self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Pid, TraceError>;

    /// Resume until the next syscall boundary, delivering `signal` if set.
    fn step(&mut self, pid: Pid, signal: Option<Signal>) -> Result<(), TraceError>;

    /// Block until the child stops or exits, or `timeout` elapses.
    fn wait_event(&mut self, pid: Pid, timeout: Option<Duration>) -> Result<TraceEvent, TraceError>;

    /// Decode the syscall the stopped child is in, when supported.
    fn syscall_info(&mut self, pid: Pid) -> Option<SyscallInfo>;

    fn kill(&mut self, pid: Pid) -> Result<(), TraceError>;
}

/// Mutable view of the traced child, owned by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedProcess {
    pub pid: Pid,
    pub state: TraceState,
    pub last_signal: Option<Signal>,
    /// True between a syscall entry stop and its exit stop.
    pub in_syscall: bool,
}

impl TracedProcess {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: TraceState::Running,
            last_signal: None,
            in_syscall: false,
        }
    }
}

/// What the loop saw, handed to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    SyscallEnter(Option<SyscallInfo>),
    SyscallExit(Option<SyscallInfo>),
    Signal {
        signal: Signal,
        syscall: Option<SyscallInfo>,
    },
    Exit(i32),
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceRecord::SyscallEnter(Some(info)) => write!(f, "-> {}", info),
            TraceRecord::SyscallEnter(None) => write!(f, "-> syscall"),
            TraceRecord::SyscallExit(Some(info)) => write!(f, "<- {}", info),
            TraceRecord::SyscallExit(None) => write!(f, "<- syscall"),
            TraceRecord::Signal {
                signal,
                syscall: Some(info),
            } => write!(f, "--- {} in {} ---", signal, info),
            TraceRecord::Signal { signal, syscall: None } => write!(f, "--- {} ---", signal),
            TraceRecord::Exit(code) => write!(f, "+++ exited with {} +++", code),
        }
    }
}

/// Counters collected over a traced run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    /// Completed syscall entry/exit pairs.
    pub syscalls: u64,
    pub signals: Vec<Signal>,
    /// Exit code; signal deaths are reported as 128 + signo.
    pub exit_code: i32,
}

/// Loop settings.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Decode registers at syscall entries as well as at signals.
    pub decode_syscalls: bool,
    /// Upper bound on each wait for an event.
    pub wait_timeout: Option<Duration>,
    /// Upper bound on the whole traced run, counted from spawn.
    pub time_limit: Option<Duration>,
}

/// One traced child and the debugger driving it.
pub struct TraceSession<D: Debugger> {
    debugger: D,
    process: TracedProcess,
    options: TraceOptions,
    cancel: CancellationToken,
    step_pending: bool,
    deadline: Option<Instant>,
}

impl<D: Debugger> TraceSession<D> {
    /// Spawn `program` under trace. The child starts out stopped.
    pub fn spawn(
        mut debugger: D,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        options: TraceOptions,
    ) -> Result<Self, TraceError> {
        let pid = debugger.spawn_traced(program, args, env)?;
        tracing::debug!("tracing {} as pid {}", program, pid);
        let deadline = options.time_limit.map(|limit| Instant::now() + limit);
        Ok(Self {
            debugger,
            process: TracedProcess::new(pid),
            options,
            cancel: CancellationToken::new(),
            step_pending: false,
            deadline,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn process(&self) -> &TracedProcess {
        &self.process
    }

    /// Request one syscall step.
    pub fn step(&mut self, signal: Option<Signal>) -> Result<(), TraceError> {
        if self.step_pending {
            return Err(TraceError::Protocol(
                "step requested while the previous step has no event".to_string(),
            ));
        }
        if self.process.state == TraceState::Exited {
            return Err(TraceError::Protocol("step requested after exit".to_string()));
        }
        self.debugger.step(self.process.pid, signal)?;
        self.step_pending = true;
        self.process.state = TraceState::Running;
        Ok(())
    }

    /// Wait for the event answering the pending step.
    pub fn wait(&mut self) -> Result<TraceEvent, TraceError> {
        if !self.step_pending {
            return Err(TraceError::Protocol("wait without a pending step".to_string()));
        }
        let timeout = self.next_wait_timeout()?;
        let event = match self.debugger.wait_event(self.process.pid, timeout) {
            Err(TraceError::Timeout(waited)) => {
                return Err(TraceError::Timeout(self.exceeded_limit(waited)))
            }
            result => result?,
        };
        self.step_pending = false;
        Ok(event)
    }

    /// Run until the child exits.
    ///
    /// Timeout and cancellation return an error and leave the child
    /// stopped; call [`TraceSession::kill`] to reap it.
    pub fn run<F>(&mut self, mut observe: F) -> Result<TraceSummary, TraceError>
    where
        F: FnMut(&TraceRecord),
    {
        let mut summary = TraceSummary::default();
        let mut deliver: Option<Signal> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(TraceError::Cancelled);
            }

            self.step(deliver.take())?;
            let event = self.wait()?;

            match event {
                TraceEvent::Exited(code) => {
                    self.finish(code, &mut summary, &mut observe);
                    return Ok(summary);
                }
                TraceEvent::Killed(signal) => {
                    self.process.last_signal = Some(signal);
                    self.finish(128 + signal as i32, &mut summary, &mut observe);
                    return Ok(summary);
                }
                TraceEvent::Signaled(signal) => {
                    self.process.state = TraceState::Signaled;
                    self.process.last_signal = Some(signal);
                    summary.signals.push(signal);
                    let syscall = self.debugger.syscall_info(self.process.pid);
                    tracing::debug!("pid {} received {}", self.process.pid, signal);
                    observe(&TraceRecord::Signal { signal, syscall });
                    deliver = Some(signal);
                }
                TraceEvent::SyscallStop => {
                    self.process.state = TraceState::StoppedAtSyscall;
                    self.process.in_syscall = !self.process.in_syscall;
                    let info = if self.options.decode_syscalls {
                        self.debugger.syscall_info(self.process.pid)
                    } else {
                        None
                    };
                    if self.process.in_syscall {
                        crate::trace_log!("pid {} enter {:?}", self.process.pid, info);
                        observe(&TraceRecord::SyscallEnter(info));
                    } else {
                        summary.syscalls += 1;
                        observe(&TraceRecord::SyscallExit(info));
                    }
                }
            }
        }
    }

    /// Per-event timeout, shortened to what is left of the time limit.
    fn next_wait_timeout(&self) -> Result<Option<Duration>, TraceError> {
        let Some(deadline) = self.deadline else {
            return Ok(self.options.wait_timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TraceError::Timeout(self.options.time_limit.unwrap_or_default()));
        }
        Ok(Some(match self.options.wait_timeout {
            Some(t) => t.min(remaining),
            None => remaining,
        }))
    }

    /// The configured limit a timed-out wait ran into. Waits are cut short
    /// to fit the time limit, so `waited` alone can be a fraction of it.
    fn exceeded_limit(&self, waited: Duration) -> Duration {
        let run_expired = self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
        match (self.options.time_limit, self.options.wait_timeout) {
            (Some(limit), _) if run_expired => limit,
            (_, Some(per_wait)) => per_wait,
            (Some(limit), None) => limit,
            (None, None) => waited,
        }
    }

    fn finish<F>(&mut self, code: i32, summary: &mut TraceSummary, observe: &mut F)
    where
        F: FnMut(&TraceRecord),
    {
        self.process.state = TraceState::Exited;
        self.process.in_syscall = false;
        summary.exit_code = code;
        tracing::debug!("pid {} exited with {}", self.process.pid, code);
        observe(&TraceRecord::Exit(code));
    }

    /// Kill the child if it has not exited yet.
    pub fn kill(&mut self) -> Result<(), TraceError> {
        if self.process.state == TraceState::Exited {
            return Ok(());
        }
        self.debugger.kill(self.process.pid)?;
        self.process.state = TraceState::Exited;
        self.step_pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Step(Option<Signal>),
        Wait,
        Kill,
    }

    /// Plays back a fixed list of events.
    #[derive(Default)]
    struct ScriptedDebugger {
        events: VecDeque<Result<TraceEvent, TraceError>>,
        calls: Vec<Call>,
        /// Time each wait takes before answering.
        delay: Duration,
    }

    impl ScriptedDebugger {
        fn new(events: Vec<TraceEvent>) -> Self {
            Self {
                events: events.into_iter().map(Ok).collect(),
                ..Default::default()
            }
        }
    }

    impl Debugger for ScriptedDebugger {
        fn spawn_traced(
            &mut self,
            _program: &str,
            _args: &[String],
            _env: &[(String, String)],
        ) -> Result<Pid, TraceError> {
            Ok(Pid::from_raw(4242))
        }
        fn step(&mut self, _pid: Pid, signal: Option<Signal>) -> Result<(), TraceError> {
            self.calls.push(Call::Step(signal));
            Ok(())
        }
        fn wait_event(
            &mut self,
            _pid: Pid,
            _timeout: Option<Duration>,
        ) -> Result<TraceEvent, TraceError> {
            self.calls.push(Call::Wait);
            std::thread::sleep(self.delay);
            self.events
                .pop_front()
                .unwrap_or_else(|| panic!("loop waited past the end of the script"))
        }
        fn syscall_info(&mut self, _pid: Pid) -> Option<SyscallInfo> {
            Some(SyscallInfo {
                number: 0,
                args: [1, 2, 3, 0, 0, 0],
            })
        }
        fn kill(&mut self, _pid: Pid) -> Result<(), TraceError> {
            self.calls.push(Call::Kill);
            Ok(())
        }
    }

    fn session(events: Vec<TraceEvent>) -> TraceSession<ScriptedDebugger> {
        TraceSession::spawn(
            ScriptedDebugger::new(events),
            "/bin/true",
            &[],
            &[],
            TraceOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_loop_ends_only_on_exit() {
        let mut s = session(vec![
            TraceEvent::SyscallStop,
            TraceEvent::SyscallStop,
            TraceEvent::SyscallStop,
            TraceEvent::SyscallStop,
            TraceEvent::Exited(3),
        ]);
        let summary = s.run(|_| {}).unwrap();
        assert_eq!(summary.exit_code, 3);
        assert_eq!(summary.syscalls, 2);
        assert_eq!(s.process().state, TraceState::Exited);
        // One step per wait, strictly alternating.
        let calls = &s.debugger.calls;
        assert_eq!(calls.len(), 10);
        for pair in calls.chunks(2) {
            assert!(matches!(pair[0], Call::Step(_)));
            assert_eq!(pair[1], Call::Wait);
        }
    }

    #[test]
    fn test_signals_are_redelivered_and_loop_resumes() {
        let mut s = session(vec![
            TraceEvent::Signaled(Signal::SIGUSR1),
            TraceEvent::SyscallStop,
            TraceEvent::Signaled(Signal::SIGCHLD),
            TraceEvent::Signaled(Signal::SIGWINCH),
            TraceEvent::Exited(0),
        ]);
        let mut records = Vec::new();
        let summary = s.run(|r| records.push(r.clone())).unwrap();

        assert_eq!(
            summary.signals,
            vec![Signal::SIGUSR1, Signal::SIGCHLD, Signal::SIGWINCH]
        );
        assert_eq!(s.process().last_signal, Some(Signal::SIGWINCH));
        let steps: Vec<_> = s
            .debugger
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Step(sig) => Some(*sig),
                _ => None,
            })
            .collect();
        assert_eq!(
            steps,
            vec![
                None,
                Some(Signal::SIGUSR1),
                None,
                Some(Signal::SIGCHLD),
                Some(Signal::SIGWINCH)
            ]
        );
        assert!(matches!(
            records[0],
            TraceRecord::Signal { signal: Signal::SIGUSR1, syscall: Some(_) }
        ));
        assert_eq!(records.last(), Some(&TraceRecord::Exit(0)));
    }

    #[test]
    fn test_entry_exit_flag_toggles() {
        let mut s = session(vec![TraceEvent::SyscallStop, TraceEvent::SyscallStop, TraceEvent::Exited(0)]);
        s.step(None).unwrap();
        assert_eq!(s.wait().unwrap(), TraceEvent::SyscallStop);
        assert_eq!(s.process().state, TraceState::Running);

        let mut records = Vec::new();
        s.options.decode_syscalls = true;
        // Hand the rest to the loop; its first stop is the exit of this syscall.
        s.process.in_syscall = true;
        s.run(|r| records.push(r.clone())).unwrap();
        assert!(matches!(records[0], TraceRecord::SyscallExit(Some(_))));
        assert!(!s.process().in_syscall);
    }

    #[test]
    fn test_killed_child_reports_signal_exit_code() {
        let mut s = session(vec![TraceEvent::SyscallStop, TraceEvent::Killed(Signal::SIGKILL)]);
        let summary = s.run(|_| {}).unwrap();
        assert_eq!(summary.exit_code, 128 + 9);
        assert_eq!(s.process().state, TraceState::Exited);
    }

    #[test]
    fn test_wait_without_step_is_protocol_error() {
        let mut s = session(vec![TraceEvent::Exited(0)]);
        assert!(matches!(s.wait(), Err(TraceError::Protocol(_))));
        assert!(s.debugger.calls.is_empty());
    }

    #[test]
    fn test_double_step_is_protocol_error() {
        let mut s = session(vec![TraceEvent::Exited(0)]);
        s.step(None).unwrap();
        assert!(matches!(s.step(None), Err(TraceError::Protocol(_))));
        assert_eq!(s.debugger.calls, vec![Call::Step(None)]);
    }

    #[test]
    fn test_step_after_exit_is_protocol_error() {
        let mut s = session(vec![TraceEvent::Exited(0)]);
        s.run(|_| {}).unwrap();
        assert!(matches!(s.step(None), Err(TraceError::Protocol(_))));
    }

    #[test]
    fn test_cancellation_stops_before_next_step() {
        let cancel = CancellationToken::new();
        let mut s = session(vec![TraceEvent::SyscallStop, TraceEvent::Exited(0)])
            .with_cancellation(cancel.clone());
        cancel.cancel();
        assert!(matches!(s.run(|_| {}), Err(TraceError::Cancelled)));
        assert!(s.debugger.calls.is_empty());

        s.kill().unwrap();
        assert_eq!(s.debugger.calls, vec![Call::Kill]);
        assert_eq!(s.process().state, TraceState::Exited);
    }

    #[test]
    fn test_timeout_is_propagated() {
        let mut debugger = ScriptedDebugger::default();
        debugger
            .events
            .push_back(Err(TraceError::Timeout(Duration::from_millis(5))));
        let mut s = TraceSession::spawn(debugger, "/bin/sleep", &[], &[], TraceOptions::default())
            .unwrap();
        assert!(matches!(s.run(|_| {}), Err(TraceError::Timeout(_))));
        assert_ne!(s.process().state, TraceState::Exited);
    }

    #[test]
    fn test_timeout_reports_configured_limit() {
        // The run limit is what expired, even though the wait was shortened.
        let options = TraceOptions {
            wait_timeout: Some(Duration::from_secs(60)),
            time_limit: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let mut debugger = ScriptedDebugger::default();
        debugger.delay = Duration::from_millis(30);
        debugger
            .events
            .push_back(Err(TraceError::Timeout(Duration::from_millis(19))));
        let mut s = TraceSession::spawn(debugger, "/bin/sleep", &[], &[], options).unwrap();
        match s.run(|_| {}) {
            Err(TraceError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(20)),
            other => panic!("expected timeout, got {:?}", other),
        }

        // The run limit has time left, so the per-event limit expired.
        let options = TraceOptions {
            wait_timeout: Some(Duration::from_millis(50)),
            time_limit: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut debugger = ScriptedDebugger::default();
        debugger
            .events
            .push_back(Err(TraceError::Timeout(Duration::from_millis(49))));
        let mut s = TraceSession::spawn(debugger, "/bin/sleep", &[], &[], options).unwrap();
        match s.run(|_| {}) {
            Err(TraceError::Timeout(limit)) => assert_eq!(limit, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_time_limit_times_out_without_waiting() {
        let options = TraceOptions {
            time_limit: Some(Duration::ZERO),
            ..Default::default()
        };
        let debugger = ScriptedDebugger::new(vec![TraceEvent::Exited(0)]);
        let mut s = TraceSession::spawn(debugger, "/bin/sleep", &[], &[], options).unwrap();
        assert!(matches!(s.run(|_| {}), Err(TraceError::Timeout(_))));
        assert_eq!(s.debugger.calls, vec![Call::Step(None)]);

        s.kill().unwrap();
        assert_eq!(s.process().state, TraceState::Exited);
    }

    #[test]
    fn test_syscall_info_display() {
        let info = SyscallInfo {
            number: u64::MAX,
            args: [0, 1, 2, 3, 4, 0xff],
        };
        assert_eq!(
            info.to_string(),
            format!("syscall_{}(0x0, 0x1, 0x2, 0x3, 0x4, 0xff)", u64::MAX)
        );
    }

    #[test]
    fn test_record_display() {
        assert_eq!(TraceRecord::Exit(2).to_string(), "+++ exited with 2 +++");
        assert_eq!(TraceRecord::SyscallEnter(None).to_string(), "-> syscall");
        assert_eq!(
            TraceRecord::Signal {
                signal: Signal::SIGINT,
                syscall: None
            }
            .to_string(),
            "--- SIGINT ---"
        );
    }
}
