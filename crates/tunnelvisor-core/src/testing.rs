//! In-memory [`ProcessHost`] for exercising the prober, stop sequence and
//! supervisor without touching real processes.

use crate::process::{
    CommandPattern, ProcessHost, ProcessId, ProcessInspection, ProcessLifecycle,
    ProcessTermination, SpawnSpec, TerminationResult,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// How a fake process reacts to SIGTERM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnTerm {
    Exit,
    /// Stays visible for this many existence checks, then exits
    ExitAfterPolls(u32),
    Ignore,
    Deny,
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub command_name: String,
    pub command_line: String,
    pub on_term: OnTerm,
    pub survives_kill: bool,
    remaining_polls: Option<u32>,
}

impl FakeProcess {
    pub fn new(command_name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            command_line: command_line.into(),
            on_term: OnTerm::Exit,
            survives_kill: false,
            remaining_polls: None,
        }
    }

    pub fn on_term(mut self, on_term: OnTerm) -> Self {
        self.on_term = on_term;
        self
    }

    pub fn survives_kill(mut self) -> Self {
        self.survives_kill = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentSignal {
    Term(ProcessId),
    Kill(ProcessId),
}

/// What the next spawn does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnBehavior {
    Stay,
    ExitImmediately,
    Fail,
}

#[derive(Debug)]
struct FakeState {
    processes: BTreeMap<ProcessId, FakeProcess>,
    signals: Vec<SentSignal>,
    spawned: Vec<SpawnSpec>,
    spawn_behavior: SpawnBehavior,
    spawn_on_term: OnTerm,
    next_pid: u32,
}

#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                processes: BTreeMap::new(),
                signals: Vec::new(),
                spawned: Vec::new(),
                spawn_behavior: SpawnBehavior::Stay,
                spawn_on_term: OnTerm::Exit,
                next_pid: 1000,
            }),
        }
    }
}

impl FakeHost {
    pub fn add_process(&self, pid: ProcessId, command_name: &str, command_line: &str) {
        self.add(pid, FakeProcess::new(command_name, command_line));
    }

    pub fn add(&self, pid: ProcessId, process: FakeProcess) {
        self.state.lock().unwrap().processes.insert(pid, process);
    }

    /// Simulates an out-of-band kill
    pub fn remove_process(&self, pid: ProcessId) {
        self.state.lock().unwrap().processes.remove(&pid);
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn signals(&self) -> Vec<SentSignal> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn spawned(&self) -> Vec<SpawnSpec> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn set_spawn_behavior(&self, behavior: SpawnBehavior) {
        self.state.lock().unwrap().spawn_behavior = behavior;
    }

    /// SIGTERM behaviour of processes spawned from now on
    pub fn set_spawn_on_term(&self, on_term: OnTerm) {
        self.state.lock().unwrap().spawn_on_term = on_term;
    }
}

#[async_trait]
impl ProcessLifecycle for FakeHost {
    async fn spawn_detached(&self, spec: &SpawnSpec, mut log: File) -> std::io::Result<ProcessId> {
        let mut state = self.state.lock().unwrap();
        state.spawned.push(spec.clone());

        if state.spawn_behavior == SpawnBehavior::Fail {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: command not found", spec.program),
            ));
        }

        let pid = ProcessId(state.next_pid);
        state.next_pid += 1;
        writeln!(log, "fake: {}", spec.command_line())?;

        if state.spawn_behavior == SpawnBehavior::Stay {
            let command_name = Path::new(&spec.program)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&spec.program)
                .to_string();
            let on_term = state.spawn_on_term;
            state.processes.insert(
                pid,
                FakeProcess::new(command_name, spec.command_line()).on_term(on_term),
            );
        }
        Ok(pid)
    }

    async fn is_alive(&self, pid: ProcessId) -> bool {
        let mut state = self.state.lock().unwrap();
        let expired = match state.processes.get_mut(&pid) {
            None => return false,
            Some(process) => match process.remaining_polls.as_mut() {
                Some(n) if *n == 0 => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            },
        };
        if expired {
            state.processes.remove(&pid);
        }
        !expired
    }
}

#[async_trait]
impl ProcessInspection for FakeHost {
    async fn command_name(&self, pid: ProcessId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.processes.get(&pid).map(|p| p.command_name.clone())
    }

    async fn find_by_command_line(&self, pattern: &CommandPattern) -> Vec<ProcessId> {
        let state = self.state.lock().unwrap();
        state
            .processes
            .iter()
            .filter(|(_, p)| {
                let argv: Vec<&str> = p.command_line.split_whitespace().collect();
                pattern.matches(&argv)
            })
            .map(|(pid, _)| *pid)
            .collect()
    }
}

#[async_trait]
impl ProcessTermination for FakeHost {
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
        let mut state = self.state.lock().unwrap();
        let Some(on_term) = state.processes.get(&pid).map(|p| p.on_term) else {
            return TerminationResult::ProcessNotFound;
        };
        if on_term == OnTerm::Deny {
            return TerminationResult::AccessDenied;
        }
        state.signals.push(SentSignal::Term(pid));
        match on_term {
            OnTerm::Exit => {
                state.processes.remove(&pid);
            }
            OnTerm::ExitAfterPolls(n) => {
                if let Some(process) = state.processes.get_mut(&pid) {
                    process.remaining_polls = Some(n);
                }
            }
            OnTerm::Ignore | OnTerm::Deny => {}
        }
        TerminationResult::Success
    }

    async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
        let mut state = self.state.lock().unwrap();
        let Some(survives) = state.processes.get(&pid).map(|p| p.survives_kill) else {
            return TerminationResult::ProcessNotFound;
        };
        state.signals.push(SentSignal::Kill(pid));
        if !survives {
            state.processes.remove(&pid);
        }
        TerminationResult::Success
    }
}

impl ProcessHost for FakeHost {
    fn platform_name(&self) -> &'static str {
        "fake"
    }
}
