//! Process strategy: each worker is a child process.
//!
//! The child is the backend binary started with `--worker`. It receives a
//! `Load` command first, then `Generate`/`Shutdown` commands as JSON Lines on
//! stdin, and answers on stdout. Worker logs go to the parent's stderr.
//!
//! Two bridge threads per child:
//! - pump: pool request channel → child stdin (plus `Shutdown` on stop)
//! - reader: child stdout → pool response channel
//!
//! Only loaders compiled into the worker binary are available in the child.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use llm_backend_types::{WorkerCommand, WorkerRequest, WorkerResponse};

use super::{wait_until, SpawnError};
use crate::signal::ShutdownSignal;
use crate::unit::WorkerUnit;

/// How to start a worker process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessOptions {
    /// Run `program --worker`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["--worker".to_string()],
        }
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    child: Option<Child>,
    shutdown: ShutdownSignal,
    pump: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

pub(super) fn spawn(unit: WorkerUnit, options: &ProcessOptions) -> Result<ProcessHandle, SpawnError> {
    let poll_interval = unit.poll_interval();
    let (label, config, channels, shutdown) = unit.into_parts();

    log::info!(
        "Spawning worker process for {label}: {} {}",
        options.program.display(),
        options.args.join(" ")
    );

    let mut child = Command::new(&options.program)
        .args(&options.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        kill_and_reap(&mut child);
        return Err(SpawnError::Handshake("worker pipes not available".to_string()));
    };

    let load = WorkerRequest {
        id: 0,
        command: WorkerCommand::Load { config },
    };
    if let Err(e) = write_line(&mut stdin, &load) {
        kill_and_reap(&mut child);
        return Err(SpawnError::Handshake(e));
    }

    let pump = thread::Builder::new()
        .name(format!("llm-pump-{label}"))
        .spawn({
            let shutdown = shutdown.clone();
            move || pump_requests(stdin, channels.requests, shutdown, poll_interval)
        });
    let pump = match pump {
        Ok(pump) => pump,
        Err(e) => {
            kill_and_reap(&mut child);
            return Err(e.into());
        }
    };

    let reader = thread::Builder::new()
        .name(format!("llm-reader-{label}"))
        .spawn(move || read_responses(stdout, channels.responses));
    let reader = match reader {
        Ok(reader) => reader,
        Err(e) => {
            shutdown.set();
            kill_and_reap(&mut child);
            return Err(e.into());
        }
    };

    Ok(ProcessHandle {
        child: Some(child),
        shutdown,
        pump: Some(pump),
        reader: Some(reader),
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub(super) fn signal_stop(&self) {
        // The pump notices within one poll interval and sends `Shutdown`.
        self.shutdown.set();
    }

    pub(super) fn join(&mut self, timeout: Duration) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        let exited = wait_until(timeout, || !matches!(child.try_wait(), Ok(None)));
        if !exited {
            return false;
        }
        self.child = None;
        self.join_bridges();
        true
    }

    pub(super) fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    /// Kill the worker process immediately. OS reclaims all memory.
    pub(super) fn force_stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::warn!("Killing worker process {}", child.id());
            kill_and_reap(&mut child);
        }
        self.join_bridges();
    }

    fn join_bridges(&mut self) {
        self.shutdown.set();
        for bridge in [self.pump.take(), self.reader.take()].into_iter().flatten() {
            let _ = bridge.join();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.shutdown.set();
            kill_and_reap(&mut child);
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait(); // Reap
}

fn write_line(stdin: &mut ChildStdin, request: &WorkerRequest) -> Result<(), String> {
    let json = serde_json::to_string(request).map_err(|e| format!("Serialize error: {e}"))?;
    writeln!(stdin, "{json}").map_err(|e| format!("Failed to write to worker stdin: {e}"))?;
    stdin
        .flush()
        .map_err(|e| format!("Failed to flush worker stdin: {e}"))
}

/// Forward pool requests to the child's stdin until stopped.
fn pump_requests(
    mut stdin: ChildStdin,
    requests: Receiver<WorkerRequest>,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
) {
    loop {
        if shutdown.is_set() {
            let _ = write_line(&mut stdin, &WorkerRequest::shutdown());
            break;
        }
        match requests.recv_timeout(poll_interval) {
            Ok(request) => {
                if let Err(e) = write_line(&mut stdin, &request) {
                    log::warn!("{e}");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                let _ = write_line(&mut stdin, &WorkerRequest::shutdown());
                break;
            }
        }
    }
    log::debug!("Worker stdin pump exiting");
}

/// Forward the child's stdout lines to the pool until EOF.
fn read_responses(stdout: ChildStdout, responses: Sender<WorkerResponse>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("Worker stdout read error: {e}");
                break;
            }
        };
        match serde_json::from_str::<WorkerResponse>(&line) {
            Ok(response) => {
                if responses.send(response).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Failed to parse worker response: {e}"),
        }
    }
    log::debug!("Worker stdout reader exiting");
}
