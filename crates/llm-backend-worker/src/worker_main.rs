//! Worker process entry point.
//!
//! Runs as a child process spawned by the process strategy. Reads JSON
//! commands from stdin, runs the model, and writes JSON responses to stdout.
//! All log output must go to stderr (inherited by parent).
//!
//! Thread design:
//! - Thread 0 (stdin reader): parses lines → request channel
//! - Thread 1 (worker unit): the regular unit loop over that channel
//! - Main thread: drains the response channel → stdout

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use llm_backend_types::{WorkerCommand, WorkerRequest, WorkerResponse};

use crate::model::{ModelLoader, ModelRegistry};
use crate::signal::ShutdownSignal;
use crate::unit::{UnitChannels, WorkerUnit};

/// Run the worker process with the built-in model registry.
pub fn run_worker() -> io::Result<()> {
    run_worker_with(Arc::new(ModelRegistry::builtin()))
}

/// Run the worker process with a custom loader.
pub fn run_worker_with(loader: Arc<dyn ModelLoader>) -> io::Result<()> {
    log::info!("Starting model worker process (pid={})", std::process::id());

    let (request_tx, request_rx): (Sender<WorkerRequest>, Receiver<WorkerRequest>) =
        crossbeam_channel::unbounded();
    let (response_tx, response_rx): (Sender<WorkerResponse>, Receiver<WorkerResponse>) =
        crossbeam_channel::unbounded();

    // Thread 0: stdin reader
    thread::Builder::new()
        .name("worker-stdin".to_string())
        .spawn(move || read_stdin(request_tx))?;

    // The first command must carry the config.
    let config = match request_rx.recv() {
        Ok(WorkerRequest {
            command: WorkerCommand::Load { config },
            ..
        }) => config,
        Ok(other) => {
            log::error!("Expected Load as first command, got {:?}", other.command);
            return Ok(());
        }
        Err(_) => {
            log::warn!("Stdin closed before Load command");
            return Ok(());
        }
    };

    let unit = WorkerUnit::new(
        format!("pid-{}", std::process::id()),
        config,
        loader,
        UnitChannels {
            requests: request_rx,
            responses: response_tx,
        },
        ShutdownSignal::new(),
    );

    // Thread 1: unit loop. Drops its response sender on exit, which ends
    // the drain below.
    let unit_thread = thread::Builder::new()
        .name("worker-unit".to_string())
        .spawn(move || unit.run())?;

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    for response in response_rx {
        write_response(&mut stdout, &response)?;
    }

    if unit_thread.join().is_err() {
        log::error!("Worker unit thread panicked");
    }
    log::info!("Worker process exiting");
    Ok(())
}

fn read_stdin(request_tx: Sender<WorkerRequest>) {
    let stdin = io::stdin();
    let reader = stdin.lock();
    for line in reader.lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,   // Empty line, skip
            Err(_) => break,     // stdin closed (parent died)
        };
        match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => {
                if request_tx.send(request).is_err() {
                    break; // Unit exited
                }
            }
            Err(e) => log::warn!("Failed to parse command: {e}"),
        }
    }
    log::debug!("Stdin reader thread exiting");
}

fn write_response(out: &mut impl Write, response: &WorkerResponse) -> io::Result<()> {
    let json = serde_json::to_string(response).map_err(io::Error::other)?;
    writeln!(out, "{json}")?;
    out.flush()
}
