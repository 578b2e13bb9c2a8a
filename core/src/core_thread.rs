// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Single worker-thread execution model.
//!
//! Every target-side call — RPC dispatch, code upload, memory
//! read/write — is serialised onto one dedicated OS thread that
//! attached to the target's Mono runtime during lifecycle init. Mirrors `audioipc::core::spawn_thread`/`CoreThread`/
//! `Remote`'s naming and shape, but without the tokio reactor
//! underneath: this engine has no async socket IO to drive, only
//! synchronous backend calls, so jobs are plain closures run on a
//! blocking `std::thread` and results come back over `mpsc` rather
//! than futures.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::errors::{Result, ResultExt};

type Job = Box<dyn FnOnce() + Send>;

/// Owns the worker thread's `JoinHandle` and a channel to post jobs to
/// it. Dropping this joins the thread after asking it to exit.
pub struct CoreThread {
    join_handle: Option<JoinHandle<()>>,
    sender: mpsc::Sender<Job>,
}

/// A cheaply cloneable handle used to post work onto a [`CoreThread`]
/// from any thread, matching `audioipc::core::Remote`'s role.
#[derive(Clone)]
pub struct Remote {
    sender: mpsc::Sender<Job>,
}

/// Start a new worker thread named `name`, running `init` on it before
/// the thread begins accepting jobs. `init`'s result is propagated back
/// to the caller synchronously, so a failed attach never leaves a
/// thread running.
pub fn spawn_thread<F>(name: &str, init: F) -> Result<CoreThread>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let (job_tx, job_rx) = mpsc::channel::<Job>();
    let (ready_tx, ready_rx) = mpsc::channel();

    let join_handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let init_result = init();
            let started_ok = init_result.is_ok();
            if ready_tx.send(init_result).is_err() || !started_ok {
                return;
            }
            for job in job_rx {
                job();
            }
        })
        .chain_err(|| "failed to spawn worker thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(CoreThread {
            join_handle: Some(join_handle),
            sender: job_tx,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("worker thread terminated before completing init".into()),
    }
}

impl CoreThread {
    pub fn remote(&self) -> Remote {
        Remote {
            sender: self.sender.clone(),
        }
    }
}

impl Drop for CoreThread {
    fn drop(&mut self) {
        // Dropping `sender` closes the job channel, ending the
        // thread's `for job in job_rx` loop.
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Remote {
    /// Post `job` to run on the worker thread; does not wait for it.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The only way this can fail is if the worker thread already
        // exited, which only happens during/after `Runtime::detach`;
        // silently dropping the job matches `CoreThread`'s teardown
        // discipline of never panicking in that window.
        let _ = self.sender.send(Box::new(job));
    }

    /// Run `f` on the worker thread and block the caller until it
    /// completes, returning its result. This is the primitive every
    /// [`crate::backend::Backend::rpc_call`] invocation goes through.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.spawn(move || {
            let _ = tx.send(f());
        });
        rx.recv()
            .chain_err(|| "worker thread terminated before returning a result")
    }
}
