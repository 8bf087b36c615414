//! Single-threaded execution domain.
//!
//! A `ContextThread<S>` owns a state value `S` on a dedicated thread and runs
//! queued tasks against it one at a time. Other threads reach the state only
//! through a `ContextHandle`, either fire-and-forget (`post`) or blocking for
//! a typed result (`invoke`). Blocking calls made from the context thread
//! itself run inline against the state of the task that is executing.

use std::cell::Cell;
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info};

use crate::error::ContextError;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

thread_local! {
    /// State of the context task running on this thread, null between tasks.
    static RUNNING: Cell<*mut ()> = const { Cell::new(std::ptr::null_mut()) };
}

/// Publishes the state pointer for the duration of one task.
struct Running {
    previous: *mut (),
}

impl Running {
    fn enter(state: *mut ()) -> Self {
        Self {
            previous: RUNNING.with(|r| r.replace(state)),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        RUNNING.with(|r| r.set(self.previous));
    }
}

enum Job<S> {
    Run(Task<S>),
    Stop,
}

/// Cloneable submitter of work to a context thread.
pub struct ContextHandle<S> {
    tx: Sender<Job<S>>,
    thread: Arc<OnceLock<ThreadId>>,
}

impl<S> Clone for ContextHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread: Arc::clone(&self.thread),
        }
    }
}

impl<S: 'static> ContextHandle<S> {
    /// True when called from the context thread itself.
    pub fn is_context_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    /// Queue `f` to run on the context thread.
    pub fn post<F>(&self, f: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Job::Run(Box::new(f)))
            .map_err(|_| ContextError::Stopped)
    }

    /// Queue `f`, optionally blocking until it has run. A synchronous call
    /// from the context thread runs `f` inline before returning.
    pub fn post_action<F>(&self, f: F, synchronous: bool) -> Result<(), ContextError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if !synchronous {
            return self.post(f);
        }
        if self.is_context_thread() && running_state::<S>().is_none() {
            // Still building the state: nothing to run against yet.
            debug!(target: "net::context", "synchronous post during context start queued");
            return self.post(f);
        }
        self.invoke(f)
    }

    /// Run `f` on the context thread and wait for its result. From the
    /// context thread itself `f` runs inline.
    pub fn invoke<F, R>(&self, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_context_thread() {
            let state = running_state::<S>().ok_or(ContextError::Reentrant)?;
            // SAFETY: `state` points at the state owned by `run` on this
            // thread, published only while a task executes. The inline call
            // finishes before control returns to that task, and no other
            // thread ever dereferences it.
            return Ok(f(unsafe { &mut *state }));
        }
        let (done_tx, done_rx) = bounded(1);
        self.post(move |state| {
            let _ = done_tx.send(f(state));
        })?;
        done_rx.recv().map_err(|_| ContextError::Stopped)
    }

    /// Ask the context thread to exit after the tasks already queued.
    pub fn stop(&self) {
        let _ = self.tx.send(Job::Stop);
    }
}

/// Owner of a context thread. Dropping it stops and joins the thread.
pub struct ContextThread<S: 'static> {
    handle: ContextHandle<S>,
    join: Option<JoinHandle<()>>,
}

impl<S: 'static> ContextThread<S> {
    /// Spawn a context thread whose state is built on that thread by `make`.
    pub fn spawn<F>(name: &str, make: F) -> io::Result<Self>
    where
        F: FnOnce(ContextHandle<S>) -> S + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let handle = ContextHandle {
            tx,
            thread: Arc::new(OnceLock::new()),
        };
        let inner = handle.clone();
        let label = name.to_string();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = inner.thread.set(thread::current().id());
                let state = make(inner);
                run(state, rx);
                debug!(target: "net::context", "context {} exited", label);
            })?;
        info!(target: "net::context", "context {} started", name);
        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> ContextHandle<S> {
        self.handle.clone()
    }

    /// Stop the thread and wait for it to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.stop();
        if let Some(join) = self.join.take() {
            if thread::current().id() != join.thread().id() {
                let _ = join.join();
            }
        }
    }
}

impl<S: 'static> Drop for ContextThread<S> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn running_state<S>() -> Option<*mut S> {
    let state = RUNNING.with(|r| r.get()) as *mut S;
    (!state.is_null()).then_some(state)
}

fn run<S>(mut state: S, rx: Receiver<Job<S>>) {
    let state: *mut S = &mut state;
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run(task) => {
                let _running = Running::enter(state as *mut ());
                // SAFETY: `state` outlives the loop and is only reached from
                // this thread; inline calls nest strictly inside this task.
                task(unsafe { &mut *state });
            }
            Job::Stop => break,
        }
    }
}
