//! Machine operation queue: closures run against engine state between ticks.
//!
//! Edits coming from the network or the host never touch sequencer state
//! directly. They are queued here and the engine thread drains the queue
//! before each buffer, so no edit lands halfway through a tick.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};

use groovebox_types::EngineError;

pub type Operation<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Submitting side. Cheap to clone.
pub struct OperationSender<T> {
    tx: Sender<Operation<T>>,
}

impl<T> Clone for OperationSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: 'static> OperationSender<T> {
    /// Queue `op` without waiting for it.
    pub fn submit<F>(&self, op: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.tx
            .send(Box::new(op))
            .map_err(|_| EngineError::EngineStopped)
    }

    /// Queue `op` and block until the engine has run it.
    ///
    /// Must not be called from the engine thread itself.
    pub fn run_sync<F, R>(&self, op: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        self.submit(move |target| {
            let _ = done_tx.send(op(target));
        })?;
        done_rx.recv().map_err(|_| EngineError::EngineStopped)
    }
}

/// Draining side, owned by the engine.
pub struct OperationQueue<T> {
    rx: Receiver<Operation<T>>,
}

impl<T> OperationQueue<T> {
    pub fn new() -> (OperationSender<T>, OperationQueue<T>) {
        let (tx, rx) = unbounded();
        (OperationSender { tx }, OperationQueue { rx })
    }

    /// Run every queued operation. Returns how many ran, or None once
    /// all senders are gone and the queue is empty.
    pub fn drain(&self, target: &mut T) -> Option<usize> {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(op) => {
                    op(target);
                    ran += 1;
                }
                Err(TryRecvError::Empty) => return Some(ran),
                Err(TryRecvError::Disconnected) => return (ran > 0).then_some(ran),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn operations_run_in_order_on_drain() {
        let (tx, queue) = OperationQueue::<Vec<u32>>::new();
        tx.submit(|v| v.push(1)).unwrap();
        tx.submit(|v| v.push(2)).unwrap();
        let mut target = Vec::new();
        assert_eq!(queue.drain(&mut target), Some(2));
        assert_eq!(target, vec![1, 2]);
        assert_eq!(queue.drain(&mut target), Some(0));
    }

    #[test]
    fn run_sync_waits_for_the_result() {
        let (tx, queue) = OperationQueue::<u32>::new();
        let waiter = thread::spawn(move || tx.run_sync(|n| {
            *n += 5;
            *n
        }));
        let mut n = 10;
        while queue.drain(&mut n) == Some(0) {
            thread::yield_now();
        }
        assert_eq!(waiter.join().unwrap(), Ok(15));
    }

    #[test]
    fn dropped_queue_stops_senders() {
        let (tx, queue) = OperationQueue::<u32>::new();
        drop(queue);
        assert_eq!(tx.submit(|_| {}), Err(EngineError::EngineStopped));
        assert_eq!(tx.run_sync(|n| *n), Err(EngineError::EngineStopped));
    }
}
