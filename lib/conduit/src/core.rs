use crate::mgmt::RouterTables;
use std::sync::mpsc;
use std::thread;
use weft::logging::{self, Logger};

type CoreJob = Box<dyn FnOnce(&mut RouterTables) + Send>;

enum CoreAction {
    Execute(CoreJob),
    Stop,
}

/// Handle for enqueueing work onto the core thread. Clone freely; actions
/// are executed strictly in enqueue order.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreAction>,
}

impl CoreHandle {
    /// Enqueue a job against the router tables.
    pub fn execute<F: FnOnce(&mut RouterTables) + Send + 'static>(&self, job: F) {
        self.tx
            .send(CoreAction::Execute(Box::new(job)))
            .expect("Core thread is gone");
    }

    /// Enqueue a job and block until its result comes back. This is how
    /// other threads read or mutate routing-level state: the core thread is
    /// its single writer.
    pub fn call<R: Send + 'static, F: FnOnce(&mut RouterTables) -> R + Send + 'static>(&self, job: F) -> R {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.execute(move |tables| {
            let result = job(tables);
            drop(reply_tx.send(result));
        });

        reply_rx.recv().expect("Core thread dropped the reply")
    }

    /// Stop the core thread after the actions already queued.
    pub fn stop(&self) {
        drop(self.tx.send(CoreAction::Stop));
    }
}

/// The dedicated thread owning the router's address, connection and link
/// tables. All mutation arrives through the action queue; there is no
/// other writer.
pub struct Core {
    tables: RouterTables,
    rx: mpsc::Receiver<CoreAction>,
    log: Logger,
}

impl Core {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> (Core, CoreHandle) {
        let (tx, rx) = mpsc::channel();

        (
            Core {
                tables: RouterTables::new(),
                rx,
                log: logging::component(log.into(), "core"),
            },
            CoreHandle { tx },
        )
    }

    /// Drain the action queue until stopped.
    pub fn run(mut self) {
        logging::debug!(self.log, "core thread running"; "context" => "run");

        while let Ok(action) = self.rx.recv() {
            match action {
                CoreAction::Execute(job) => job(&mut self.tables),
                CoreAction::Stop => break,
            }
        }

        logging::debug!(self.log, "core thread stopped"; "context" => "run");
    }

    /// Spawn the core on its own thread.
    pub fn spawn<'a, L: Into<Option<&'a Logger>>>(log: L) -> (thread::JoinHandle<()>, CoreHandle) {
        let (core, handle) = Core::new(log);

        let joiner = thread::Builder::new()
            .name("router-core".to_string())
            .spawn(move || core.run())
            .expect("Error spawning the core thread");

        (joiner, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_run_in_order() {
        let (joiner, handle) = Core::spawn(None);

        for index in 0..10u64 {
            handle.execute(move |tables| {
                tables.configs_mut().insert(
                    format!("k{}", index),
                    crate::mgmt::ConfigRecord {
                        name: format!("k{}", index),
                        value: index.to_string(),
                    },
                );
            });
        }

        let count = handle.call(|tables| tables.configs_mut().len());
        assert_eq!(count, 10);

        // Insertion order is preserved by the table walk.
        let first = handle.call(|tables| {
            tables
                .configs_mut()
                .get_index(0)
                .map(|(key, _)| key.clone())
                .unwrap()
        });
        assert_eq!(first, "k0");

        handle.stop();
        joiner.join().expect("Core thread paniced");
    }

    #[test]
    fn test_call_returns_value() {
        let (joiner, handle) = Core::spawn(None);

        let answer = handle.call(|_| 42);
        assert_eq!(answer, 42);

        handle.stop();
        joiner.join().expect("Core thread paniced");
    }
}
