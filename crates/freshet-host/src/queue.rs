//! Software execution queues.
//!
//! Each queue owns one worker thread draining a FIFO, so commands retire in
//! submission order exactly as a hardware queue would. Completion signals
//! are condvar-backed and resolve a timestamp from the platform clock when
//! the command retires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use freshet_core::accel::{CommandQueue, CompletionSignal, WaitMode};
use freshet_core::error::{FreshetError, Result};

/// Monotonic clock shared by queues and signals.
pub(crate) struct HostClock {
    epoch: Instant,
}

impl HostClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
        })
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Condvar-backed completion signal.
pub struct HostSignal {
    state: Mutex<(bool, Option<u64>)>,
    cv: Condvar,
}

impl HostSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((false, None)),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, ts: u64) {
        let mut state = self.state.lock();
        state.0 = true;
        state.1 = Some(ts);
        self.cv.notify_all();
    }
}

impl CompletionSignal for HostSignal {
    fn is_complete(&self) -> bool {
        self.state.lock().0
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.0 {
            self.cv.wait(&mut state);
        }
    }

    fn timestamp(&self) -> Option<u64> {
        self.state.lock().1
    }
}

enum Command {
    Task {
        label: String,
        run: Box<dyn FnOnce() + Send>,
    },
    Copy {
        dst: usize,
        src: usize,
        len: usize,
    },
    Marker,
    WaitSignal(Arc<dyn CompletionSignal>),
}

struct QueueState {
    pending: VecDeque<(Command, Arc<HostSignal>)>,
    busy: bool,
    shutdown: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    clock: Arc<HostClock>,
}

impl QueueShared {
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && !state.busy
    }
}

/// An ordered execution queue over one worker thread.
///
/// Dropping the queue drains everything already submitted, then stops the
/// worker.
pub struct HostQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    pub(crate) fn spawn(agent_index: usize, clock: Arc<HostClock>) -> Result<Arc<Self>> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                busy: false,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            clock,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("freshet-queue-{agent_index}"))
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| FreshetError::OutOfResources(format!("queue worker thread: {e}")))?;

        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn push(&self, command: Command) -> Result<Arc<dyn CompletionSignal>> {
        let signal = HostSignal::new();
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(FreshetError::Accelerator("queue is shut down".to_string()));
        }
        state.pending.push_back((command, Arc::clone(&signal)));
        self.shared.work_cv.notify_one();
        Ok(signal)
    }
}

impl CommandQueue for HostQueue {
    fn enqueue_task(
        &self,
        label: &str,
        task: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<dyn CompletionSignal>> {
        self.push(Command::Task {
            label: label.to_string(),
            run: task,
        })
    }

    fn enqueue_copy(&self, dst: usize, src: usize, len: usize) -> Result<Arc<dyn CompletionSignal>> {
        self.push(Command::Copy { dst, src, len })
    }

    fn enqueue_marker(&self) -> Result<Arc<dyn CompletionSignal>> {
        self.push(Command::Marker)
    }

    fn enqueue_wait(&self, signal: Arc<dyn CompletionSignal>) -> Result<Arc<dyn CompletionSignal>> {
        self.push(Command::WaitSignal(signal))
    }

    fn is_idle(&self) -> Result<bool> {
        Ok(self.shared.is_idle())
    }

    fn wait_idle(&self, mode: WaitMode) -> Result<()> {
        match mode {
            WaitMode::Auto => {
                let mut state = self.shared.state.lock();
                while !(state.pending.is_empty() && !state.busy) {
                    self.shared.idle_cv.wait(&mut state);
                }
            }
            WaitMode::Spin => {
                while !self.shared.is_idle() {
                    std::hint::spin_loop();
                }
            }
            WaitMode::Yield => {
                while !self.shared.is_idle() {
                    std::thread::yield_now();
                }
            }
        }
        Ok(())
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_cv.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<QueueShared>) {
    debug!(target: "freshet::sync", "queue worker started");
    loop {
        let (command, signal) = {
            let mut state = shared.state.lock();
            loop {
                if let Some(entry) = state.pending.pop_front() {
                    state.busy = true;
                    break entry;
                }
                if state.shutdown {
                    debug!(target: "freshet::sync", "queue worker stopping");
                    return;
                }
                shared.work_cv.wait(&mut state);
            }
        };

        match command {
            Command::Task { label, run } => {
                trace!(target: "freshet::sync", %label, "task executing");
                run();
            }
            Command::Copy { dst, src, len } => {
                trace!(target: "freshet::copy", len, "copy executing");
                // Safety: addresses come from live runtime allocations; the
                // submission contract is that the ranges stay valid until
                // the command retires. copy (not copy_nonoverlapping)
                // tolerates overlap.
                unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
            }
            Command::Marker => {}
            Command::WaitSignal(dep) => dep.wait(),
        }

        signal.complete(shared.clock.now_ns());
        let mut state = shared.state.lock();
        state.busy = false;
        if state.pending.is_empty() {
            shared.idle_cv.notify_all();
        }
    }
}
