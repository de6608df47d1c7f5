//! Adaptive, bounded-concurrency send loop.
//!
//! One loop runs per direction (push, pull). Each cycle walks
//! `PENDING -> DEBOUNCE -> ADMIT -> PACE -> DISPATCH`: wait for a send
//! signal (or the watchdog), coalesce bursts, cap concurrent sends, pace by
//! outcome history, then dispatch on a worker thread. Failures re-enter the
//! cycle immediately and double the pacing delay; a success after failures
//! resets it and wakes any paced sleeper.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Floor (and initial value) of the adaptive delay.
const MIN_DELAY: Duration = Duration::from_millis(30);

/// Ceiling of the adaptive delay.
const MAX_DELAY: Duration = Duration::from_millis(60_000);

/// Sliding window of send outcomes used for pacing.
const WINDOW_SIZE: usize = 9;

/// Configuration for a [`ConnectionLoop`].
#[derive(Debug, Clone)]
pub struct ConnectionLoopConfig {
    /// Sleep after a send signal, absorbing bursts into one dispatch.
    pub debounce_delay: Duration,
    /// Dispatch spontaneously when no signal arrives for this long.
    /// `None` disables the watchdog.
    pub watchdog_timeout: Option<Duration>,
    /// Maximum concurrently outstanding sends.
    pub max_connections: u32,
}

impl Default for ConnectionLoopConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(10),
            watchdog_timeout: None,
            max_connections: 3,
        }
    }
}

/// Point-in-time counters, for tests and debugging.
#[derive(Debug, Clone)]
pub struct ConnectionLoopStats {
    /// Current adaptive delay.
    pub delay: Duration,
    /// Number of recorded outcomes (at most [`WINDOW_SIZE`]).
    pub window_len: usize,
    /// Sends currently outstanding.
    pub active: u32,
}

#[derive(Debug, Clone, Copy)]
struct SendRecord {
    duration: Duration,
    ok: bool,
}

#[derive(Debug)]
struct LoopState {
    pending: bool,
    closed: bool,
    active: u32,
    last_send: Option<Instant>,
    delay: Duration,
    window: VecDeque<SendRecord>,
    recovery_epoch: u64,
}

struct LoopShared {
    config: ConnectionLoopConfig,
    send: Box<dyn Fn() -> bool + Send + Sync>,
    state: Mutex<LoopState>,
    cond: Condvar,
}

/// A debounced, admission-controlled, adaptively paced send loop.
pub struct ConnectionLoop {
    shared: Arc<LoopShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLoop {
    /// Spawns the loop. `send` performs one attempt and reports success.
    pub fn new(config: ConnectionLoopConfig, send: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        let shared = Arc::new(LoopShared {
            config,
            send: Box::new(send),
            state: Mutex::new(LoopState {
                pending: false,
                closed: false,
                active: 0,
                last_send: None,
                delay: MIN_DELAY,
                window: VecDeque::new(),
                recovery_epoch: 0,
            }),
            cond: Condvar::new(),
        });

        let runner = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("replikv-connection-loop".into())
            .spawn(move || run_loop(&runner))
            .expect("failed to spawn connection loop");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Requests a send. Signals arriving during debounce are absorbed into
    /// the upcoming dispatch.
    pub fn send(&self) {
        let mut state = self.shared.state.lock();
        state.pending = true;
        self.shared.cond.notify_all();
    }

    /// Stops the loop. In-flight sends complete but their results are
    /// discarded.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Returns current pacing counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionLoopStats {
        let state = self.shared.state.lock();
        ConnectionLoopStats {
            delay: state.delay,
            window_len: state.window.len(),
            active: state.active,
        }
    }
}

impl Drop for ConnectionLoop {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_loop(shared: &Arc<LoopShared>) {
    loop {
        // PENDING: wait for a signal or the watchdog.
        {
            let mut state = shared.state.lock();
            loop {
                if state.closed {
                    return;
                }
                if state.pending {
                    break;
                }
                match shared.config.watchdog_timeout {
                    Some(timeout) => {
                        if shared.cond.wait_for(&mut state, timeout).timed_out() {
                            debug!("watchdog fired");
                            state.pending = true;
                        }
                    }
                    None => shared.cond.wait(&mut state),
                }
            }
            state.pending = false;
        }

        // DEBOUNCE: sleep unlocked; new signals set `pending` again and are
        // absorbed below.
        std::thread::sleep(shared.config.debounce_delay);

        {
            let mut state = shared.state.lock();
            state.pending = false;

            // ADMIT: wait for a connection slot.
            while state.active >= shared.config.max_connections && !state.closed {
                shared.cond.wait(&mut state);
            }
            if state.closed {
                return;
            }

            // PACE: only while connections are outstanding or the last
            // attempt failed; a recovery signal or close breaks the sleep.
            let delay = compute_delay(&mut state, shared.config.max_connections);
            let last_failed = state.window.back().is_some_and(|r| !r.ok);
            if state.active > 0 || last_failed {
                if let Some(last_send) = state.last_send {
                    let epoch = state.recovery_epoch;
                    loop {
                        if state.closed || state.recovery_epoch != epoch {
                            break;
                        }
                        let elapsed = last_send.elapsed();
                        if elapsed >= delay {
                            break;
                        }
                        let _ = shared.cond.wait_for(&mut state, delay - elapsed);
                    }
                    if state.closed {
                        return;
                    }
                }
            }

            // DISPATCH bookkeeping under the lock; the send itself runs on a
            // worker thread.
            state.active += 1;
            state.last_send = Some(Instant::now());
        }

        let worker = Arc::clone(shared);
        let _ = std::thread::Builder::new()
            .name("replikv-send".into())
            .spawn(move || {
                let start = Instant::now();
                let ok = (worker.send)();
                let duration = start.elapsed();

                let mut state = worker.state.lock();
                let prev_failed = state.window.back().is_some_and(|r| !r.ok);
                state.window.push_back(SendRecord { duration, ok });
                while state.window.len() > WINDOW_SIZE {
                    state.window.pop_front();
                }
                state.active -= 1;
                if !ok {
                    // Failed attempts retry through a fresh cycle.
                    state.pending = true;
                } else if prev_failed {
                    // Recovery: wake a paced sleeper immediately.
                    state.recovery_epoch += 1;
                }
                worker.cond.notify_all();
            });
    }
}

/// Adaptive delay from the outcome window; also stores it on the state so
/// failure doubling compounds across cycles.
fn compute_delay(state: &mut LoopState, max_connections: u32) -> Duration {
    let delay = match state.window.back().copied() {
        None => MIN_DELAY,
        Some(last) if !last.ok => (state.delay * 2).min(MAX_DELAY),
        Some(last) if state.window.len() == 1 => last.duration / max_connections,
        Some(_) => {
            let prev = state.window[state.window.len() - 2];
            if !prev.ok {
                // Recovered: back to the floor.
                MIN_DELAY
            } else {
                let mut durations: Vec<Duration> = state
                    .window
                    .iter()
                    .filter(|r| r.ok)
                    .map(|r| r.duration)
                    .collect();
                durations.sort();
                durations[durations.len() / 2] / max_connections
            }
        }
    };
    state.delay = delay;
    delay
}
