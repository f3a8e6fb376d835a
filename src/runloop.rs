use crate::utils::{CancelToken, HealthFlag};
use anyhow::{anyhow, Result};
use crossbeam::channel as cbchan;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::hint::spin_loop;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default bound on how long `RunLoop::spawn` waits for the loop thread
/// to build its state and report ready.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// A unit of work executed on the loop thread with exclusive access to
/// the loop state.
pub type Task<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum LoopCmd<S> {
    Task(Task<S>),
    Delayed(Instant, Task<S>),
    Stop,
}

/// Cheap clonable handle to a [`RunLoop`].
///
/// All cross-thread interaction with a loop's state goes through
/// posted tasks; the state itself never leaves its thread.
pub struct LoopHandle<S> {
    tx: cbchan::Sender<LoopCmd<S>>,
    alive: HealthFlag,
    cancel: CancelToken,
    name: String,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            alive: self.alive.clone(),
            cancel: self.cancel.clone(),
            name: self.name.clone(),
        }
    }
}

impl<S: 'static> LoopHandle<S> {
    /// Queue a task at the tail of the loop. Returns false if the loop
    /// is gone.
    pub fn post(&self, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx.send(LoopCmd::Task(Box::new(f))).is_ok()
    }

    /// Queue a task to run no earlier than `after` from now.
    pub fn post_delayed(&self, after: Duration, f: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.tx
            .send(LoopCmd::Delayed(Instant::now() + after, Box::new(f)))
            .is_ok()
    }

    /// Ask the loop to exit after the tasks already queued.
    pub fn stop(&self) {
        let _ = self.tx.send(LoopCmd::Stop);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get_acquire()
    }

    /// Token cancelled when the loop exits; workers serving this loop
    /// take children of it.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct DelayedTask<S> {
    at: Instant,
    seq: u64,
    task: Task<S>,
}

impl<S> PartialEq for DelayedTask<S> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<S> Eq for DelayedTask<S> {}

impl<S> PartialOrd for DelayedTask<S> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for DelayedTask<S> {
    // Inverted so the BinaryHeap pops the earliest deadline first;
    // seq breaks ties in submission order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Dedicated thread owning a state `S` and executing posted tasks
/// against it.
///
/// The state is built ON the loop thread by the factory, so `S` does
/// not need to be `Send`. `spawn` blocks until the factory finishes
/// (bounded by the handshake timeout) and fails if it errors.
pub struct RunLoop<S> {
    handle: LoopHandle<S>,
    join: Option<JoinHandle<()>>,
}

impl<S: 'static> RunLoop<S> {
    pub fn spawn<F>(name: &str, parent_cancel: Option<&CancelToken>, factory: F) -> Result<Self>
    where
        F: FnOnce(LoopHandle<S>) -> Result<S> + Send + 'static,
    {
        Self::spawn_with_timeout(
            name,
            parent_cancel,
            Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            factory,
        )
    }

    pub fn spawn_with_timeout<F>(
        name: &str,
        parent_cancel: Option<&CancelToken>,
        handshake_timeout: Duration,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(LoopHandle<S>) -> Result<S> + Send + 'static,
    {
        let cancel = match parent_cancel {
            Some(parent) => parent.new_child(),
            None => CancelToken::new_root(),
        };
        let alive = HealthFlag::new(false);
        let (tx, rx) = cbchan::unbounded::<LoopCmd<S>>();
        let (ready_tx, ready_rx) = cbchan::bounded::<Result<()>>(1);

        let handle = LoopHandle {
            tx,
            alive: alive.clone(),
            cancel: cancel.clone(),
            name: name.to_string(),
        };

        let join: JoinHandle<()>;
        {
            let handle = handle.clone();
            let alive = alive.clone();
            let cancel = cancel.clone();
            let thread_name = name.to_string();

            join = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let mut state = match factory(handle) {
                        Ok(state) => {
                            alive.set_release(true);
                            let _ = ready_tx.send(Ok(()));
                            state
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    run_loop_body(&mut state, &rx, &cancel);

                    alive.set_release(false);
                    // Reader threads and connect workers hold children
                    // of this token; the loop's exit takes them down.
                    cancel.cancel();
                    drop(state);
                })
                .map_err(|e| anyhow!("failed to spawn loop thread '{name}': {e}"))?;
        }

        match ready_rx.recv_timeout(handshake_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e.context(format!("loop '{name}' failed to start")));
            }
            Err(_) => {
                cancel.cancel();
                return Err(anyhow!(
                    "loop '{name}' did not become ready within {handshake_timeout:?}"
                ));
            }
        }

        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> &LoopHandle<S> {
        &self.handle
    }

    pub fn clone_handle(&self) -> LoopHandle<S> {
        self.handle.clone()
    }

    /// Block until the loop thread exits on its own.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Request stop and reclaim the thread.
    pub fn stop_and_join(mut self) {
        self.handle.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<S> Drop for RunLoop<S> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(LoopCmd::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_loop_body<S>(state: &mut S, rx: &cbchan::Receiver<LoopCmd<S>>, cancel: &CancelToken) {
    let mut timers: BinaryHeap<DelayedTask<S>> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut idle: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let now = Instant::now();
        let mut timer_fired = false;
        loop {
            let due = matches!(timers.peek(), Some(t) if t.at <= now);
            if !due {
                break;
            }
            if let Some(t) = timers.pop() {
                (t.task)(state);
                timer_fired = true;
            }
        }
        if timer_fired {
            idle = 0;
            continue;
        }

        match rx.try_recv() {
            Ok(LoopCmd::Task(task)) => {
                task(state);
                idle = 0;
            }
            Ok(LoopCmd::Delayed(at, task)) => {
                seq += 1;
                timers.push(DelayedTask { at, seq, task });
                idle = 0;
            }
            Ok(LoopCmd::Stop) => break,
            Err(cbchan::TryRecvError::Empty) => {
                idle = idle.saturating_add(1);
                if idle < 64 {
                    spin_loop();
                } else if idle < 256 {
                    thread::yield_now();
                } else {
                    // Park briefly, but never past the next deadline.
                    let nap = match timers.peek() {
                        Some(t) => t
                            .at
                            .saturating_duration_since(Instant::now())
                            .min(Duration::from_millis(1)),
                        None => Duration::from_millis(1),
                    };
                    if !nap.is_zero() {
                        thread::sleep(nap.max(Duration::from_micros(2)));
                    }
                }
            }
            Err(cbchan::TryRecvError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::base::{BaseRx, BaseTx};
    use crate::io::mpmc::MpmcChannel;

    struct Counter {
        hits: u64,
    }

    #[test]
    fn posts_run_in_order() {
        let (tx, mut rx) = MpmcChannel::bounded::<u64>(16);
        let rl = RunLoop::spawn("test-order", None, |_| Ok(Counter { hits: 0 })).unwrap();

        for _ in 0..3 {
            let mut tx = tx.clone();
            rl.handle().post(move |c: &mut Counter| {
                c.hits += 1;
                let _ = tx.try_send(c.hits);
            });
        }

        let cancel = CancelToken::new_root();
        let t = Some(Duration::from_secs(2));
        assert_eq!(rx.recv(&cancel, t).unwrap(), 1);
        assert_eq!(rx.recv(&cancel, t).unwrap(), 2);
        assert_eq!(rx.recv(&cancel, t).unwrap(), 3);
        rl.stop_and_join();
    }

    #[test]
    fn delayed_tasks_fire_by_deadline() {
        let (tx, mut rx) = MpmcChannel::bounded::<&'static str>(16);
        let rl = RunLoop::spawn("test-delayed", None, |_| Ok(())).unwrap();

        {
            let mut tx_late = tx.clone();
            let mut tx_soon = tx.clone();
            rl.handle().post_delayed(Duration::from_millis(80), move |_| {
                let _ = tx_late.try_send("late");
            });
            rl.handle().post_delayed(Duration::from_millis(10), move |_| {
                let _ = tx_soon.try_send("soon");
            });
        }

        let cancel = CancelToken::new_root();
        let t = Some(Duration::from_secs(2));
        assert_eq!(rx.recv(&cancel, t).unwrap(), "soon");
        assert_eq!(rx.recv(&cancel, t).unwrap(), "late");
        rl.stop_and_join();
    }

    #[test]
    fn factory_error_fails_spawn() {
        let res: Result<RunLoop<()>> =
            RunLoop::spawn("test-bad-factory", None, |_| Err(anyhow!("nope")));
        assert!(res.is_err());
    }

    #[test]
    fn loop_exit_cancels_children() {
        let rl = RunLoop::spawn("test-cancel", None, |_| Ok(())).unwrap();
        let child = rl.handle().cancel_token().new_child();
        assert!(!child.is_cancelled());
        rl.stop_and_join();
        assert!(child.is_cancelled());
    }
}
