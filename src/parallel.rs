//! Multi-clock coordination. A `GlobalClock` owns a master `LocalClock`
//! plus, once `fork`ed, one `ActiveClock` per worker. Workers dispatch on
//! their own OS thread — a worker is a genuine non-master thread, not a
//! task sharing the process's single dispatcher. The master drives both the
//! synchronization windows and its own schedule.
//!
//! The window protocol uses a plain blocking `std::sync::mpsc` pair per
//! worker: each worker thread is a synchronous CPU-bound loop (its own
//! dispatcher plus any processes affinitized to it), not an I/O-bound async
//! task, so there is nothing to `select!` against and no executor to enter.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::action::{Action, Predicate};
use crate::clock::{ClockId, InboxMsg, LocalClock, RunReport, TauHandle};
use crate::error::{ClockError, ClockException, ClockResult};
use crate::process::{next_process_id, ProcessBody};
use crate::rng::{derive_seed, ClockRng};
use crate::time::Time;

/// Thread affinity for routing: `0` is the master (`GlobalClock`'s own
/// `LocalClock`), `k > 0` addresses the `k`-th forked worker.
pub type ThreadId = usize;

/// How long `run` waits on a worker's `Done` before logging that it's
/// running late. Real (wall-clock) time, unrelated to virtual time — a
/// worker taking this long to finish one synchronization window usually
/// means its own Actions are doing real work, not a scheduling bug.
const WORKER_DONE_WARN_AFTER: Duration = Duration::from_millis(250);

struct ActiveClock {
    clock_id: ClockId,
    inbox: Sender<InboxMsg>,
    tau: TauHandle,
    /// `None` only after `Drop` has torn the channel down to unblock the
    /// worker's `recv()` loop before joining its thread.
    advance_tx: Option<Sender<Time>>,
    done_rx: Receiver<Result<RunReport, ClockException>>,
    thread: Option<JoinHandle<()>>,
}

impl ActiveClock {
    fn spawn(dt: Time, t0: Time) -> Self {
        let mut clock = LocalClock::new(dt, t0);
        let clock_id = clock.id();
        let inbox = clock.inbox();
        let tau = clock.tau_handle();
        let (advance_tx, advance_rx) = channel::<Time>();
        let (done_tx, done_rx) = channel::<Result<RunReport, ClockException>>();
        let thread = std::thread::Builder::new()
            .name(format!("clock-worker-{clock_id}"))
            .spawn(move || {
                while let Ok(t_target) = advance_rx.recv() {
                    let outcome = clock.run_until(t_target);
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn clock worker thread");
        Self {
            clock_id,
            inbox,
            tau,
            advance_tx: Some(advance_tx),
            done_rx,
            thread: Some(thread),
        }
    }

    fn advance(&self, t_target: Time) -> Result<(), std::sync::mpsc::SendError<Time>> {
        self.advance_tx
            .as_ref()
            .expect("worker already torn down")
            .send(t_target)
    }
}

impl Drop for ActiveClock {
    fn drop(&mut self) {
        // Drop the sender first so the worker's recv() loop unblocks before
        // we try to join its thread, or the join would hang forever.
        self.advance_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Owns the master clock and, once forked, its worker pool. Authoritative
/// for virtual time: `tau(global)` is always the master's `t`.
pub struct GlobalClock {
    master: LocalClock,
    workers: Vec<ActiveClock>,
}

impl GlobalClock {
    pub fn new(dt: Time, t0: Time) -> Self {
        Self {
            master: LocalClock::new(dt, t0),
            workers: Vec::new(),
        }
    }

    pub fn tau(&self) -> Time {
        self.master.tau()
    }

    pub fn tau_handle(&self, thread: ThreadId) -> ClockResult<TauHandle> {
        if thread == 0 {
            Ok(self.master.tau_handle())
        } else {
            Ok(self.worker(thread)?.tau.clone())
        }
    }

    pub fn is_idle(&self) -> bool {
        self.master.is_idle()
    }

    /// The RNG used to resolve `Resolve` scheduling arguments at the call
    /// site, regardless of which thread the event is ultimately affinitized
    /// to — a worker's own RNG (seeded via `seed_all`) is for draws made by
    /// Actions running on that worker, not for the timing argument of the
    /// call that schedules them.
    pub fn rng(&mut self) -> &mut ClockRng {
        self.master.rng()
    }

    pub fn resume(&mut self) {
        self.master.resume();
    }

    /// Resets the master clock. Any forked workers are torn down first: a
    /// soft reset of a still-running worker's schedule isn't a meaningful
    /// operation from here, since its `LocalClock` lives on its own thread.
    pub fn reset(&mut self, dt: Time, t0: Time, hard: bool) {
        self.collapse();
        self.master.reset(dt, t0, hard);
    }

    fn worker(&self, thread: ThreadId) -> ClockResult<&ActiveClock> {
        self.workers.get(thread - 1).ok_or(ClockError::ForeignClock)
    }

    /// Spawns `n` additional worker clocks, each with sample interval `dt`
    /// and starting at the master's current `t`.
    pub fn fork(&mut self, n: usize, dt: Time) {
        let t0 = self.master.tau();
        for _ in 0..n {
            self.workers.push(ActiveClock::spawn(dt, t0));
        }
    }

    /// Tears down every worker clock; in-flight windows must have already
    /// completed.
    pub fn collapse(&mut self) {
        self.workers.clear();
    }

    /// Routes a one-shot or repeating event to the clock at `thread`.
    /// `thread = 0` schedules directly against the master; `thread > 0`
    /// sends on the worker's inbox without blocking.
    pub fn schedule_event(
        &mut self,
        thread: ThreadId,
        action: Action,
        t_fire: Time,
        cycle: Time,
        n: u32,
    ) -> ClockResult<()> {
        if thread == 0 {
            self.master.schedule_event(action, t_fire, cycle, n)?;
            Ok(())
        } else {
            self.worker(thread)?
                .inbox
                .send(InboxMsg::ScheduleEvent {
                    action,
                    t_fire,
                    cycle,
                    n,
                })
                .map_err(|_| ClockError::Closed)
        }
    }

    pub fn schedule_condition(
        &mut self,
        thread: ThreadId,
        predicate: Predicate,
        action: Action,
    ) -> ClockResult<()> {
        if thread == 0 {
            self.master.schedule_condition(predicate, action);
            Ok(())
        } else {
            self.worker(thread)?
                .inbox
                .send(InboxMsg::ScheduleCondition { predicate, action })
                .map_err(|_| ClockError::Closed)
        }
    }

    pub fn schedule_sample(&mut self, thread: ThreadId, action: Action, dt: Time) -> ClockResult<()> {
        if thread == 0 {
            self.master.schedule_sample(action, dt);
            Ok(())
        } else {
            self.worker(thread)?
                .inbox
                .send(InboxMsg::ScheduleSample { action, dt })
                .map_err(|_| ClockError::Closed)
        }
    }

    /// `process(clk, body, cycles, thread)`. The master drives it
    /// synchronously to its first suspension before returning; a
    /// worker-affinitized process is handed to that worker's inbox and
    /// driven by its own thread at the start of its next dispatch pass.
    pub fn spawn_process(
        &mut self,
        thread: ThreadId,
        cycles: Option<u32>,
        body: Box<ProcessBody>,
    ) -> ClockResult<u64> {
        let id = next_process_id();
        if thread == 0 {
            self.master
                .spawn_process_local(id, cycles, body)
                .map_err(|_| ClockError::Closed)?;
        } else {
            self.worker(thread)?
                .inbox
                .send(InboxMsg::SpawnProcess { id, cycles, body })
                .map_err(|_| ClockError::Closed)?;
        }
        Ok(id)
    }

    /// Deterministically reseeds the master and every worker from one seed,
    /// using `rng::derive_seed` so the same seed always produces the same
    /// per-worker streams regardless of fork order.
    pub fn seed_all(&mut self, seed: u64) -> ClockResult<()> {
        self.master.rng().reseed(derive_seed(seed, 0));
        for (i, worker) in self.workers.iter().enumerate() {
            worker
                .inbox
                .send(InboxMsg::SeedRng(derive_seed(seed, i + 1)))
                .map_err(|_| ClockError::Closed)?;
        }
        Ok(())
    }

    /// Blocks for this window's `Done`, warning once (not failing) if the
    /// worker is still running after `WORKER_DONE_WARN_AFTER`.
    fn recv_done(
        worker: &ActiveClock,
        worker_number: usize,
        t: Time,
    ) -> Result<Result<RunReport, ClockException>, ClockException> {
        let mut warned = false;
        loop {
            match worker.done_rx.recv_timeout(WORKER_DONE_WARN_AFTER) {
                Ok(outcome) => return Ok(outcome),
                Err(RecvTimeoutError::Timeout) => {
                    if !warned {
                        warn!(worker = worker_number, "worker reporting Done later than expected for this window");
                        warned = true;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClockException::new(
                        t,
                        anyhow::anyhow!("worker {worker_number} disconnected mid-window"),
                    ))
                }
            }
        }
    }

    fn window(&self) -> Time {
        if self.master.schedule_dt() > 0.0 {
            self.master.schedule_dt()
        } else {
            crate::clock::DEFAULT_WINDOW
        }
    }

    /// Runs `duration` forward. With no forked workers this is exactly
    /// `LocalClock::run`; otherwise it subdivides `duration` into
    /// `Δt`-windows and runs a four-step protocol per window: broadcast
    /// `Advance`, let every clock (including the master) dispatch
    /// independently up to the target, collect every worker's `Done` (`warn`ing,
    /// not failing, if one is slow to report it), then begin the next window.
    pub fn run(&mut self, duration: Time) -> Result<RunReport, ClockException> {
        let t_end = self.master.tau() + duration;
        if self.workers.is_empty() {
            return self.master.run_until(t_end);
        }

        let mut events = 0u64;
        let mut samples = 0u64;
        let window = self.window();

        while self.master.tau() < t_end {
            let t_target = (self.master.tau() + window).min(t_end);

            for worker in &self.workers {
                worker.advance(t_target).map_err(|_| {
                    ClockException::new(self.master.tau(), anyhow::anyhow!("worker thread is gone"))
                })?;
            }

            let master_report = self.master.run_until(t_target)?;
            events += master_report.events;
            samples += master_report.samples;

            for (i, worker) in self.workers.iter().enumerate() {
                let outcome = Self::recv_done(worker, i + 1, self.master.tau())?;
                match outcome {
                    Ok(report) => {
                        events += report.events;
                        samples += report.samples;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(RunReport {
            events,
            samples,
            t: self.master.tau(),
        })
    }

    pub fn stop(&self) {
        self.master.stop();
        for worker in &self.workers {
            let _ = worker.inbox.send(InboxMsg::Stop);
        }
    }
}
