//! `LocalClock`: the core scheduler and its dispatcher.
//!
//! The dispatcher is a synchronous hot loop: at each decision point it
//! precomputes the next candidate time from each of the three sources
//! (events, the periodic/condition tick, and — via the inbox — cross-thread
//! requests) and advances to whichever is earliest. There are three sources
//! to race, and racing them is a synchronous min-of-three rather than a
//! `tokio::select!`, since nothing here actually blocks on I/O. Released
//! process coroutines are driven in-line by the very same loop, immediately
//! after the release action that woke them fires — see `drive_process`
//! below.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tracing::debug;

use crate::action::{Action, Predicate, SymbolTable};
use crate::error::{ClockError, ClockException, ClockResult};
use crate::process::{noop_waker, PendingRequest, ProcessBody, ProcessContext};
use crate::rng::ClockRng;
use crate::schedule::{ConditionId, EventId, Schedule};
use crate::time::{next_tick, Time};

/// When conditions exist and the clock's own `Δt` is `0`, the auto-installed
/// poll cadence is `max(t_end - t, ε) / K` for this `K`.
pub const DEFAULT_CONDITION_POLL_DIVISOR: u32 = 1000;

/// The synchronization window used when a forked clock's own `Δt` is `0`.
pub const DEFAULT_WINDOW: Time = 1.0;

static NEXT_CLOCK_ID: AtomicU64 = AtomicU64::new(1);

pub type ClockId = u64;

pub fn next_clock_id() -> ClockId {
    NEXT_CLOCK_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A read-only, cheaply cloneable view onto a clock's current `t`, shared
/// with its processes so `tau(clk)` can be read without going through the
/// inbox. Updated only by the owning clock's dispatcher, after it has
/// actually advanced — a process never observes `tau` ahead of the clock it
/// belongs to.
#[derive(Clone)]
pub struct TauHandle(Arc<AtomicU64>);

impl TauHandle {
    pub(crate) fn from_time(t: Time) -> Self {
        Self(Arc::new(AtomicU64::new(t.to_bits())))
    }

    pub fn get(&self) -> Time {
        Time::from_bits(self.0.load(AtomicOrdering::Acquire))
    }
}

/// Requests funneled through a clock's inbox: cross-thread scheduling calls
/// and process spawns routed by thread affinity, and (for worker clocks) a
/// reseed from `seed_all`.
pub enum InboxMsg {
    ScheduleEvent {
        action: Action,
        t_fire: Time,
        cycle: Time,
        n: u32,
    },
    ScheduleCondition {
        predicate: Predicate,
        action: Action,
    },
    ScheduleSample {
        action: Action,
        dt: Time,
    },
    /// `process(clk, body, cycles, thread)` affinitized to this clock from
    /// another thread; `id` is pre-allocated by the caller so it can be
    /// handed back immediately without a reply round trip.
    SpawnProcess {
        id: u64,
        cycles: Option<u32>,
        body: Box<ProcessBody>,
    },
    SeedRng(u64),
    Stop,
}

/// `{events, samples, t}` returned by `run`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub events: u64,
    pub samples: u64,
    pub t: Time,
}

/// One process owned by this clock: its current continuation, the shared
/// suspension slot its `ProcessContext` writes to, and how many more times
/// its body should run after the current future finishes ("cycles").
struct ProcessSlot {
    ctx: ProcessContext,
    body: Box<ProcessBody>,
    current: std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>,
    remaining_cycles: Option<u32>,
}

enum DriveOutcome {
    Suspended,
    Finished,
}

pub struct LocalClock {
    id: ClockId,
    t0: Time,
    t: Time,
    schedule: Schedule,
    symbols: SymbolTable,
    rng: ClockRng,
    stopped: bool,
    inbox_tx: Sender<InboxMsg>,
    inbox_rx: Receiver<InboxMsg>,
    tau_cell: Arc<AtomicU64>,
    poll_divisor: u32,
    /// Totals since creation (or the last `reset`), backing `event_count()`/
    /// `sample_count()`; `run_until`'s own `RunReport` is only the delta for
    /// that one call.
    events_fired: u64,
    samples_fired: u64,
    /// Processes owned by this clock, keyed by id. A finished process is
    /// removed the instant `drive_process` observes completion — there is
    /// no lazy reaping, since driving is synchronous and the outcome is
    /// always known immediately.
    processes: HashMap<u64, ProcessSlot>,
    /// Process ids released by a firing event or condition but not yet
    /// driven forward, drained in FIFO order immediately after the action
    /// that released them returns: a process released by an event must run
    /// before the dispatcher considers the next event at the same time.
    ready: Arc<Mutex<VecDeque<u64>>>,
}

impl LocalClock {
    pub fn new(dt: Time, t0: Time) -> Self {
        let (inbox_tx, inbox_rx) = channel();
        Self {
            id: next_clock_id(),
            t0,
            t: t0,
            schedule: Schedule::new(dt),
            symbols: SymbolTable::default(),
            rng: ClockRng::default(),
            stopped: false,
            inbox_tx,
            inbox_rx,
            tau_cell: Arc::new(AtomicU64::new(t0.to_bits())),
            poll_divisor: DEFAULT_CONDITION_POLL_DIVISOR,
            events_fired: 0,
            samples_fired: 0,
            processes: HashMap::new(),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Total events fired since this clock was created or last `reset`, not
    /// just the delta from the most recent `run`/`run_until` call.
    pub fn event_count(&self) -> u64 {
        self.events_fired
    }

    /// Total periodic samples fired since this clock was created or last
    /// `reset`.
    pub fn sample_count(&self) -> u64 {
        self.samples_fired
    }

    /// A cloneable, read-only handle onto this clock's `t`, for processes
    /// spawned on it to implement `tau(clk)`.
    pub fn tau_handle(&self) -> TauHandle {
        TauHandle(self.tau_cell.clone())
    }

    fn set_t(&mut self, t: Time) {
        self.t = t;
        self.tau_cell.store(t.to_bits(), AtomicOrdering::Release);
    }

    pub fn id(&self) -> ClockId {
        self.id
    }

    pub fn tau(&self) -> Time {
        self.t
    }

    pub fn inbox(&self) -> Sender<InboxMsg> {
        self.inbox_tx.clone()
    }

    pub fn rng(&mut self) -> &mut ClockRng {
        &mut self.rng
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn is_idle(&self) -> bool {
        self.schedule.is_empty() && self.processes.is_empty()
    }

    /// The clock's own sample interval, `0.0` if unset. Used by
    /// `GlobalClock` to size its synchronization window.
    pub fn schedule_dt(&self) -> Time {
        self.schedule.dt
    }

    /// Direct (same-thread) scheduling entry point, used both by top-level
    /// setup code and by an Action firing in-band on this very clock.
    /// Fails immediately on `ScheduleMisuse`.
    pub fn schedule_event(
        &mut self,
        action: Action,
        t_fire: Time,
        cycle: Time,
        n: u32,
    ) -> ClockResult<EventId> {
        if t_fire < self.t {
            return Err(ClockError::ScheduleMisuse {
                now: self.t,
                requested: t_fire,
            });
        }
        Ok(self.schedule.push_event(action, t_fire, cycle, n))
    }

    pub fn schedule_condition(&mut self, predicate: Predicate, action: Action) -> ConditionId {
        self.schedule.push_cond(predicate, action)
    }

    pub fn remove_condition(&mut self, id: ConditionId) {
        self.schedule.remove_cond(id)
    }

    pub fn schedule_sample(&mut self, action: Action, dt: Time) {
        self.schedule.push_sample(action, dt)
    }

    /// Spawns a process directly on this clock, driving it synchronously to
    /// its first suspension or completion before returning.
    pub(crate) fn spawn_process_local(
        &mut self,
        id: u64,
        cycles: Option<u32>,
        mut body: Box<ProcessBody>,
    ) -> anyhow::Result<()> {
        let ctx = ProcessContext::new(self.id, self.tau_handle());
        let current = body(ctx.clone());
        self.processes.insert(
            id,
            ProcessSlot {
                ctx,
                body,
                current,
                remaining_cycles: cycles,
            },
        );
        match self.drive_process(id)? {
            DriveOutcome::Finished => {
                if let Some(slot) = self.processes.remove(&id) {
                    slot.ctx.mark_dead();
                }
            }
            DriveOutcome::Suspended => {}
        }
        Ok(())
    }

    /// Drives process `id` forward from wherever it last suspended until it
    /// suspends again or finishes. Called once on spawn, and again every
    /// time a release action fires (from `fire_due_events` and
    /// `drain_ready`) — never concurrently with itself, since the clock is
    /// the only thing that ever polls its own processes.
    fn drive_process(&mut self, id: u64) -> anyhow::Result<DriveOutcome> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            let poll = {
                let slot = self
                    .processes
                    .get_mut(&id)
                    .expect("process must still be registered while it is being driven");
                slot.current.as_mut().poll(&mut cx)
            };
            match poll {
                Poll::Ready(Ok(())) => {
                    let (finished, ctx) = {
                        let slot = self.processes.get_mut(&id).unwrap();
                        let finished = match slot.remaining_cycles.as_mut() {
                            Some(n) => {
                                *n -= 1;
                                *n == 0
                            }
                            None => false,
                        };
                        (finished, slot.ctx.clone())
                    };
                    if finished {
                        return Ok(DriveOutcome::Finished);
                    }
                    let next = (self.processes.get_mut(&id).unwrap().body)(ctx);
                    self.processes.get_mut(&id).unwrap().current = next;
                    continue;
                }
                Poll::Ready(Err(err)) => return Err(err),
                Poll::Pending => {
                    let request = {
                        let slot = self.processes.get_mut(&id).unwrap();
                        slot.ctx.pending().lock().unwrap().take()
                    };
                    match request {
                        Some(PendingRequest::Delay(t_fire)) => {
                            if t_fire < self.t {
                                anyhow::bail!(
                                    "process {id} requested delay to t={t_fire}, already past t={}",
                                    self.t
                                );
                            }
                            let released = self.processes.get(&id).unwrap().ctx.released().clone();
                            self.schedule.push_event(
                                release_action(self.ready.clone(), id, released),
                                t_fire,
                                0.0,
                                1,
                            );
                            return Ok(DriveOutcome::Suspended);
                        }
                        Some(PendingRequest::Wait(predicate)) => {
                            let released = self.processes.get(&id).unwrap().ctx.released().clone();
                            self.schedule.push_cond(
                                predicate,
                                release_action(self.ready.clone(), id, released),
                            );
                            return Ok(DriveOutcome::Suspended);
                        }
                        Some(PendingRequest::Now(mut action)) => {
                            action.dispatch(&self.symbols)?;
                            self.processes
                                .get(&id)
                                .unwrap()
                                .ctx
                                .released()
                                .store(true, AtomicOrdering::Release);
                            continue;
                        }
                        None => {
                            // A process body is restricted to the owning
                            // clock's own blocking calls, so a suspension
                            // with no pending request here means nothing to
                            // schedule; leave it suspended.
                            return Ok(DriveOutcome::Suspended);
                        }
                    }
                }
            }
        }
    }

    /// Drains the ready queue in FIFO order, driving each released process
    /// forward before returning control to the caller: a process released
    /// by an event must run before the dispatcher considers the next event
    /// at the same time. Must be called immediately after any action
    /// dispatch that might have released a process — after each individual
    /// event in `fire_due_events`, and after a condition-check pass.
    fn drain_ready(&mut self) -> anyhow::Result<()> {
        loop {
            let next = self.ready.lock().unwrap().pop_front();
            match next {
                Some(id) => {
                    if self.processes.contains_key(&id) {
                        match self.drive_process(id)? {
                            DriveOutcome::Finished => {
                                if let Some(slot) = self.processes.remove(&id) {
                                    slot.ctx.mark_dead();
                                }
                            }
                            DriveOutcome::Suspended => {}
                        }
                    }
                }
                None => return Ok(()),
            }
        }
    }

    pub fn stop(&self) {
        // Fire-and-forget into our own inbox so the signal is observed at
        // the top of the dispatcher loop, after the current Action
        // finishes, whether `stop` was called in-band or from another
        // thread holding a clone of this sender.
        let _ = self.inbox_tx.send(InboxMsg::Stop);
    }

    pub fn resume(&mut self) {
        self.stopped = false;
    }

    /// Resets the clock. `hard = true` also clears the symbol table and RNG;
    /// a soft reset only rewinds time and drops the schedule and any
    /// in-flight processes.
    pub fn reset(&mut self, dt: Time, t0: Time, hard: bool) {
        self.t0 = t0;
        self.set_t(t0);
        self.schedule = Schedule::new(dt);
        self.stopped = false;
        self.processes.clear();
        self.ready.lock().unwrap().clear();
        self.events_fired = 0;
        self.samples_fired = 0;
        if hard {
            self.symbols = SymbolTable::default();
            self.rng = ClockRng::default();
        }
    }

    /// Effective condition-poll cadence: the clock's own `Δt` when set,
    /// else an auto-installed cadence fine enough to observe conditions
    /// within the remaining run window without busy-spinning.
    fn effective_dt(&self, t_end: Time) -> Time {
        if self.schedule.dt > 0.0 {
            self.schedule.dt
        } else {
            (t_end - self.t).max(f64::EPSILON) / self.poll_divisor as f64
        }
    }

    fn next_sample_tick(&self) -> Option<Time> {
        if self.schedule.dt > 0.0 {
            Some(next_tick(self.t0, self.schedule.dt, self.t))
        } else {
            None
        }
    }

    fn next_condition_tick(&self, t_end: Time) -> Option<Time> {
        if self.schedule.has_conditions() {
            Some(next_tick(self.t0, self.effective_dt(t_end), self.t))
        } else {
            None
        }
    }

    /// Drains pending inbox messages without blocking, applying each to
    /// this clock's own state.
    pub(crate) fn drain_inbox(&mut self) -> anyhow::Result<()> {
        loop {
            match self.inbox_rx.try_recv() {
                Ok(InboxMsg::ScheduleEvent {
                    action,
                    t_fire,
                    cycle,
                    n,
                }) => {
                    if t_fire < self.t {
                        tracing::warn!(
                            requested = t_fire,
                            now = self.t,
                            "dropping cross-thread event scheduled in the past"
                        );
                    } else {
                        self.schedule.push_event(action, t_fire, cycle, n);
                    }
                }
                Ok(InboxMsg::ScheduleCondition { predicate, action }) => {
                    self.schedule.push_cond(predicate, action);
                }
                Ok(InboxMsg::ScheduleSample { action, dt }) => {
                    self.schedule.push_sample(action, dt);
                }
                Ok(InboxMsg::SpawnProcess { id, cycles, body }) => {
                    self.spawn_process_local(id, cycles, body)?;
                }
                Ok(InboxMsg::SeedRng(seed)) => self.rng.reseed(seed),
                Ok(InboxMsg::Stop) => self.stopped = true,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// The dispatcher. Advances from the current `t` to `t_end`, firing
    /// every due event/sample/condition in priority order, and returns the
    /// counts fired plus the final `t`.
    pub fn run_until(&mut self, t_end: Time) -> Result<RunReport, ClockException> {
        self.stopped = false;
        let mut events_fired = 0u64;
        let mut samples_fired = 0u64;

        loop {
            match self.drain_inbox() {
                Ok(_) => {}
                Err(err) => return Err(ClockException::new(self.t, err)),
            }
            if self.stopped {
                break;
            }

            let t_event = self.schedule.next_event_time();
            let t_sample = self.next_sample_tick();
            let t_cond = self.next_condition_tick(t_end);

            // A condition tied with an event runs first: its predicate may
            // reference state the event is about to change. A condition
            // tied with a sample tick does NOT get a standalone decision
            // point here: the sample branch below fires the sample and then
            // checks conditions in the same step, integrating condition
            // checks with the sample tick rather than a separate busy poll,
            // so a tie with the sample defers to that combined step instead
            // of checking the condition against stale state twice.
            let cond_first = match t_cond {
                Some(tc) if tc <= t_end => {
                    t_event.map_or(true, |te| tc <= te) && t_sample.map_or(true, |ts| tc < ts)
                }
                _ => false,
            };
            if cond_first {
                let tc = t_cond.unwrap();
                self.set_t(tc);
                match self.schedule.check_conditions(&self.symbols) {
                    Ok(_) => {}
                    Err(err) => return Err(ClockException::new(self.t, err)),
                }
                if let Err(err) = self.drain_ready() {
                    return Err(ClockException::new(self.t, err));
                }
                continue;
            }

            let event_first = match t_event {
                Some(te) => te <= t_end && t_sample.map_or(true, |ts| te <= ts),
                None => false,
            };
            if event_first {
                let te = t_event.unwrap();
                self.set_t(te);
                if let Err(err) = self.fire_due_events(te) {
                    return Err(ClockException::new(self.t, err));
                }
                events_fired += 1;
                self.events_fired += 1;
                continue;
            }

            if let Some(ts) = t_sample {
                if ts <= t_end {
                    self.set_t(ts);
                    if let Err(err) = self.schedule.fire_samples(&self.symbols) {
                        return Err(ClockException::new(self.t, err));
                    }
                    samples_fired += 1;
                    self.samples_fired += 1;
                    if let Err(err) = self.schedule.check_conditions(&self.symbols) {
                        return Err(ClockException::new(self.t, err));
                    }
                    if let Err(err) = self.drain_ready() {
                        return Err(ClockException::new(self.t, err));
                    }
                    continue;
                }
            }

            self.set_t(t_end);
            break;
        }

        Ok(RunReport {
            events: events_fired,
            samples: samples_fired,
            t: self.t,
        })
    }

    fn fire_due_events(&mut self, t: Time) -> anyhow::Result<()> {
        let due = self.schedule.pop_due(t);
        for mut event in due {
            debug!(t, id = event.id, "firing event");
            event.action.dispatch(&self.symbols)?;
            if event.remaining > 1 {
                self.schedule.requeue(
                    event.id,
                    event.t_fire + event.cycle,
                    event.cycle,
                    event.remaining - 1,
                    event.action,
                );
            }
            // A process released by this event must run to its next
            // suspension before the next due event (even one at the very
            // same `t`) is considered.
            self.drain_ready()?;
        }
        Ok(())
    }

    pub fn run(&mut self, duration: Time) -> Result<RunReport, ClockException> {
        let t_end = self.t + duration;
        self.run_until(t_end)
    }
}

/// Builds the `Action` fired when a process's suspension (a scheduled event
/// or a true condition) comes due: mark it released, then enqueue it for
/// the dispatcher to drive forward via `drain_ready` (the rendezvous
/// protocol). The action itself must stay cheap and side-effect-free beyond
/// this bookkeeping — actually running the process body happens afterward,
/// outside of `Schedule`'s own dispatch, so `drive_process` can mutate
/// `self.schedule`/`self.symbols` without reentering `Action::dispatch`.
fn release_action(ready: Arc<Mutex<VecDeque<u64>>>, id: u64, released: Arc<AtomicBool>) -> Action {
    Action::new(move || {
        released.store(true, AtomicOrdering::Release);
        ready.lock().unwrap().push_back(id);
        Ok(())
    })
}

impl fmt::Display for LocalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Clock(id={}, t={}, pending_events={}, Δt={})",
            self.id,
            self.t,
            self.schedule.event_len(),
            self.schedule.dt
        )
    }
}
