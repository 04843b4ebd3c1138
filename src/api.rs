//! The thin free-function scheduling surface layered directly over
//! `GlobalClock` and `ProcessContext`: small free functions and wrapper
//! types at the outer layer instead of a god object. The actual state lives
//! in `GlobalClock`/`LocalClock`/`Schedule`; these are just named entry
//! points matching the scheduling vocabulary users construct simulations
//! with.

use crate::action::{Action, Predicate};
use crate::clock::RunReport;
use crate::error::{ClockException, ClockResult};
use crate::parallel::{GlobalClock, ThreadId};
use crate::process::{ProcessBody, ProcessContext};
use crate::time::{Resolve, Time};

/// `Clock(Δt=0, t0=0) -> clock`.
pub fn clock(dt: Time, t0: Time) -> GlobalClock {
    GlobalClock::new(dt, t0)
}

/// `PClock(Δt=0, t0=0) -> clock forked across all worker threads`.
pub fn pclock(dt: Time, t0: Time, workers: usize) -> GlobalClock {
    let mut clk = GlobalClock::new(dt, t0);
    clk.fork(workers, dt);
    clk
}

/// `fork(clk)`.
pub fn fork(clk: &mut GlobalClock, workers: usize, dt: Time) {
    clk.fork(workers, dt)
}

/// `collapse(clk)`.
pub fn collapse(clk: &mut GlobalClock) {
    clk.collapse()
}

fn resolve(clk: &mut GlobalClock, value: &impl Resolve) -> Time {
    value.resolve(clk.rng())
}

/// `event(clk, action, at t, n=1, thread=0)`.
pub fn at(
    clk: &mut GlobalClock,
    action: Action,
    t: impl Resolve,
    thread: ThreadId,
) -> ClockResult<()> {
    let t_fire = resolve(clk, &t);
    clk.schedule_event(thread, action, t_fire, 0.0, 1)
}

/// `event(clk, action, after Δ, thread=0)`.
pub fn after(
    clk: &mut GlobalClock,
    action: Action,
    dt: impl Resolve,
    thread: ThreadId,
) -> ClockResult<()> {
    let delta = resolve(clk, &dt);
    let t_fire = clk.tau() + delta;
    clk.schedule_event(thread, action, t_fire, 0.0, 1)
}

/// `event(clk, action, every Δ, n=k, thread=0)`. The first firing is at the
/// current time, not one cycle later: `every 2, n=3` from `t=0` fires at
/// `0, 2, 4`, not `2, 4, 6`.
pub fn every(
    clk: &mut GlobalClock,
    action: Action,
    dt: impl Resolve,
    n: u32,
    thread: ThreadId,
) -> ClockResult<()> {
    let cycle = resolve(clk, &dt);
    let t_fire = clk.tau();
    clk.schedule_event(thread, action, t_fire, cycle, n)
}

/// `event(clk, action, cond, thread=0)`.
pub fn on(
    clk: &mut GlobalClock,
    predicate: Predicate,
    action: Action,
    thread: ThreadId,
) -> ClockResult<()> {
    clk.schedule_condition(thread, predicate, action)
}

/// `periodic(clk, action, Δt=clk.Δt, thread=0)`.
pub fn periodic(clk: &mut GlobalClock, action: Action, dt: Time, thread: ThreadId) -> ClockResult<()> {
    clk.schedule_sample(thread, action, dt)
}

/// `process(clk, body, cycles=∞, thread=0) -> handle`. `cycles = None` is
/// `∞`.
pub fn process(
    clk: &mut GlobalClock,
    body: Box<ProcessBody>,
    cycles: Option<u32>,
    thread: ThreadId,
) -> ClockResult<u64> {
    clk.spawn_process(thread, cycles, body)
}

/// `delay(clk, Δ)` — process-only, called with the context passed into the
/// process body.
pub async fn delay(ctx: &ProcessContext, dt: Time) -> anyhow::Result<()> {
    ctx.delay(dt).await
}

/// `delay(clk, until t)`.
pub async fn delay_until(ctx: &ProcessContext, t: Time) -> anyhow::Result<()> {
    ctx.delay_until(t).await
}

/// `wait(clk, cond)`.
pub async fn wait(ctx: &ProcessContext, predicate: Predicate) -> anyhow::Result<()> {
    ctx.wait(predicate).await
}

/// `now(clk, action)`.
pub async fn now(ctx: &ProcessContext, action: Action) -> anyhow::Result<()> {
    ctx.now(action).await
}

/// `run(clk, duration) -> {events, samples, t}`.
pub fn run(clk: &mut GlobalClock, duration: Time) -> Result<RunReport, ClockException> {
    clk.run(duration)
}

/// `stop(clk)`.
pub fn stop(clk: &GlobalClock) {
    clk.stop()
}

/// `resume(clk)`.
pub fn resume(clk: &mut GlobalClock) {
    clk.resume()
}

/// `reset(clk, Δt=0, t0=0, hard=true)`.
pub fn reset(clk: &mut GlobalClock, dt: Time, t0: Time, hard: bool) {
    clk.reset(dt, t0, hard)
}

/// `tau(clk) -> Real`.
pub fn tau(clk: &GlobalClock) -> Time {
    clk.tau()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn scenario_a_single_timer() {
        let mut clk = clock(0.0, 0.0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        at(
            &mut clk,
            Action::new(move || {
                l.lock().unwrap().push(1);
                Ok(())
            }),
            5.0,
            0,
        )
        .unwrap();
        let report = run(&mut clk, 10.0).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(report.t, 10.0);
    }

    #[test]
    fn scenario_b_repeating_timer() {
        let mut clk = clock(0.0, 0.0);
        let handle = clk.tau_handle(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        every(
            &mut clk,
            Action::new(move || {
                l.lock().unwrap().push((handle.get(), 2));
                Ok(())
            }),
            2.0,
            3,
            0,
        )
        .unwrap();
        run(&mut clk, 10.0).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0.0, 2), (2.0, 2), (4.0, 2)]
        );
    }

    #[test]
    fn scenario_d_conditional_event() {
        let mut clk = clock(1.0, 0.0);
        let x = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let fired_at_x = Arc::new(std::sync::atomic::AtomicI64::new(-1));

        let x1 = x.clone();
        periodic(
            &mut clk,
            Action::new(move || {
                x1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
            1.0,
            0,
        )
        .unwrap();

        let x2 = x.clone();
        let x3 = x.clone();
        let fired_at_x2 = fired_at_x.clone();
        on(
            &mut clk,
            Predicate::new(move || Ok(x2.load(std::sync::atomic::Ordering::SeqCst) >= 5)),
            Action::new(move || {
                fired_at_x2.store(
                    x3.load(std::sync::atomic::Ordering::SeqCst),
                    std::sync::atomic::Ordering::SeqCst,
                );
                Ok(())
            }),
            0,
        )
        .unwrap();

        let report = run(&mut clk, 10.0).unwrap();
        // x increments once per tick starting at t=1, so "x == 5" and
        // "t == 5" coincide; the condition fires on the tick it first holds.
        assert_eq!(fired_at_x.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert_eq!(report.t, 10.0);
    }
}
