//! Long-lived process coroutines. A process body is an ordinary `async
//! fn`/async block; its `delay`/`wait`/`now` suspension points are backed by
//! a single shared "pending request" slot per process rather than real
//! asynchronous waking, so the owning clock can poll the body directly and
//! in-line, immediately after releasing it. This is the rendezvous contract
//! made exact: the clock posts a release, the process wakes and runs until
//! its next blocking primitive, and the clock never fires a release without
//! immediately driving the process to its next suspension before making its
//! next scheduling decision, so there is no executor, no extra thread, and
//! no risk of the dispatcher racing ahead of a process that has not yet
//! reacted to being released.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::action::{Action, Predicate};
use crate::clock::{ClockId, TauHandle};
use crate::error::ClockError;
use crate::time::Time;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// A process id unique across every clock — a single id namespace
/// regardless of which clock the process is affinitized to — allocated by
/// the caller so a worker-routed spawn can hand its id back without waiting
/// on a reply from the owning thread.
pub fn next_process_id() -> u64 {
    NEXT_PROCESS_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// What a suspended process is waiting on. Read by the owning clock the
/// instant a poll returns `Pending`, and converted into a `Schedule` entry.
pub(crate) enum PendingRequest {
    Delay(Time),
    Wait(Predicate),
    Now(Action),
}

/// Resolves to `()` once the clock has fired this suspension's release.
/// Only ever polled by the owning clock's own driving loop, immediately
/// after it sets `released` — never by a real executor — so there is
/// nothing to actually wake.
struct Suspend(Arc<AtomicBool>);

impl Future for Suspend {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.0.load(AtomicOrdering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Handed to a process body in place of direct access to its owning clock.
/// Every blocking primitive stashes its request in `pending` and then waits
/// on a fresh `Suspend`; the clock reads `pending` the moment that poll
/// returns `Pending`, so the clock remains the single writer of its own
/// schedule even while a process "runs".
#[derive(Clone)]
pub struct ProcessContext {
    clock_id: ClockId,
    tau: TauHandle,
    pending: Arc<Mutex<Option<PendingRequest>>>,
    released: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl ProcessContext {
    pub(crate) fn new(clock_id: ClockId, tau: TauHandle) -> Self {
        Self {
            clock_id,
            tau,
            pending: Arc::new(Mutex::new(None)),
            released: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The owning clock's id. Folded into `ClockError::ProcessMisuse` so the
    /// error message names which clock the detached context belonged to.
    pub fn clock_id(&self) -> ClockId {
        self.clock_id
    }

    /// `tau(clk)` read from inside a process. Never ahead of the clock's
    /// own `t`, since only the dispatcher ever advances the shared cell,
    /// and only after it has actually stepped there.
    pub fn tau(&self) -> Time {
        self.tau.get()
    }

    /// Marks the owning process as finished. Every clone of this context
    /// still held elsewhere (e.g. stashed in another process's captured
    /// state) starts reporting `ProcessMisuse` from `delay`/`wait`/`now`
    /// afterward, rather than suspending on a release the clock will never
    /// send — the process id backing it is already gone from the clock's
    /// process table by the time this runs.
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, AtomicOrdering::Release);
    }

    fn check_alive(&self, what: &'static str) -> anyhow::Result<()> {
        if self.alive.load(AtomicOrdering::Acquire) {
            Ok(())
        } else {
            Err(ClockError::ProcessMisuse {
                what,
                clock_id: self.clock_id(),
            }
            .into())
        }
    }

    async fn suspend(&self, request: PendingRequest) {
        self.released.store(false, AtomicOrdering::Release);
        *self.pending.lock().unwrap() = Some(request);
        Suspend(self.released.clone()).await
    }

    /// `delay(clk, Δ)`: suspend until `tau(clk) + dt`.
    pub async fn delay(&self, dt: Time) -> anyhow::Result<()> {
        self.delay_until(self.tau() + dt).await
    }

    /// `delay(clk, until t)`.
    pub async fn delay_until(&self, t_fire: Time) -> anyhow::Result<()> {
        self.check_alive("delay")?;
        self.suspend(PendingRequest::Delay(t_fire)).await;
        Ok(())
    }

    /// `wait(clk, cond)`: suspend until `cond` is observed true at a
    /// condition-check tick.
    pub async fn wait(&self, predicate: Predicate) -> anyhow::Result<()> {
        self.check_alive("wait")?;
        self.suspend(PendingRequest::Wait(predicate)).await;
        Ok(())
    }

    /// `now(clk, action)`: run `action` in-band on the clock's own
    /// execution context at the current `t`, suspending the caller until it
    /// returns. Used to order external I/O against the timeline.
    pub async fn now(&self, action: Action) -> anyhow::Result<()> {
        self.check_alive("now")?;
        self.suspend(PendingRequest::Now(action)).await;
        Ok(())
    }

    pub(crate) fn pending(&self) -> &Mutex<Option<PendingRequest>> {
        &self.pending
    }

    pub(crate) fn released(&self) -> &Arc<AtomicBool> {
        &self.released
    }
}

/// A user process body: takes the context it was spawned with and returns a
/// future that runs to the next suspension or to completion.
/// Boxed since a clock's process set is homogeneous regardless of each
/// body's concrete future type.
pub type ProcessBody =
    dyn FnMut(ProcessContext) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send;

/// A waker that does nothing. Nobody but the owning clock's own driving loop
/// ever polls a process future, and only ever immediately after it has set
/// `released`, so there is never a real wakeup to deliver.
pub(crate) fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn no_op(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    // Safety: every vtable function is a no-op (or a trivial clone) over a
    // null data pointer that is never dereferenced, so the `RawWaker`
    // contract (vtable consistent with the data pointer's actual type,
    // clone/drop balanced) holds vacuously.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    type BodyFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

    fn poll_once(fut: &mut BodyFuture) -> Poll<anyhow::Result<()>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        fut.as_mut().poll(&mut cx)
    }

    #[test]
    fn delay_suspends_with_a_pending_request_until_released() {
        let ctx = ProcessContext::new(1, TauHandle::from_time(0.0));
        let ctx2 = ctx.clone();
        let mut fut: BodyFuture = Box::pin(async move { ctx2.delay(5.0).await });

        assert!(matches!(poll_once(&mut fut), Poll::Pending));
        match ctx.pending().lock().unwrap().take() {
            Some(PendingRequest::Delay(t)) => assert_eq!(t, 5.0),
            _ => panic!("expected a Delay request"),
        }
        // Polling again before release must stay Pending: nothing woke it.
        assert!(matches!(poll_once(&mut fut), Poll::Pending));

        ctx.released().store(true, Ordering::Release);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(()))));
    }

    #[test]
    fn delay_on_a_dead_context_fails_instead_of_hanging() {
        let ctx = ProcessContext::new(7, TauHandle::from_time(0.0));
        ctx.mark_dead();
        let mut fut: BodyFuture = Box::pin(async move { ctx.delay(5.0).await });
        match poll_once(&mut fut) {
            Poll::Ready(Err(err)) => {
                let misuse = err.downcast_ref::<ClockError>().expect("expected a ClockError");
                assert!(matches!(
                    misuse,
                    ClockError::ProcessMisuse { what: "delay", clock_id: 7 }
                ));
            }
            other => panic!("expected an immediate ProcessMisuse error, got {other:?}"),
        }
    }

    #[test]
    fn now_requests_are_visible_to_the_driver_immediately() {
        let ctx = ProcessContext::new(1, TauHandle::from_time(0.0));
        let ctx2 = ctx.clone();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let mut fut: BodyFuture = Box::pin(async move {
            ctx2.now(Action::new(move || {
                ran2.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .await
        });

        assert!(matches!(poll_once(&mut fut), Poll::Pending));
        let request = ctx.pending().lock().unwrap().take();
        assert!(matches!(request, Some(PendingRequest::Now(_))));
        assert!(!ran.load(Ordering::SeqCst), "driver hasn't dispatched it yet");
    }
}
