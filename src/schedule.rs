//! The three time-ordered collections a clock owns: timed events (a
//! min-heap), conditions (an unordered vec, checked every tick), and
//! periodic samples (insertion-ordered). Event push/pop is `O(log n)`;
//! condition/sample push is `O(1)`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::action::{Action, Predicate, SymbolTable};
use crate::time::Time;

pub type EventId = u64;
pub type ConditionId = u64;

/// `(t_fire, id)` ordering key. `id` is a monotone per-clock counter,
/// breaking ties FIFO within a time.
struct ScheduledEvent {
    t_fire: Time,
    id: EventId,
    cycle: Time,
    remaining: u32,
    action: Action,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.t_fire == other.t_fire && self.id == other.id
    }
}
impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    // `BinaryHeap` is a max-heap; flip the comparison so the heap pops the
    // smallest `(t_fire, id)` first, i.e. behaves like a min-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .t_fire
            .total_cmp(&self.t_fire)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A fired event, handed to the dispatcher. If `remaining > 1` after firing,
/// the caller is expected to `Schedule::requeue` it at `t_fire + cycle` to
/// preserve `id` across repeats.
pub struct DueEvent {
    pub t_fire: Time,
    pub id: EventId,
    pub cycle: Time,
    pub remaining: u32,
    pub action: Action,
}

struct ScheduledCondition {
    id: ConditionId,
    predicate: Predicate,
    action: Action,
}

#[derive(Default)]
pub struct Schedule {
    events: BinaryHeap<ScheduledEvent>,
    conditions: Vec<ScheduledCondition>,
    samples: Vec<Action>,
    next_event_id: EventId,
    next_condition_id: ConditionId,
    /// The clock's own periodic interval; `periodic()` shrinks it — if a
    /// newly registered sample's Δt differs from the clock's current Δt,
    /// the smaller value wins. `0.0` means "unset".
    pub dt: Time,
}

impl Schedule {
    pub fn new(dt: Time) -> Self {
        Self {
            dt,
            ..Default::default()
        }
    }

    /// Inserts a one-shot or repeating event. `cycle = 0, n = 1` is
    /// one-shot; otherwise the dispatcher re-queues it `n - 1` more times at
    /// `t_fire + cycle` after the first firing.
    pub fn push_event(&mut self, action: Action, t_fire: Time, cycle: Time, n: u32) -> EventId {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.events.push(ScheduledEvent {
            t_fire,
            id,
            cycle,
            remaining: n,
            action,
        });
        id
    }

    /// Re-inserts a repeating event's next firing, preserving its `id`.
    pub fn requeue(&mut self, id: EventId, t_fire: Time, cycle: Time, remaining: u32, action: Action) {
        self.events.push(ScheduledEvent {
            t_fire,
            id,
            cycle,
            remaining,
            action,
        });
    }

    /// Pops every event due at exactly `t`, in ascending `id` order (the
    /// heap's ordering already guarantees this). `t` must equal
    /// `next_event_time()`; the dispatcher only ever calls it at that time.
    pub fn pop_due(&mut self, t: Time) -> Vec<DueEvent> {
        let mut due = Vec::new();
        while let Some(top) = self.events.peek() {
            if top.t_fire != t {
                break;
            }
            let ScheduledEvent {
                t_fire,
                id,
                cycle,
                remaining,
                action,
            } = self.events.pop().unwrap();
            due.push(DueEvent {
                t_fire,
                id,
                cycle,
                remaining,
                action,
            });
        }
        due
    }

    pub fn push_cond(&mut self, predicate: Predicate, action: Action) -> ConditionId {
        let id = self.next_condition_id;
        self.next_condition_id += 1;
        self.conditions.push(ScheduledCondition {
            id,
            predicate,
            action,
        });
        id
    }

    pub fn remove_cond(&mut self, id: ConditionId) {
        self.conditions.retain(|c| c.id != id);
    }

    pub fn push_sample(&mut self, action: Action, dt: Time) {
        if dt > 0.0 {
            self.dt = if self.dt <= 0.0 { dt } else { self.dt.min(dt) };
        }
        self.samples.push(action);
    }

    pub fn next_event_time(&self) -> Option<Time> {
        self.events.peek().map(|e| e.t_fire)
    }

    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.conditions.is_empty() && self.samples.is_empty()
    }

    pub fn event_len(&self) -> usize {
        self.events.len()
    }

    /// Fires every Sample in registration order.
    pub fn fire_samples(&mut self, symbols: &SymbolTable) -> anyhow::Result<()> {
        for action in &mut self.samples {
            action.dispatch(symbols)?;
        }
        Ok(())
    }

    /// Evaluates every condition's predicate; fires and removes the ones
    /// that are true, in registration order. Returns how many fired.
    pub fn check_conditions(&mut self, symbols: &SymbolTable) -> anyhow::Result<u32> {
        let mut fired_indices = Vec::new();
        for (i, cond) in self.conditions.iter_mut().enumerate() {
            if cond.predicate.evaluate()? {
                fired_indices.push(i);
            }
        }
        let mut fired = 0;
        for &i in fired_indices.iter().rev() {
            let mut cond = self.conditions.remove(i);
            cond.action.dispatch(symbols)?;
            fired += 1;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_pop_in_time_then_id_order() {
        let mut s = Schedule::new(0.0);
        s.push_event(Action::new(|| Ok(())), 5.0, 0.0, 1);
        s.push_event(Action::new(|| Ok(())), 1.0, 0.0, 1);
        s.push_event(Action::new(|| Ok(())), 1.0, 0.0, 1);
        assert_eq!(s.next_event_time(), Some(1.0));
        let due = s.pop_due(1.0);
        assert_eq!(due.len(), 2);
        assert!(due[0].id < due[1].id);
        assert_eq!(s.next_event_time(), Some(5.0));
    }

    #[test]
    fn requeue_preserves_id() {
        let mut s = Schedule::new(0.0);
        let id = s.push_event(Action::new(|| Ok(())), 0.0, 2.0, 3);
        let due = s.pop_due(0.0);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        s.requeue(due[0].id, due[0].t_fire + due[0].cycle, due[0].cycle, due[0].remaining - 1, Action::new(|| Ok(())));
        assert_eq!(s.next_event_time(), Some(2.0));
        let due2 = s.pop_due(2.0);
        assert_eq!(due2[0].id, id);
        assert_eq!(due2[0].remaining, 2);
    }
}
