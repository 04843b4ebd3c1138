//! Virtual time and the stochastic-or-literal values accepted by the
//! scheduling API.

use rand_distr::Distribution;

use crate::rng::ClockRng;

/// A finite virtual-time instant. Never decreases on a given clock.
pub type Time = f64;

/// Something `at`/`after`/`every`/`delay` can accept in place of a literal
/// number: either the number itself, or a distribution sampled once, at the
/// moment of scheduling, to produce the number.
///
/// Literal numbers are the common case and resolve to themselves. Anything
/// implementing `rand_distr::Distribution<f64>` resolves by drawing a single
/// sample from the clock's own RNG, so repeated draws on the same clock are
/// reproducible under `seed_all`.
pub trait Resolve {
    fn resolve(&self, rng: &mut ClockRng) -> Time;
}

impl Resolve for Time {
    fn resolve(&self, _rng: &mut ClockRng) -> Time {
        *self
    }
}

/// Wraps any `rand_distr` distribution so it can be passed wherever a
/// `Resolve` is expected, e.g. `event(clk, action, after(Exp::new(2.0)?))`.
pub struct Stochastic<D>(pub D);

impl<D> Resolve for Stochastic<D>
where
    D: Distribution<f64>,
{
    fn resolve(&self, rng: &mut ClockRng) -> Time {
        self.0.sample(rng.inner())
    }
}

/// Next tick of an interval-`dt` cadence anchored at `t0`, not before `t`.
pub(crate) fn next_tick(t0: Time, dt: Time, t: Time) -> Time {
    if dt <= 0.0 {
        return Time::INFINITY;
    }
    let phase = (t - t0) % dt;
    if phase.abs() < 1e-12 {
        t + dt
    } else {
        t + (dt - phase)
    }
}
