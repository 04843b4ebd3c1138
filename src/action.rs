//! `Action`: a deferred callable. Rust closures already capture their
//! arguments by value, so a dynamic "literal or deferred or symbol" argument
//! system collapses here to plain closures plus a single deprecated escape
//! hatch (`Symbol`) for code that still needs to resolve a name against a
//! shared naming scope at dispatch time.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::warn;

/// A boxed fallible callable. `FnMut` because a single Action (e.g. a
/// repeating event, or a Sample fired every tick) runs more than once and
/// may carry mutable state between firings.
pub type ActionFn = dyn FnMut() -> anyhow::Result<()> + Send;

/// A boxed fallible predicate, used by conditional events.
pub type PredicateFn = dyn FnMut() -> anyhow::Result<bool> + Send;

/// Deferred callable + composition. A tuple of actions (`Composite`)
/// executes sequentially as one dispatch unit.
pub enum Action {
    Call(Box<ActionFn>),
    Composite(Vec<Action>),
    /// Deprecated: resolves `name` against `symbols` at dispatch time.
    /// Kept only for backward compatibility, emitting a one-time warning
    /// per name.
    Symbol(String),
}

impl Action {
    pub fn new(f: impl FnMut() -> anyhow::Result<()> + Send + 'static) -> Self {
        Action::Call(Box::new(f))
    }

    pub fn tuple(actions: impl IntoIterator<Item = Action>) -> Self {
        Action::Composite(actions.into_iter().collect())
    }

    /// Runs this Action, recursively dispatching composite members in
    /// order and resolving deprecated symbols against `symbols`.
    pub fn dispatch(&mut self, symbols: &SymbolTable) -> anyhow::Result<()> {
        match self {
            Action::Call(f) => f(),
            Action::Composite(actions) => {
                for action in actions {
                    action.dispatch(symbols)?;
                }
                Ok(())
            }
            Action::Symbol(name) => symbols.resolve_and_dispatch(name),
        }
    }
}

/// The predicate half of a conditional event: either a single Action
/// returning bool, or several implicitly AND-combined.
pub enum Predicate {
    Single(Box<PredicateFn>),
    AllOf(Vec<Box<PredicateFn>>),
}

impl Predicate {
    pub fn new(f: impl FnMut() -> anyhow::Result<bool> + Send + 'static) -> Self {
        Predicate::Single(Box::new(f))
    }

    pub fn all_of(
        predicates: impl IntoIterator<Item = Box<PredicateFn>>,
    ) -> Self {
        Predicate::AllOf(predicates.into_iter().collect())
    }

    pub fn evaluate(&mut self) -> anyhow::Result<bool> {
        match self {
            Predicate::Single(f) => f(),
            Predicate::AllOf(fs) => {
                for f in fs {
                    if !f()? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// Process-wide naming scope a clock consults when it dispatches a
/// `Action::Symbol`. Avoids a global mutable singleton: a `SymbolTable` is
/// owned by the clock it serves, not reached through a static, so two
/// clocks never share (or race on) one table.
#[derive(Default)]
pub struct SymbolTable {
    entries: Mutex<std::collections::HashMap<String, Action>>,
    warned: Mutex<HashSet<String>>,
}

impl SymbolTable {
    pub fn register(&self, name: impl Into<String>, action: Action) {
        self.entries.lock().unwrap().insert(name.into(), action);
    }

    fn resolve_and_dispatch(&self, name: &str) -> anyhow::Result<()> {
        if self.warned.lock().unwrap().insert(name.to_string()) {
            warn!(symbol = name, "resolving a deprecated Symbol argument against the global naming scope");
        }
        let mut entries = self.entries.lock().unwrap();
        let action = entries
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("no Action registered under symbol {name:?}"))?;
        // Symbols never nest another Symbol in this implementation, so a
        // throwaway table is enough to satisfy the recursive signature.
        let throwaway = SymbolTable::default();
        action.dispatch(&throwaway)
    }
}
