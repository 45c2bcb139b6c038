//! Ordered interceptor chains with explicit continuations
//!
//! Each extension point of the hub is an [`InterceptorChain`]. Interceptors
//! run outermost-first, sorted by priority and then by registration order.
//! Every interceptor receives the input and a `next` continuation: calling
//! it runs the rest of the chain (ending in the default behavior), not
//! calling it short-circuits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Interceptor priority for determining execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptorPriority {
    /// Highest priority (runs outermost)
    Highest,
    High,
    /// Normal priority (default)
    Normal,
    Low,
    /// Lowest priority (runs closest to the default behavior)
    Lowest,
    /// Custom priority with specific value
    Custom(u16),
}

impl Default for InterceptorPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<InterceptorPriority> for u16 {
    fn from(priority: InterceptorPriority) -> Self {
        match priority {
            InterceptorPriority::Highest => 0,
            InterceptorPriority::High => 100,
            InterceptorPriority::Normal => 500,
            InterceptorPriority::Low => 900,
            InterceptorPriority::Lowest => 1000,
            InterceptorPriority::Custom(value) => value,
        }
    }
}

type Interceptor<I, O> = Arc<dyn Fn(I, &dyn Fn(I) -> O) -> O + Send + Sync>;

struct Registration<I, O> {
    name: String,
    priority: u16,
    interceptor: Interceptor<I, O>,
}

/// A priority-sorted chain of interceptors around a default behavior
pub struct InterceptorChain<I, O> {
    entries: Vec<Registration<I, O>>,
}

impl<I, O> InterceptorChain<I, O> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register an interceptor.
    ///
    /// Entries with equal priority keep their registration order.
    pub fn register<F>(&mut self, name: impl Into<String>, priority: InterceptorPriority, interceptor: F)
    where
        F: Fn(I, &dyn Fn(I) -> O) -> O + Send + Sync + 'static,
    {
        let priority: u16 = priority.into();
        let position = self
            .entries
            .iter()
            .position(|entry| entry.priority > priority)
            .unwrap_or(self.entries.len());

        let name = name.into();
        tracing::debug!(target: "interceptors", interceptor = %name, priority, "Interceptor registered");

        self.entries.insert(
            position,
            Registration {
                name,
                priority,
                interceptor: Arc::new(interceptor),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interceptor names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// Run the chain, ending in `terminal` if every interceptor continues
    pub fn run(&self, input: I, terminal: &dyn Fn(I) -> O) -> O {
        self.dispatch(0, input, terminal)
    }

    fn dispatch(&self, index: usize, input: I, terminal: &dyn Fn(I) -> O) -> O {
        match self.entries.get(index) {
            Some(entry) => {
                let next = |input: I| self.dispatch(index + 1, input, terminal);
                (entry.interceptor)(input, &next)
            }
            None => terminal(input),
        }
    }
}

impl<I, O> Default for InterceptorChain<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> fmt::Debug for InterceptorChain<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_empty_chain_runs_terminal() {
        let chain: InterceptorChain<u32, u32> = InterceptorChain::new();
        assert_eq!(chain.run(2, &|n| n * 10), 20);
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut chain: InterceptorChain<(), ()> = InterceptorChain::new();

        for (name, priority) in [
            ("low", InterceptorPriority::Low),
            ("normal-1", InterceptorPriority::Normal),
            ("high", InterceptorPriority::High),
            ("normal-2", InterceptorPriority::Normal),
        ] {
            let order = order.clone();
            chain.register(name, priority, move |input, next| {
                order.lock().push(name);
                next(input)
            });
        }

        chain.run((), &|_| {});
        assert_eq!(*order.lock(), vec!["high", "normal-1", "normal-2", "low"]);
        assert_eq!(chain.names(), vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_interceptors_wrap_like_an_onion() {
        let mut chain: InterceptorChain<String, String> = InterceptorChain::new();
        chain.register("outer", InterceptorPriority::High, |input, next| {
            format!("[{}]", next(format!("{}>outer", input)))
        });
        chain.register("inner", InterceptorPriority::Low, |input, next| {
            format!("({})", next(format!("{}>inner", input)))
        });

        let out = chain.run("in".to_string(), &|input| input);
        assert_eq!(out, "[(in>outer>inner)]");
    }

    #[test]
    fn test_short_circuit_skips_terminal() {
        let mut chain: InterceptorChain<u32, u32> = InterceptorChain::new();
        chain.register("cache", InterceptorPriority::Normal, |_input, _next| 7);
        assert_eq!(chain.run(1, &|_| panic!("terminal should not run")), 7);
    }
}
