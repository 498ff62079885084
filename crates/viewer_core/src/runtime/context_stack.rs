//! Execution context stack.
//!
//! # Responsibility
//! - Track which execution context (panel, workflow) is current.
//! - Produce the lookup chain used to disambiguate same-named commands.
//!
//! # Invariants
//! - The stack is never empty; the bottom entry is always [`GLOBAL_CONTEXT`].
//! - `pop` on the sentinel-only stack is a no-op.

use log::debug;

/// Distinguished global context, always at the bottom of the stack.
pub const GLOBAL_CONTEXT: &str = "DEFAULT";

/// Ordered context identifiers; the last entry is the active one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStack {
    entries: Vec<String>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self {
            entries: vec![GLOBAL_CONTEXT.to_string()],
        }
    }

    /// Makes `context` the active context.
    pub fn push(&mut self, context: impl Into<String>) {
        let context = context.into();
        debug!(
            "event=context_push module=context_stack status=ok context={} depth={}",
            context,
            self.entries.len() + 1
        );
        self.entries.push(context);
    }

    /// Removes the active context and returns it.
    ///
    /// Returns `None` and leaves the stack untouched when only the global
    /// sentinel remains.
    pub fn pop(&mut self) -> Option<String> {
        if self.entries.len() <= 1 {
            debug!("event=context_pop module=context_stack status=noop reason=sentinel");
            return None;
        }
        let popped = self.entries.pop();
        if let Some(context) = popped.as_deref() {
            debug!(
                "event=context_pop module=context_stack status=ok context={} depth={}",
                context,
                self.entries.len()
            );
        }
        popped
    }

    /// Returns the active context.
    pub fn current(&self) -> &str {
        self.entries
            .last()
            .map(String::as_str)
            .unwrap_or(GLOBAL_CONTEXT)
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, context: &str) -> bool {
        self.entries.iter().any(|entry| entry == context)
    }

    /// Iterates contexts from the active one down to the sentinel.
    pub fn iter_top_down(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().rev().map(String::as_str)
    }

    /// Lookup chain for one command resolution.
    ///
    /// Order: explicit context (when given), then the stack top-down, then the
    /// global context. Each context appears once.
    pub fn resolution_chain<'a>(&'a self, explicit: Option<&'a str>) -> Vec<&'a str> {
        let mut chain: Vec<&'a str> = Vec::with_capacity(self.entries.len() + 1);
        let candidates = explicit
            .into_iter()
            .chain(self.iter_top_down())
            .chain(std::iter::once(GLOBAL_CONTEXT));
        for context in candidates {
            if !chain.contains(&context) {
                chain.push(context);
            }
        }
        chain
    }

    /// Drops every context above the sentinel.
    pub fn reset(&mut self) {
        self.entries.truncate(1);
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextStack, GLOBAL_CONTEXT};

    #[test]
    fn starts_with_global_sentinel() {
        let stack = ContextStack::new();
        assert_eq!(stack.current(), GLOBAL_CONTEXT);
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn pop_never_removes_sentinel() {
        let mut stack = ContextStack::new();
        stack.push("viewer");
        assert_eq!(stack.pop().as_deref(), Some("viewer"));
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.current(), GLOBAL_CONTEXT);
    }

    #[test]
    fn resolution_chain_puts_explicit_first_and_dedups() {
        let mut stack = ContextStack::new();
        stack.push("viewer");
        stack.push("segmentation");

        assert_eq!(
            stack.resolution_chain(None),
            vec!["segmentation", "viewer", GLOBAL_CONTEXT]
        );
        assert_eq!(
            stack.resolution_chain(Some("viewer")),
            vec!["viewer", "segmentation", GLOBAL_CONTEXT]
        );
    }

    #[test]
    fn reset_keeps_only_sentinel() {
        let mut stack = ContextStack::new();
        stack.push("a");
        stack.push("b");
        stack.reset();
        assert_eq!(stack.depth(), 1);
        assert!(stack.contains(GLOBAL_CONTEXT));
        assert!(!stack.contains("a"));
    }
}
