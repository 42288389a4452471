//! Event predicates. An event reaches its handler only if every predicate
//! attached to the watch accepts it.

use std::collections::BTreeMap;

use crate::event::{Event, EventType};

pub trait Predicate: Send + Sync {
    fn filter(&self, event: &Event) -> bool;
}

/// Predicate backed by a closure.
pub struct FnPredicate<F> {
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn filter(&self, event: &Event) -> bool {
        (self.f)(event)
    }
}

/// Drops updates that did not change `metadata.generation`.
///
/// Adds and deletes always pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChangedPredicate;

impl Predicate for GenerationChangedPredicate {
    fn filter(&self, event: &Event) -> bool {
        match (event.event_type, &event.previous_object) {
            (EventType::Updated, Some(previous)) => {
                previous.metadata.generation != event.object.metadata.generation
            }
            _ => true,
        }
    }
}

/// Accepts events whose object carries every label in the selector.
#[derive(Debug, Clone, Default)]
pub struct LabelSelectorPredicate {
    selector: BTreeMap<String, String>,
}

impl LabelSelectorPredicate {
    #[must_use]
    pub const fn new(selector: BTreeMap<String, String>) -> Self {
        Self { selector }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }
}

impl Predicate for LabelSelectorPredicate {
    fn filter(&self, event: &Event) -> bool {
        event.object.matches_labels(&self.selector)
    }
}
