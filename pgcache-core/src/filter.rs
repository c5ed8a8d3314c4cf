//! Channel filters deciding whether a change event invalidates a tag.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::FilterError;
use crate::event::{ChangeEvent, ChangeOperation};

/// Fallible per-event predicate.
pub type PredicateFn = dyn Fn(&ChangeEvent) -> Result<bool, FilterError> + Send + Sync;

/// Filter attached to a (table, tag) registration.
///
/// No filter at all means "always matches".
#[derive(Clone)]
pub enum ChannelFilter {
    /// Matches when the event operation is in the set.
    OperationSet(BTreeSet<ChangeOperation>),
    /// Matches when the predicate returns `Ok(true)`.
    Predicate(Arc<PredicateFn>),
}

impl ChannelFilter {
    /// Build an operation-set filter.
    pub fn operations(ops: impl IntoIterator<Item = ChangeOperation>) -> Self {
        Self::OperationSet(ops.into_iter().collect())
    }

    /// Build a predicate filter from an infallible closure.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(move |event| Ok(f(event))))
    }

    /// Build a predicate filter from a closure that may fail.
    pub fn try_predicate<F>(f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> Result<bool, FilterError> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Evaluate the filter against an event.
    ///
    /// A panicking predicate is reported as [`FilterError::Predicate`].
    pub fn evaluate(&self, event: &ChangeEvent) -> Result<bool, FilterError> {
        match self {
            Self::OperationSet(ops) => Ok(ops.contains(&event.operation)),
            Self::Predicate(f) => match catch_unwind(AssertUnwindSafe(|| f(event))) {
                Ok(result) => result,
                Err(panic) => Err(FilterError::Predicate {
                    reason: panic_message(panic.as_ref()),
                }),
            },
        }
    }
}

impl fmt::Debug for ChannelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationSet(ops) => f.debug_tuple("OperationSet").field(ops).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Evaluate an optional filter. `None` always matches.
pub fn filter_matches(
    filter: Option<&ChannelFilter>,
    event: &ChangeEvent,
) -> Result<bool, FilterError> {
    match filter {
        Some(filter) => filter.evaluate(event),
        None => Ok(true),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "predicate panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op: ChangeOperation) -> ChangeEvent {
        ChangeEvent::new(op, "public", "orders")
    }

    #[test]
    fn test_operation_set_excludes_delete() {
        let filter = ChannelFilter::operations([ChangeOperation::Insert, ChangeOperation::Update]);
        assert_eq!(filter.evaluate(&event(ChangeOperation::Insert)), Ok(true));
        assert_eq!(filter.evaluate(&event(ChangeOperation::Update)), Ok(true));
        assert_eq!(filter.evaluate(&event(ChangeOperation::Delete)), Ok(false));
    }

    #[test]
    fn test_absent_filter_always_matches() {
        for op in ChangeOperation::ALL {
            assert_eq!(filter_matches(None, &event(op)), Ok(true));
        }
    }

    #[test]
    fn test_predicate_sees_record() {
        let filter = ChannelFilter::predicate(|e| {
            e.column("status") == Some(&serde_json::json!("paid"))
        });
        let paid = event(ChangeOperation::Update).with_column("status", serde_json::json!("paid"));
        let open = event(ChangeOperation::Update).with_column("status", serde_json::json!("open"));
        assert_eq!(filter.evaluate(&paid), Ok(true));
        assert_eq!(filter.evaluate(&open), Ok(false));
    }

    #[test]
    fn test_failing_predicate_reports_error() {
        let filter = ChannelFilter::try_predicate(|_| {
            Err(FilterError::Predicate {
                reason: "boom".to_string(),
            })
        });
        assert!(filter.evaluate(&event(ChangeOperation::Insert)).is_err());
    }

    #[test]
    fn test_panicking_predicate_is_caught() {
        let filter = ChannelFilter::predicate(|_| panic!("bad predicate"));
        let err = filter.evaluate(&event(ChangeOperation::Insert)).unwrap_err();
        assert_eq!(
            err,
            FilterError::Predicate {
                reason: "bad predicate".to_string()
            }
        );
    }

    #[test]
    fn test_debug_hides_closure() {
        let filter = ChannelFilter::predicate(|_| true);
        assert_eq!(format!("{:?}", filter), "Predicate(..)");
    }
}
