//! Table → (tag, filter) registrations collected from cacheable methods.

use std::collections::HashMap;

use pgcache_core::{ChannelFilter, Tag};

/// One registered invalidation target on a channel.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub tag: Tag,
    pub filter: Option<ChannelFilter>,
}

/// Channel registrations for one service instance.
///
/// Filled while cacheable methods are registered, then frozen behind an
/// `Arc` when the service starts. There is no removal.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Vec<ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tag` on `table`.
    ///
    /// A `(table, tag)` pair is stored once. Registering it again replaces
    /// the filter and keeps the original position.
    pub fn register(&mut self, table: impl Into<String>, tag: Tag, filter: Option<ChannelFilter>) {
        let entries = self.channels.entry(table.into()).or_default();
        match entries.iter_mut().find(|entry| entry.tag == tag) {
            Some(existing) => existing.filter = filter,
            None => entries.push(ChannelEntry { tag, filter }),
        }
    }

    /// Entries for a table in registration order. Empty for unknown tables.
    pub fn entries_for(&self, table: &str) -> &[ChannelEntry] {
        self.channels.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every registered table, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.channels.keys().cloned().collect();
        tables.sort();
        tables
    }

    pub fn contains(&self, table: &str, tag: &Tag) -> bool {
        self.entries_for(table).iter().any(|entry| &entry.tag == tag)
    }

    /// Total number of (table, tag) registrations.
    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgcache_core::{tag_for, ChangeOperation};
    use proptest::prelude::*;

    #[test]
    fn test_unknown_table_has_no_entries() {
        let registry = ChannelRegistry::new();
        assert!(registry.entries_for("orders").is_empty());
        assert!(registry.tables().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entries_keep_registration_order() {
        let mut registry = ChannelRegistry::new();
        registry.register("orders", tag_for("OrderService", "getOrder", None), None);
        registry.register("orders", tag_for("OrderService", "listOrders", None), None);
        registry.register("customers", tag_for("OrderService", "getOrder", None), None);

        let tags: Vec<&str> = registry
            .entries_for("orders")
            .iter()
            .map(|e| e.tag.as_str())
            .collect();
        assert_eq!(tags, vec!["OrderService:getOrder", "OrderService:listOrders"]);
        assert_eq!(registry.tables(), vec!["customers", "orders"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_reregistration_replaces_filter_in_place() {
        let mut registry = ChannelRegistry::new();
        let first = tag_for("S", "a", None);
        let second = tag_for("S", "b", None);
        registry.register("orders", first.clone(), None);
        registry.register("orders", second.clone(), None);
        registry.register(
            "orders",
            first.clone(),
            Some(ChannelFilter::operations([ChangeOperation::Delete])),
        );

        let entries = registry.entries_for("orders");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tag, first);
        assert!(matches!(entries[0].filter, Some(ChannelFilter::OperationSet(_))));
        assert_eq!(entries[1].tag, second);
    }

    proptest! {
        #[test]
        fn prop_registration_pass_never_duplicates(
            pairs in prop::collection::vec((0usize..4, 0usize..4), 0..40)
        ) {
            let tables = ["orders", "customers", "items", "payments"];
            let methods = ["get", "list", "count", "search"];
            let mut registry = ChannelRegistry::new();
            for _ in 0..2 {
                for (t, m) in &pairs {
                    registry.register(tables[*t], tag_for("S", methods[*m], None), None);
                }
            }

            for table in registry.tables() {
                let entries = registry.entries_for(&table);
                let mut tags: Vec<&str> = entries.iter().map(|e| e.tag.as_str()).collect();
                let before = tags.len();
                tags.sort();
                tags.dedup();
                prop_assert_eq!(before, tags.len());
            }
        }
    }
}
