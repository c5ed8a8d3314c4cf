//! Property tests for dispatch decisions and memoization keys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pgcache_service::{ChannelRegistry, InvalidationDispatcher, TagIndexedCache};
use pgcache_test_utils::generators::{arb_args, arb_change_event, arb_operation};
use pgcache_test_utils::{
    signature, tag_for, ChannelFilter, InMemoryStore, MockTransport, Tag,
};
use proptest::prelude::*;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn dispatcher_for(registry: ChannelRegistry) -> (InvalidationDispatcher, Arc<TagIndexedCache>) {
    let cache = Arc::new(TagIndexedCache::new(Arc::new(InMemoryStore::new()), "S"));
    let dispatcher = InvalidationDispatcher::new(
        "S",
        Arc::new(registry),
        Arc::clone(&cache),
        Arc::new(MockTransport::manual()),
    );
    (dispatcher, cache)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// An operation-set filter invalidates exactly when the event's operation
    /// is in the set.
    #[test]
    fn prop_operation_set_filter(
        event in arb_change_event(),
        ops in prop::collection::vec(arb_operation(), 0..4)
            .prop_map(|ops| ops.into_iter().collect::<BTreeSet<_>>()),
    ) {
        let tag = tag_for("S", "get", None);
        let mut registry = ChannelRegistry::new();
        registry.register(event.table.clone(), tag.clone(), Some(ChannelFilter::operations(ops.clone())));
        let (dispatcher, _) = dispatcher_for(registry);

        let report = runtime().block_on(dispatcher.dispatch(&event));
        let expected = ops.contains(&event.operation);
        prop_assert_eq!(report.invalidated.contains(&tag), expected);
        prop_assert_eq!(report.skipped.contains(&tag), !expected);
    }

    /// Every registered tag on a table is invalidated once per event; tags
    /// on other tables are untouched.
    #[test]
    fn prop_each_tag_once_per_event(
        event in arb_change_event(),
        methods in prop::collection::btree_set("[a-z]{1,8}", 1..6),
    ) {
        let mut registry = ChannelRegistry::new();
        for method in &methods {
            registry.register(event.table.clone(), tag_for("S", method, None), None);
            registry.register(format!("{}_other", event.table), tag_for("S", method, Some("x")), None);
        }
        let (dispatcher, _) = dispatcher_for(registry);

        let report = runtime().block_on(dispatcher.dispatch(&event));
        let unique: BTreeSet<&Tag> = report.invalidated.iter().collect();
        prop_assert_eq!(unique.len(), report.invalidated.len());
        prop_assert_eq!(report.invalidated.len(), methods.len());
    }

    /// Invalidating a tag twice removes nothing the second time.
    #[test]
    fn prop_invalidate_is_idempotent(args in arb_args(), ttl_ms in 1_000u64..100_000) {
        let rt = runtime();
        let cache = TagIndexedCache::new(Arc::new(InMemoryStore::new()), "S");
        let key = signature("S", "get", &args);
        let tag = tag_for("S", "get", None);

        rt.block_on(async {
            cache.set(&key, json!({"v": 1}), &[tag.clone()], Duration::from_millis(ttl_ms)).await.unwrap();
            prop_assert_eq!(cache.invalidate(&tag).await.unwrap(), 1);
            prop_assert_eq!(cache.invalidate(&tag).await.unwrap(), 0);
            prop_assert_eq!(cache.get(&key).await.unwrap(), None);
            Ok(())
        })?;
    }

    /// Events for tables with no registration invalidate nothing.
    #[test]
    fn prop_unregistered_table_is_ignored(event in arb_change_event()) {
        let mut registry = ChannelRegistry::new();
        registry.register(format!("{}_other", event.table), tag_for("S", "get", None), None);
        let (dispatcher, cache) = dispatcher_for(registry);

        let report = runtime().block_on(dispatcher.dispatch(&event));
        prop_assert!(report.invalidated.is_empty());
        prop_assert_eq!(cache.stats().invalidations, 0);
    }
}
