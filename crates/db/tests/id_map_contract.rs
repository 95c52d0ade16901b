//! Contract tests for the id map, run against every in-process backend.
//!
//! Each scenario is written once against `IdMap<S>` and instantiated for
//! `InMemoryStore` and `KeyValueStore<MemoryKvEngine>`.

mod common;

use assert_matches::assert_matches;
use idmap_core::key::{KeyValue, SourceKey};
use idmap_core::record::SourceRecord;
use idmap_core::status::{MapStatus, MessageLevel, RollbackAction};
use idmap_db::{IdMap, IdMapError, IdMapStore, MessageFilter, SourceLookup};
use serde_json::json;

use common::{dst, id_of, src, text_dst};

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

async fn upsert_then_lookup<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(100)).await.unwrap();

    assert_eq!(map.lookup_destination_id(&src(1)).await.unwrap(), Some(dst(100)));
    assert_eq!(
        map.lookup_source_id(&dst(100)).await.unwrap(),
        SourceLookup::Found(src(1))
    );
    let row = map.get_row_by_source(&src(1)).await.unwrap().unwrap();
    assert_eq!(row.status, MapStatus::Imported);
    assert_eq!(row.rollback_action, RollbackAction::Delete);
}

async fn unmapped_keys_are_not_errors<S: IdMapStore>(map: IdMap<S>) {
    assert_eq!(map.lookup_destination_id(&src(9)).await.unwrap(), None);
    assert_eq!(map.lookup_source_id(&dst(9)).await.unwrap(), SourceLookup::NotFound);
    assert!(map.get_row_by_source(&src(9)).await.unwrap().is_none());
    assert!(map.get_rows_by_destination(&dst(9)).await.unwrap().is_empty());
}

async fn repeated_upsert_overwrites_in_place<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(100)).await.unwrap();
    map.import(&src(1), &dst(100)).await.unwrap();
    assert_eq!(map.aggregator().processed_count().await.unwrap(), 1);

    map.upsert(&src(1), Some(&dst(200)), MapStatus::Imported, RollbackAction::Preserve)
        .await
        .unwrap();
    assert_eq!(map.aggregator().processed_count().await.unwrap(), 1);
    let row = map.get_row_by_source(&src(1)).await.unwrap().unwrap();
    assert_eq!(row.destination, Some(dst(200)));
    assert_eq!(row.rollback_action, RollbackAction::Preserve);
    assert!(map.get_rows_by_destination(&dst(100)).await.unwrap().is_empty());
}

async fn failed_row_without_destination<S: IdMapStore>(map: IdMap<S>) {
    map.upsert(&src(1), None, MapStatus::Failed, RollbackAction::Delete)
        .await
        .unwrap();

    assert_eq!(map.lookup_destination_id(&src(1)).await.unwrap(), None);
    let row = map.get_row_by_source(&src(1)).await.unwrap().unwrap();
    assert_eq!(row.status, MapStatus::Failed);
    assert_eq!(map.aggregator().error_count().await.unwrap(), 1);
}

async fn prepare_update_moves_imported_and_failed<S: IdMapStore>(map: IdMap<S>) {
    for id in 1..=3 {
        map.import(&src(id), &dst(id * 100)).await.unwrap();
    }
    map.upsert(&src(4), None, MapStatus::Failed, RollbackAction::Delete)
        .await
        .unwrap();
    map.upsert(&src(5), Some(&dst(500)), MapStatus::Ignored, RollbackAction::Delete)
        .await
        .unwrap();

    let agg = map.aggregator();
    let before = agg.imported_count().await.unwrap() + agg.error_count().await.unwrap();

    assert_eq!(map.prepare_update().await.unwrap(), 4);
    assert_eq!(agg.update_count().await.unwrap(), before);
    assert_eq!(agg.imported_count().await.unwrap(), 0);
    assert_eq!(agg.error_count().await.unwrap(), 0);
    assert_eq!(agg.ignored_count().await.unwrap(), 1);

    // Idempotent.
    assert_eq!(map.prepare_update().await.unwrap(), 0);
    assert_eq!(agg.update_count().await.unwrap(), before);
}

async fn three_imported_rows_prepare_update<S: IdMapStore>(map: IdMap<S>) {
    for id in 1..=3 {
        map.import(&src(id), &dst(id)).await.unwrap();
    }
    map.prepare_update().await.unwrap();
    let summary = map.aggregator().summary().await.unwrap();
    assert_eq!(summary.needs_update, 3);
    assert_eq!(summary.imported, 0);
    assert_eq!(summary.processed, 3);
}

async fn set_update_targets_one_row<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(1)).await.unwrap();
    map.import(&src(2), &dst(2)).await.unwrap();
    map.upsert(&src(3), None, MapStatus::Ignored, RollbackAction::Delete)
        .await
        .unwrap();

    assert!(map.set_update(&src(1)).await.unwrap());
    assert!(!map.set_update(&src(1)).await.unwrap());
    assert!(!map.set_update(&src(42)).await.unwrap());
    assert!(!map.set_update(&src(3)).await.unwrap());

    let status = |id| {
        let map = &map;
        async move { map.get_row_by_source(&src(id)).await.unwrap().unwrap().status }
    };
    assert_eq!(status(1).await, MapStatus::NeedsUpdate);
    assert_eq!(status(2).await, MapStatus::Imported);
    assert_eq!(status(3).await, MapStatus::Ignored);
}

async fn needing_update_batches_drain_without_repeats<S: IdMapStore>(map: IdMap<S>) {
    for id in [5, 3, 1, 4, 2] {
        map.upsert(&src(id), Some(&dst(id)), MapStatus::NeedsUpdate, RollbackAction::Delete)
            .await
            .unwrap();
    }

    let first = map.get_rows_needing_update(2).await.unwrap();
    let first_ids: Vec<i64> = first.iter().map(|r| id_of(&r.source)).collect();
    assert_eq!(first_ids, vec![1, 2]);
    for row in &first {
        map.import(&row.source, row.destination.as_ref().unwrap())
            .await
            .unwrap();
    }

    let second = map.get_rows_needing_update(2).await.unwrap();
    let second_ids: Vec<i64> = second.iter().map(|r| id_of(&r.source)).collect();
    assert_eq!(second_ids, vec![3, 4]);
    assert!(second_ids.iter().all(|id| !first_ids.contains(id)));
    for row in &second {
        map.import(&row.source, row.destination.as_ref().unwrap())
            .await
            .unwrap();
    }

    assert_eq!(map.get_rows_needing_update(2).await.unwrap().len(), 1);
    assert!(map.get_rows_needing_update(0).await.unwrap().is_empty());
}

async fn message_for_mapped_row<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(100)).await.unwrap();
    map.record_with_level(&src(1), "field missing", MessageLevel::Warning)
        .await
        .unwrap();

    let messages = map
        .read_all(MessageFilter::for_source(src(1)))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "field missing");
    assert_eq!(messages[0].level, MessageLevel::Warning);
    assert_eq!(messages[0].source, src(1));
}

async fn messages_do_not_require_a_mapping<S: IdMapStore>(map: IdMap<S>) {
    let record = map.record(&src(7), "invalid source row").await.unwrap();
    assert_eq!(record.level, MessageLevel::Error);
    assert_eq!(map.message_count().await.unwrap(), 1);
    assert!(map.get_row_by_source(&src(7)).await.unwrap().is_none());
}

async fn read_all_filters_and_orders<S: IdMapStore>(map: IdMap<S>) {
    map.record(&src(1), "a").await.unwrap();
    map.record_with_level(&src(2), "b", MessageLevel::Notice).await.unwrap();
    map.record_with_level(&src(1), "c", MessageLevel::Notice).await.unwrap();
    map.record(&src(1), "d").await.unwrap();
    map.record(&src(2), "e").await.unwrap();

    let texts = |records: Vec<idmap_core::record::MessageRecord>| -> Vec<String> {
        records.into_iter().map(|m| m.message).collect()
    };

    let all = map.read_all(MessageFilter::all()).unwrap().collect().await.unwrap();
    assert!(all.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(texts(all), ["a", "b", "c", "d", "e"]);

    let for_one = map
        .read_all(MessageFilter::for_source(src(1)))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(texts(for_one), ["a", "c", "d"]);

    let notices = map
        .read_all(MessageFilter::all().with_level(MessageLevel::Notice))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(texts(notices), ["b", "c"]);

    let both = map
        .read_all(MessageFilter::for_source(src(2)).with_level(MessageLevel::Error))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(texts(both), ["e"]);
}

async fn delete_messages_only_keeps_row<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(1)).await.unwrap();
    map.record(&src(1), "x").await.unwrap();
    map.record(&src(2), "y").await.unwrap();

    assert!(!map.delete(&src(1), true).await.unwrap());
    assert!(map.get_row_by_source(&src(1)).await.unwrap().is_some());
    let remaining = map
        .read_all(MessageFilter::for_source(src(1)))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert_eq!(map.message_count().await.unwrap(), 1);

    map.delete_messages(&src(2)).await.unwrap();
    assert_eq!(map.message_count().await.unwrap(), 0);
}

async fn delete_removes_row_and_messages<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(1)).await.unwrap();
    map.record(&src(1), "x").await.unwrap();

    assert!(map.delete(&src(1), false).await.unwrap());
    assert!(map.get_row_by_source(&src(1)).await.unwrap().is_none());
    assert!(map.get_rows_by_destination(&dst(1)).await.unwrap().is_empty());
    assert_eq!(map.message_count().await.unwrap(), 0);
    assert!(!map.delete(&src(1), false).await.unwrap());
}

async fn delete_bulk_removes_every_key<S: IdMapStore>(map: IdMap<S>) {
    for id in 1..=3 {
        map.import(&src(id), &dst(id)).await.unwrap();
        map.record(&src(id), "m").await.unwrap();
    }

    let removed = map
        .delete_bulk([src(1), src(2), src(2), src(99)])
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(map.get_row_by_source(&src(1)).await.unwrap().is_none());
    assert!(map.get_row_by_source(&src(2)).await.unwrap().is_none());
    assert!(map.get_row_by_source(&src(3)).await.unwrap().is_some());
    assert_eq!(map.message_count().await.unwrap(), 1);
    assert_eq!(map.delete_bulk(Vec::new()).await.unwrap(), 0);
}

async fn shared_destination_is_ambiguous_and_deletable<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(2), &dst(50)).await.unwrap();
    map.import(&src(1), &dst(50)).await.unwrap();
    map.import(&src(3), &dst(60)).await.unwrap();
    map.record(&src(1), "one").await.unwrap();
    map.record(&src(3), "three").await.unwrap();

    assert_matches!(
        map.lookup_source_id(&dst(50)).await.unwrap(),
        SourceLookup::Ambiguous(candidates) if candidates == vec![src(1), src(2)]
    );
    assert_eq!(map.get_rows_by_destination(&dst(50)).await.unwrap().len(), 2);

    assert_eq!(map.delete_destination(&dst(50)).await.unwrap(), 2);
    assert_eq!(map.lookup_source_id(&dst(50)).await.unwrap(), SourceLookup::NotFound);
    assert!(map.get_row_by_source(&src(3)).await.unwrap().is_some());
    let left = map.read_all(MessageFilter::all()).unwrap().collect().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].source, src(3));
}

async fn clear_messages_empties_log<S: IdMapStore>(map: IdMap<S>) {
    for id in 1..=4 {
        map.record(&src(id), "m").await.unwrap();
    }
    assert_eq!(map.clear_messages().await.unwrap(), 4);
    assert_eq!(map.message_count().await.unwrap(), 0);

    let next = map.record(&src(1), "after clear").await.unwrap();
    let all = map.read_all(MessageFilter::all()).unwrap().collect().await.unwrap();
    assert_eq!(all, vec![next]);
}

async fn cursor_walks_snapshot_in_order<S: IdMapStore>(map: IdMap<S>) {
    for id in [3, 1, 4, 2] {
        map.import(&src(id), &dst(id * 10)).await.unwrap();
    }

    let mut cursor = map.cursor().await.unwrap();
    assert!(cursor.current().unwrap().is_none());
    assert_eq!(cursor.remaining(), 4);

    assert!(cursor.advance().await.unwrap());
    assert_eq!(cursor.current_source().unwrap(), Some(&src(1)));
    assert_eq!(cursor.current_destination().unwrap(), Some(&dst(10)));

    // Deleted after the snapshot: skipped. Added after: not visited.
    map.delete(&src(2), false).await.unwrap();
    map.import(&src(0), &dst(0)).await.unwrap();

    let mut seen = vec![1];
    while cursor.advance().await.unwrap() {
        seen.push(id_of(cursor.current_source().unwrap().unwrap()));
    }
    assert_eq!(seen, vec![1, 3, 4]);
    assert!(cursor.current().unwrap().is_none());

    cursor.rewind().await.unwrap();
    assert!(cursor.advance().await.unwrap());
    assert_eq!(cursor.current_source().unwrap(), Some(&src(0)));
}

async fn destroy_invalidates_cursors_and_empties_storage<S: IdMapStore>(map: IdMap<S>) {
    map.import(&src(1), &dst(1)).await.unwrap();
    map.import(&src(2), &dst(2)).await.unwrap();
    map.record(&src(1), "m").await.unwrap();

    let mut cursor = map.cursor().await.unwrap();
    assert!(cursor.advance().await.unwrap());

    map.destroy().await.unwrap();

    assert_matches!(cursor.advance().await, Err(IdMapError::CursorInvalidated { .. }));
    assert_matches!(cursor.current(), Err(IdMapError::CursorInvalidated { .. }));

    let summary = map.aggregator().summary().await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.messages, 0);

    // Storage is usable again after a destroy.
    map.import(&src(3), &dst(3)).await.unwrap();
    assert_eq!(map.aggregator().processed_count().await.unwrap(), 1);
}

async fn malformed_keys_are_validation_errors<S: IdMapStore>(map: IdMap<S>) {
    let two_part = SourceKey::from([KeyValue::from(1), KeyValue::from(2)]);
    let err = map.import(&two_part, &dst(1)).await.unwrap_err();
    assert!(err.is_validation());

    let text_dest = idmap_core::key::DestinationKey::from([KeyValue::from("x")]);
    let err = map.import(&src(1), &text_dest).await.unwrap_err();
    assert!(err.is_validation());

    assert!(map.lookup_destination_id(&two_part).await.unwrap_err().is_validation());
    assert!(map.delete_bulk([src(1), two_part]).await.unwrap_err().is_validation());
    assert_eq!(map.aggregator().processed_count().await.unwrap(), 0);
}

async fn row_hash_drives_change_detection<S: IdMapStore>(map: IdMap<S>) {
    let original = SourceRecord::new(src(1), json!({"title": "Hello"}));
    assert!(map.has_changed(&original).await.unwrap());

    map.save_id_mapping(&original, Some(&dst(1)), MapStatus::Imported, RollbackAction::Delete)
        .await
        .unwrap();
    let row = map.get_row_by_source(&src(1)).await.unwrap().unwrap();
    assert!(row.hash.is_some());
    assert!(!map.has_changed(&original).await.unwrap());

    let edited = SourceRecord::new(src(1), json!({"title": "Hello, world"}));
    assert!(map.has_changed(&edited).await.unwrap());
}

async fn text_destinations_sharing_a_prefix_stay_distinct<S: IdMapStore>(map: IdMap<S>) {
    let plain = text_dst("a");
    let nulled = text_dst("a\0b");
    map.import(&src(1), &plain).await.unwrap();
    map.import(&src(2), &nulled).await.unwrap();
    map.record(&src(2), "kept").await.unwrap();

    let rows = map.get_rows_by_destination(&plain).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].source, src(1));
    assert_eq!(map.lookup_source_id(&plain).await.unwrap(), SourceLookup::Found(src(1)));
    assert_eq!(map.lookup_source_id(&nulled).await.unwrap(), SourceLookup::Found(src(2)));

    assert_eq!(map.delete_destination(&plain).await.unwrap(), 1);
    assert!(map.get_row_by_source(&src(1)).await.unwrap().is_none());
    assert_eq!(map.lookup_destination_id(&src(2)).await.unwrap(), Some(nulled));
    assert_eq!(map.message_count().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Instantiation per backend
// ---------------------------------------------------------------------------

macro_rules! contract_tests {
    ($backend:ident, $make:path, $make_text:path) => {
        mod $backend {
            use super::*;

            contract_tests!(@each $make_text;
                text_destinations_sharing_a_prefix_stay_distinct,
            );

            contract_tests!(@each $make;
                upsert_then_lookup,
                unmapped_keys_are_not_errors,
                repeated_upsert_overwrites_in_place,
                failed_row_without_destination,
                prepare_update_moves_imported_and_failed,
                three_imported_rows_prepare_update,
                set_update_targets_one_row,
                needing_update_batches_drain_without_repeats,
                message_for_mapped_row,
                messages_do_not_require_a_mapping,
                read_all_filters_and_orders,
                delete_messages_only_keeps_row,
                delete_removes_row_and_messages,
                delete_bulk_removes_every_key,
                shared_destination_is_ambiguous_and_deletable,
                clear_messages_empties_log,
                cursor_walks_snapshot_in_order,
                destroy_invalidates_cursors_and_empties_storage,
                malformed_keys_are_validation_errors,
                row_hash_drives_change_detection,
            );
        }
    };
    (@each $make:path; $($scenario:ident),+ $(,)?) => {
        $(
            #[tokio::test]
            async fn $scenario() {
                super::$scenario($make()).await;
            }
        )+
    };
}

contract_tests!(in_memory, common::memory_map, common::memory_text_map);
contract_tests!(key_value, common::kv_map, common::kv_text_map);
