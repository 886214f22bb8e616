//! Property-based test generators using proptest.
//!
//! Strategies produce valid keys, field values, documents, mutations and
//! queries over a small id space so generated operations collide often.

use docsync_model::{
    Direction, Document, DocumentKey, Fields, FilterOp, Mutation, Patch, Query, ResourcePath,
    SnapshotVersion, Value,
};
use proptest::prelude::*;

/// Strategy for document ids drawn from a small fixed set.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e", "f"]).prop_map(str::to_string)
}

/// Strategy for scalar field values (no NaN).
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-100i64..100).prop_map(Value::Integer),
        (-100.0f64..100.0).prop_map(Value::Double),
        prop::string::string_regex("[a-z]{0,8}")
            .expect("Invalid regex")
            .prop_map(Value::Text),
    ]
}

/// Strategy for document fields over a few well-known names.
pub fn fields_strategy() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map(
        prop::sample::select(vec!["rank", "name", "flag", "score"]).prop_map(str::to_string),
        scalar_value_strategy(),
        0..4,
    )
}

/// Strategy for existing documents in `collection`.
pub fn document_strategy(collection: ResourcePath) -> impl Strategy<Value = Document> {
    (document_id_strategy(), 1u64..50, fields_strategy()).prop_map(move |(id, version, fields)| {
        let key = DocumentKey::new_in(&collection, &id).expect("valid document id");
        Document::found(key, SnapshotVersion::new(version), fields)
    })
}

/// Strategy for set, patch and delete mutations in `collection`.
pub fn mutation_strategy(collection: ResourcePath) -> impl Strategy<Value = Mutation> {
    let key = document_id_strategy().prop_map(move |id| {
        DocumentKey::new_in(&collection, &id).expect("valid document id")
    });
    (key, 0u8..3, fields_strategy()).prop_map(|(key, kind, fields)| match kind {
        0 => Mutation::set(key, fields),
        1 => {
            let patch: Patch = fields
                .into_iter()
                .map(|(name, value)| (name.as_str().into(), Some(value)))
                .collect();
            Mutation::patch(key, patch)
        }
        _ => Mutation::delete(key),
    })
}

/// Strategy for valid queries over `collection`: an optional equality or
/// range filter on `rank`, an optional ordering and an optional limit.
pub fn query_strategy(collection: ResourcePath) -> impl Strategy<Value = Query> {
    (
        prop::option::of((
            prop::sample::select(vec![
                FilterOp::Equal,
                FilterOp::NotEqual,
                FilterOp::LessThan,
                FilterOp::GreaterThanOrEqual,
            ]),
            -100i64..100,
        )),
        prop::option::of(any::<bool>()),
        prop::option::of(1usize..5),
    )
        .prop_map(move |(filter, order, limit)| {
            let mut query = Query::at_collection(collection.clone());
            if let Some((op, bound)) = filter {
                query = query.filter("rank", op, bound);
            }
            if let Some(descending) = order {
                let direction = if descending {
                    Direction::Descending
                } else {
                    Direction::Ascending
                };
                query = query.order_by("rank", direction);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            query
        })
}
