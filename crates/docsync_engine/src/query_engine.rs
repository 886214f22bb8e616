//! Local query evaluation.

use docsync_model::{Document, Query};

/// Evaluates a query over candidate documents.
///
/// Keeps documents that match the path and every filter and carry every
/// order-by field, sorts them by the ordering clauses with the document key
/// as the final tie-break, then applies the limit. The output depends only
/// on the inputs, never on their order.
#[must_use]
pub fn evaluate(query: &Query, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut results: Vec<Document> = documents
        .into_iter()
        .filter(|doc| query.matches(doc))
        .collect();
    results.sort_by(|a, b| query.compare(a, b));
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::{
        Direction, DocumentKey, Fields, FilterOp, SnapshotVersion, Value,
    };
    use proptest::prelude::*;

    fn doc(path: &str, json: serde_json::Value) -> Document {
        let fields = match Value::from(json) {
            Value::Map(m) => m,
            _ => Fields::new(),
        };
        Document::found(DocumentKey::parse(path).unwrap(), SnapshotVersion::new(1), fields)
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.key.id()).collect()
    }

    #[test]
    fn filter_and_descending_order_breaks_ties_by_key() {
        let docs = vec![
            doc("rooms/eros/messages/1", serde_json::json!({"filter": true, "sort": 1})),
            doc("rooms/eros/messages/2", serde_json::json!({"filter": true, "sort": 2})),
            doc("rooms/eros/messages/3", serde_json::json!({"filter": true, "sort": 2})),
            doc("rooms/eros/messages/4", serde_json::json!({"filter": false, "sort": 3})),
        ];
        let query = Query::collection("rooms/eros/messages")
            .unwrap()
            .filter("filter", FilterOp::Equal, true)
            .order_by("sort", Direction::Descending);
        assert_eq!(ids(&evaluate(&query, docs)), vec!["2", "3", "1"]);
    }

    #[test]
    fn missing_order_field_excludes_document() {
        let docs = vec![
            doc("items/a", serde_json::json!({"rank": 2})),
            doc("items/b", serde_json::json!({"name": "no rank"})),
            doc("items/c", serde_json::json!({"rank": 1})),
        ];
        let query = Query::collection("items")
            .unwrap()
            .order_by("rank", Direction::Ascending);
        assert_eq!(ids(&evaluate(&query, docs)), vec!["c", "a"]);
    }

    #[test]
    fn limit_applies_after_sort() {
        let docs = (0..10).map(|i| doc(&format!("items/{i}"), serde_json::json!({"n": i})));
        let query = Query::collection("items")
            .unwrap()
            .order_by("n", Direction::Descending)
            .limit(3);
        assert_eq!(ids(&evaluate(&query, docs)), vec!["9", "8", "7"]);
    }

    #[test]
    fn only_immediate_children_and_existing_documents() {
        let docs = vec![
            doc("items/a", serde_json::json!({})),
            doc("items/a/sub/b", serde_json::json!({})),
            doc("other/c", serde_json::json!({})),
            Document::deleted(DocumentKey::parse("items/d").unwrap(), SnapshotVersion::new(2)),
        ];
        let query = Query::collection("items").unwrap();
        assert_eq!(ids(&evaluate(&query, docs)), vec!["a"]);
    }

    #[test]
    fn document_query_returns_single_key() {
        let key = DocumentKey::parse("items/b").unwrap();
        let docs = vec![
            doc("items/a", serde_json::json!({})),
            doc("items/b", serde_json::json!({})),
        ];
        assert_eq!(ids(&evaluate(&Query::document(&key), docs)), vec!["b"]);
    }

    #[test]
    fn in_and_array_contains() {
        let docs = vec![
            doc("items/a", serde_json::json!({"tag": "x", "tags": ["red", "blue"]})),
            doc("items/b", serde_json::json!({"tag": "y", "tags": ["green"]})),
            doc("items/c", serde_json::json!({"tag": "z", "tags": []})),
        ];
        let in_query = Query::collection("items").unwrap().filter(
            "tag",
            FilterOp::In,
            Value::Array(vec![Value::from("x"), Value::from("z")]),
        );
        assert_eq!(ids(&evaluate(&in_query, docs.clone())), vec!["a", "c"]);

        let contains = Query::collection("items")
            .unwrap()
            .filter("tags", FilterOp::ArrayContains, "green");
        assert_eq!(ids(&evaluate(&contains, docs)), vec!["b"]);
    }

    #[test]
    fn mixed_numbers_sort_exactly() {
        let big = 1i64 << 53;
        let docs = vec![
            doc_with("items/a", Value::Integer(big + 1)),
            doc_with("items/b", Value::Double(big as f64)),
            doc_with("items/c", Value::Integer(big)),
        ];
        let query = Query::collection("items")
            .unwrap()
            .order_by("n", Direction::Ascending);
        let forward = evaluate(&query, docs.clone());
        let backward = evaluate(&query, docs.into_iter().rev());
        assert_eq!(ids(&forward), vec!["b", "c", "a"]);
        assert_eq!(forward, backward);
    }

    fn doc_with(path: &str, n: Value) -> Document {
        let mut fields = Fields::new();
        fields.insert("n".into(), n);
        Document::found(DocumentKey::parse(path).unwrap(), SnapshotVersion::new(1), fields)
    }

    fn rank_strategy() -> impl Strategy<Value = Value> {
        let big = 1i64 << 53;
        prop_oneof![
            (0i64..5).prop_map(Value::Integer),
            (0i64..5).prop_map(|r| Value::Double(r as f64 + 0.5)),
            (0i64..3).prop_map(move |r| Value::Integer(big + r)),
            (0i64..3).prop_map(move |r| Value::Double((big + 2 * r) as f64)),
        ]
    }

    proptest! {
        #[test]
        fn evaluation_ignores_input_order(
            ranks in proptest::collection::vec(rank_strategy(), 1..20),
            seed in any::<u64>(),
        ) {
            let docs: Vec<Document> = ranks
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let mut fields = Fields::new();
                    fields.insert("rank".into(), r.clone());
                    Document::found(
                        DocumentKey::parse(&format!("items/{i:03}")).unwrap(),
                        SnapshotVersion::new(1),
                        fields,
                    )
                })
                .collect();
            let mut shuffled = docs.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = (seed as usize).wrapping_mul(31).wrapping_add(i * 17) % len;
                shuffled.swap(i, j);
            }
            let query = Query::collection("items")
                .unwrap()
                .filter("rank", FilterOp::GreaterThanOrEqual, 1)
                .order_by("rank", Direction::Descending)
                .limit(7);
            prop_assert_eq!(evaluate(&query, docs), evaluate(&query, shuffled));
        }
    }
}
