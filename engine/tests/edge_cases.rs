//! Edge case tests for docsync-engine
//!
//! These tests cover boundary conditions and unusual inputs for the local
//! query engine.

use docsync_engine::{evaluate, Document, Error, Query, UNBOUNDED_LIMIT};
use proptest::prelude::*;
use serde_json::{json, Value};

fn numbered(count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| json!({"_id": format!("doc-{i:03}"), "n": (i * 7) % 5, "i": i}))
        .collect()
}

fn ids(docs: &[Value]) -> Vec<String> {
    docs.iter()
        .map(|d| d["_id"].as_str().unwrap().to_string())
        .collect()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_equality_and_regex() {
    let docs = vec![
        json!({"_id": "1", "name": "日本語テスト"}),
        json!({"_id": "2", "name": "Привет мир"}),
        json!({"_id": "3", "name": "🎉🚀"}),
    ];

    let result = evaluate(docs.clone(), &Query::new().equal_to("name", "Привет мир")).unwrap();
    assert_eq!(ids(&result), vec!["2"]);

    let query = Query::new().matches("name", "^日本").unwrap();
    assert_eq!(ids(&evaluate(docs, &query).unwrap()), vec!["1"]);
}

#[test]
fn empty_string_sorts_first_among_strings() {
    let docs = vec![
        json!({"_id": "a", "s": "b"}),
        json!({"_id": "b", "s": ""}),
        json!({"_id": "c"}),
    ];
    let result = evaluate(docs, &Query::new().ascending("s")).unwrap();
    assert_eq!(ids(&result), vec!["b", "a", "c"]);
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integers_and_floats_compare_numerically() {
    let docs = vec![
        json!({"_id": "1", "v": 1}),
        json!({"_id": "2", "v": 1.5}),
        json!({"_id": "3", "v": -2}),
    ];
    let result = evaluate(docs, &Query::new().greater_than_or_equal_to("v", 1.0)).unwrap();
    assert_eq!(ids(&result), vec!["1", "2"]);
}

#[test]
fn nan_operand_is_invalid() {
    let query = Query::new().less_than("v", f64::NAN);
    let err = evaluate(Vec::new(), &query).unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

#[test]
fn raw_comparison_with_object_operand_is_invalid() {
    let filter = json!({"v": {"$gt": {"x": 1}}});
    let query = Query::from_filter(filter.as_object().unwrap().clone());
    let err = evaluate(numbered(3), &query).unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
}

// ============================================================================
// Paging Edge Cases
// ============================================================================

#[test]
fn zero_limit_returns_nothing() {
    let result = evaluate(numbered(5), &Query::new().with_limit(0)).unwrap();
    assert!(result.is_empty());
}

#[test]
fn unbounded_limit_with_large_skip() {
    let query = Query::new().with_skip(3).with_limit(UNBOUNDED_LIMIT);
    let result = evaluate(numbered(5), &query).unwrap();
    assert_eq!(ids(&result), vec!["doc-003", "doc-004"]);
}

#[test]
fn documents_round_trip_through_evaluation() {
    let mut doc = Document::new().set("title", "Draft");
    doc.mark_local("local-1");

    let result = evaluate(
        vec![doc.to_value().unwrap()],
        &Query::new().equal_to("_kmd.local", true),
    )
    .unwrap();
    let back = Document::from_value(result[0].clone()).unwrap();
    assert_eq!(back, doc);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_equality_selects_exact_subset(
        values in proptest::collection::vec(0i64..5, 0..40),
        target in 0i64..5,
    ) {
        let docs: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, v)| json!({"_id": i.to_string(), "v": v}))
            .collect();

        let query = Query::new().equal_to("v", target);
        let result = evaluate(docs.clone(), &query).unwrap();

        let expected: Vec<Value> = docs.into_iter().filter(|d| d["v"] == json!(target)).collect();
        prop_assert_eq!(result, expected);
    }

    #[test]
    fn prop_window_is_slice_of_sorted_result(
        count in 0usize..60,
        skip in 0usize..70,
        limit in 0usize..70,
    ) {
        let docs = numbered(count);
        let base = Query::new().less_than("n", 4).descending("n").ascending("i");

        let full = evaluate(docs.clone(), &base).unwrap();
        let windowed = evaluate(docs, &base.clone().with_skip(skip).with_limit(limit)).unwrap();

        let expected: Vec<Value> = full.into_iter().skip(skip).take(limit).collect();
        prop_assert_eq!(windowed, expected);
    }

    #[test]
    fn prop_unanchored_patterns_rejected(pattern in "[a-z]{1,8}") {
        prop_assert!(matches!(
            Query::new().matches("name", &pattern),
            Err(Error::InvalidQuery(_))
        ));

        let filter = json!({"name": {"$regex": pattern}});
        let query = Query::from_filter(filter.as_object().unwrap().clone());
        prop_assert!(matches!(evaluate(Vec::new(), &query), Err(Error::InvalidQuery(_))));
    }
}
