//! Local query evaluation.
//!
//! [`evaluate`] runs a [`Query`] over an in-memory set of documents the way
//! the remote collection would: filter, sort, skip, limit, then project.
//! It is a pure function of its inputs.

use crate::document::PROTECTED_FIELDS;
use crate::error::Result;
use crate::matcher::{compare_values, field_value, Filter};
use crate::query::{Query, SortDirection};
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluate `query` over `documents`.
///
/// Fails with [`Error::InvalidQuery`](crate::Error::InvalidQuery) or
/// [`Error::UnsupportedLocally`](crate::Error::UnsupportedLocally) before
/// looking at any document when the filter cannot be evaluated here.
pub fn evaluate<I>(documents: I, query: &Query) -> Result<Vec<Value>>
where
    I: IntoIterator<Item = Value>,
{
    let query = query.resolved();
    let filter = Filter::compile(query.filter())?;

    let mut matched: Vec<Value> = documents
        .into_iter()
        .filter(|doc| filter.matches(doc))
        .collect();

    sort_documents(&mut matched, query.sort());

    let window = matched.into_iter().skip(query.skip()).take(query.limit());
    Ok(match query.fields() {
        [] => window.collect(),
        fields => window.map(|doc| project(doc, fields)).collect(),
    })
}

/// Whether a single document satisfies the filter of `query`.
pub fn matches(document: &Value, query: &Query) -> Result<bool> {
    let query = query.resolved();
    Ok(Filter::compile(query.filter())?.matches(document))
}

/// Stable multi-key sort.
///
/// A present value always sorts before a missing or null one; the
/// direction only flips the order between two present values.
pub fn sort_documents(documents: &mut [Value], sort: &[(String, SortDirection)]) {
    if sort.is_empty() {
        return;
    }
    documents.sort_by(|a, b| {
        for (field, direction) in sort {
            let ordering = compare_for_sort(
                present(field_value(a, field)),
                present(field_value(b, field)),
                *direction,
            );
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn compare_for_sort(a: Option<&Value>, b: Option<&Value>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ordering = compare_values(a, b);
            match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Drop every top-level key that is neither requested nor protected.
///
/// A dotted field (`address.city`) keeps its top-level key.
fn project(document: Value, fields: &[String]) -> Value {
    match document {
        Value::Object(mut map) => {
            map.retain(|key, _| {
                PROTECTED_FIELDS.contains(&key.as_str())
                    || fields.iter().any(|field| {
                        field == key
                            || field
                                .strip_prefix(key.as_str())
                                .is_some_and(|rest| rest.starts_with('.'))
                    })
            });
            Value::Object(map)
        }
        other => other,
    }
}
