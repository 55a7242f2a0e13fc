//! Structured queries.
//!
//! A [`Query`] carries a filter tree in the remote API's JSON shape
//! (`field -> value` or `field -> {"$op": operand}` plus `$and`/`$or`/`$nor`
//! joins), an ordered sort specification, a field projection and paging.
//!
//! Joins follow operator precedence: `$and` binds tighter than `$nor`, which
//! binds tighter than `$or`. The argument-less join methods
//! ([`Query::and_where`], [`Query::or_where`], [`Query::nor_where`]) open a
//! child query linked to its owner; joining a lower-precedence operator onto
//! such a child re-parents the join onto the owner instead of nesting it
//! inside the child.
//!
//! ```rust
//! use docsync_engine::Query;
//! use serde_json::json;
//!
//! let query = Query::new()
//!     .equal_to("genre", "sf")
//!     .and_where()
//!     .greater_than("pages", 300)
//!     .or(Query::new().equal_to("featured", true))
//!     .into_root();
//!
//! assert_eq!(
//!     serde_json::Value::Object(query.filter().clone()),
//!     json!({"$or": [
//!         {"$and": [{"genre": "sf"}, {"pages": {"$gt": 300}}]},
//!         {"featured": true}
//!     ]})
//! );
//! ```

use crate::error::{Error, Result};
use crate::matcher::is_operator_object;
use serde_json::{Map, Value};
use std::borrow::Cow;

/// Limit value meaning "no limit". Kept as a number so paging arithmetic
/// never has to special-case absence.
pub const UNBOUNDED_LIMIT: usize = usize::MAX;

/// Sort direction for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Wire value: `1` ascending, `-1` descending.
    pub fn as_i64(self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    /// Parse a wire value.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(SortDirection::Ascending),
            -1 => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

/// Logical join operators, in increasing precedence order: `Or`, `Nor`, `And`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOperator {
    And,
    Nor,
    Or,
}

impl JoinOperator {
    /// Filter key of the operator.
    pub fn key(self) -> &'static str {
        match self {
            JoinOperator::And => "$and",
            JoinOperator::Nor => "$nor",
            JoinOperator::Or => "$or",
        }
    }
}

/// Operand of an ordering comparison: a number or a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparable(Value);

impl Comparable {
    fn into_value(self) -> Value {
        self.0
    }
}

macro_rules! comparable_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Comparable {
            fn from(value: $ty) -> Self {
                Comparable(Value::from(value))
            }
        })*
    };
}

// f64 NaN/inf turn into null and are rejected when the query is evaluated
comparable_from!(i32, i64, u32, u64, f64, &str, String);

#[derive(Debug, Clone, PartialEq)]
struct OpenJoin {
    owner: Query,
    operator: JoinOperator,
}

/// A structured query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    filter: Map<String, Value>,
    sort: Vec<(String, SortDirection)>,
    fields: Vec<String>,
    skip: usize,
    limit: usize,
    parent: Option<Box<OpenJoin>>,
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl Query {
    /// An empty query matching every document.
    pub fn new() -> Self {
        Self {
            filter: Map::new(),
            sort: Vec::new(),
            fields: Vec::new(),
            skip: 0,
            limit: UNBOUNDED_LIMIT,
            parent: None,
        }
    }

    /// A query over a raw filter object.
    pub fn from_filter(filter: Map<String, Value>) -> Self {
        Self {
            filter,
            ..Self::new()
        }
    }

    /// Filter of this query node.
    pub fn filter(&self) -> &Map<String, Value> {
        &self.filter
    }

    /// Sort keys in priority order.
    pub fn sort(&self) -> &[(String, SortDirection)] {
        &self.sort
    }

    /// Projected fields; empty means all fields.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of documents skipped.
    pub fn skip(&self) -> usize {
        self.skip
    }

    /// Maximum number of documents returned.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether skip or limit restrict the result window.
    pub fn is_paged(&self) -> bool {
        self.skip > 0 || self.limit != UNBOUNDED_LIMIT
    }

    /// Whether this query is an open child of another query.
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    // ------------------------------------------------------------------
    // Paging, sorting, projection
    // ------------------------------------------------------------------

    /// Skip the first `skip` matching documents.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Return at most `limit` documents.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Only keep the given fields (plus `_id` and `_acl`).
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sort ascending on `field`, after any existing sort keys.
    pub fn ascending(self, field: impl Into<String>) -> Self {
        self.sort_on(field.into(), SortDirection::Ascending)
    }

    /// Sort descending on `field`, after any existing sort keys.
    pub fn descending(self, field: impl Into<String>) -> Self {
        self.sort_on(field.into(), SortDirection::Descending)
    }

    fn sort_on(mut self, field: String, direction: SortDirection) -> Self {
        match self.sort.iter_mut().find(|(key, _)| *key == field) {
            Some(entry) => entry.1 = direction,
            None => self.sort.push((field, direction)),
        }
        self
    }

    // ------------------------------------------------------------------
    // Predicates
    // ------------------------------------------------------------------

    /// `field == value`.
    pub fn equal_to(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    /// `field != value`.
    pub fn not_equal_to(self, field: &str, value: impl Into<Value>) -> Self {
        self.add_condition(field, "$ne", value.into())
    }

    /// `field` equals one of `values`.
    pub fn contained_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.add_condition(field, "$in", collect_array(values))
    }

    /// `field` equals none of `values`.
    pub fn not_contained_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.add_condition(field, "$nin", collect_array(values))
    }

    /// Array `field` contains every one of `values`.
    pub fn contains_all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.add_condition(field, "$all", collect_array(values))
    }

    pub fn greater_than(self, field: &str, value: impl Into<Comparable>) -> Self {
        self.add_condition(field, "$gt", value.into().into_value())
    }

    pub fn greater_than_or_equal_to(self, field: &str, value: impl Into<Comparable>) -> Self {
        self.add_condition(field, "$gte", value.into().into_value())
    }

    pub fn less_than(self, field: &str, value: impl Into<Comparable>) -> Self {
        self.add_condition(field, "$lt", value.into().into_value())
    }

    pub fn less_than_or_equal_to(self, field: &str, value: impl Into<Comparable>) -> Self {
        self.add_condition(field, "$lte", value.into().into_value())
    }

    /// `field` is present (or absent when `exists` is false).
    pub fn exists(self, field: &str, exists: bool) -> Self {
        self.add_condition(field, "$exists", Value::Bool(exists))
    }

    /// `field % divisor == remainder`.
    pub fn modulus(self, field: &str, divisor: i64, remainder: i64) -> Self {
        self.add_condition(field, "$mod", Value::from(vec![divisor, remainder]))
    }

    /// String `field` matches `pattern`.
    ///
    /// The pattern must start with `^`: anchored patterns are the only ones
    /// the remote side can answer from an index, so local evaluation
    /// refuses anything else.
    pub fn matches(self, field: &str, pattern: &str) -> Result<Self> {
        if !pattern.starts_with('^') {
            return Err(Error::InvalidQuery(format!(
                "regular expression for '{field}' must start with ^"
            )));
        }
        regex::Regex::new(pattern).map_err(|e| Error::InvalidQuery(e.to_string()))?;
        Ok(self.add_condition(field, "$regex", Value::from(pattern)))
    }

    /// Point `field` lies within `max_distance` miles of `[longitude, latitude]`.
    pub fn near(self, field: &str, coordinates: [f64; 2], max_distance: Option<f64>) -> Self {
        let query = self.add_condition(field, "$nearSphere", point(coordinates));
        match max_distance {
            Some(distance) => query.add_condition(field, "$maxDistance", Value::from(distance)),
            None => query,
        }
    }

    /// Point `field` lies inside the box spanned by two corners.
    pub fn within_box(self, field: &str, bottom_left: [f64; 2], upper_right: [f64; 2]) -> Self {
        let mut shape = Map::new();
        shape.insert(
            "$box".to_string(),
            Value::Array(vec![point(bottom_left), point(upper_right)]),
        );
        self.add_condition(field, "$geoWithin", Value::Object(shape))
    }

    /// Point `field` lies inside the polygon.
    pub fn within_polygon<I>(self, field: &str, coordinates: I) -> Self
    where
        I: IntoIterator<Item = [f64; 2]>,
    {
        let mut shape = Map::new();
        shape.insert(
            "$polygon".to_string(),
            Value::Array(coordinates.into_iter().map(point).collect()),
        );
        self.add_condition(field, "$geoWithin", Value::Object(shape))
    }

    /// Array `field` has exactly `size` elements.
    pub fn size(self, field: &str, size: usize) -> Self {
        self.add_condition(field, "$size", Value::from(size))
    }

    fn add_condition(mut self, field: &str, operator: &str, operand: Value) -> Self {
        let entry = self
            .filter
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !is_operator_object(entry) {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(conditions) = entry {
            conditions.insert(operator.to_string(), operand);
        }
        self
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    /// Join `other` with `$and`. Only the filter of `other` is kept.
    pub fn and(self, other: Query) -> Self {
        self.join(JoinOperator::And, vec![other])
    }

    /// Join every query in `others` with `$and`.
    pub fn and_all(self, others: impl IntoIterator<Item = Query>) -> Self {
        self.join(JoinOperator::And, others.into_iter().collect())
    }

    /// Open an `$and` child; conditions added to the returned query are
    /// joined onto this one.
    pub fn and_where(self) -> Self {
        self.open(JoinOperator::And)
    }

    /// Join `other` with `$nor`.
    pub fn nor(self, other: Query) -> Self {
        if self.parent_operator() == Some(JoinOperator::And) {
            return self.end().nor(other);
        }
        self.join(JoinOperator::Nor, vec![other])
    }

    /// Open a `$nor` child.
    pub fn nor_where(self) -> Self {
        if self.parent_operator() == Some(JoinOperator::And) {
            return self.end().nor_where();
        }
        self.open(JoinOperator::Nor)
    }

    /// Join `other` with `$or`.
    pub fn or(self, other: Query) -> Self {
        if self.parent.is_some() {
            return self.end().or(other);
        }
        self.join(JoinOperator::Or, vec![other])
    }

    /// Join every query in `others` with `$or`.
    pub fn or_all(self, others: impl IntoIterator<Item = Query>) -> Self {
        if self.parent.is_some() {
            return self.end().or_all(others);
        }
        self.join(JoinOperator::Or, others.into_iter().collect())
    }

    /// Open an `$or` child.
    pub fn or_where(self) -> Self {
        if self.parent.is_some() {
            return self.end().or_where();
        }
        self.open(JoinOperator::Or)
    }

    /// Close an open child and return its owner. A query without an owner
    /// is returned unchanged.
    pub fn end(mut self) -> Query {
        match self.parent.take() {
            None => self,
            Some(join) => {
                let OpenJoin {
                    mut owner,
                    operator,
                } = *join;
                let current = std::mem::take(&mut owner.filter);
                owner.filter = joined(current, operator, vec![Value::Object(self.filter)]);
                owner
            }
        }
    }

    /// Close every open child up to the outermost query.
    pub fn into_root(self) -> Query {
        let mut query = self;
        while query.parent.is_some() {
            query = query.end();
        }
        query
    }

    /// The outermost query, borrowed when there is nothing to close.
    pub fn resolved(&self) -> Cow<'_, Query> {
        if self.parent.is_some() {
            Cow::Owned(self.clone().into_root())
        } else {
            Cow::Borrowed(self)
        }
    }

    fn parent_operator(&self) -> Option<JoinOperator> {
        self.parent.as_ref().map(|join| join.operator)
    }

    fn join(mut self, operator: JoinOperator, others: Vec<Query>) -> Self {
        let others = others
            .into_iter()
            .map(|query| Value::Object(query.into_root().filter))
            .collect();
        let current = std::mem::take(&mut self.filter);
        self.filter = joined(current, operator, others);
        self
    }

    fn open(self, operator: JoinOperator) -> Self {
        let mut child = Query::new();
        child.parent = Some(Box::new(OpenJoin {
            owner: self,
            operator,
        }));
        child
    }

    // ------------------------------------------------------------------
    // Derived forms
    // ------------------------------------------------------------------

    /// Rewrite every filter and sort field as `prefix + field`.
    ///
    /// Used to run a document query against records that hold the document
    /// in a sub-object. The projection is not carried over.
    pub fn with_field_prefix(&self, prefix: &str) -> Query {
        let root = self.resolved();
        Query {
            filter: prefix_filter(&root.filter, prefix),
            sort: root
                .sort
                .iter()
                .map(|(field, direction)| (format!("{prefix}{field}"), *direction))
                .collect(),
            fields: Vec::new(),
            skip: root.skip,
            limit: root.limit,
            parent: None,
        }
    }

    /// Canonical cache key over filter, sort and fields.
    ///
    /// Paged queries have no fingerprint: their result window depends on
    /// documents outside it, so they are never eligible for delta sync.
    pub fn fingerprint(&self) -> Option<String> {
        let root = self.resolved();
        if root.is_paged() {
            return None;
        }

        let mut fields = root.fields.clone();
        fields.sort();
        fields.dedup();

        let sort = root
            .sort
            .iter()
            .map(|(field, direction)| {
                Value::Array(vec![
                    Value::from(field.as_str()),
                    Value::from(direction.as_i64()),
                ])
            })
            .collect::<Vec<_>>();

        let mut key = Map::new();
        key.insert("fields".to_string(), Value::from(fields));
        key.insert("filter".to_string(), Value::Object(root.filter.clone()));
        key.insert("sort".to_string(), Value::Array(sort));

        let mut out = String::new();
        write_canonical(&Value::Object(key), &mut out);
        Some(out)
    }

    /// Query string parameters understood by the remote collection API.
    pub fn to_query_params(&self) -> Vec<(&'static str, String)> {
        let root = self.resolved();
        let mut params = Vec::new();

        if !root.filter.is_empty() {
            params.push(("query", Value::Object(root.filter.clone()).to_string()));
        }
        if !root.fields.is_empty() {
            params.push(("fields", root.fields.join(",")));
        }
        if !root.sort.is_empty() {
            // Written by hand so multi-key order survives.
            let keys = root
                .sort
                .iter()
                .map(|(field, direction)| {
                    format!("{}:{}", Value::from(field.as_str()), direction.as_i64())
                })
                .collect::<Vec<_>>();
            params.push(("sort", format!("{{{}}}", keys.join(","))));
        }
        if root.skip > 0 {
            params.push(("skip", root.skip.to_string()));
        }
        if root.limit != UNBOUNDED_LIMIT {
            params.push(("limit", root.limit.to_string()));
        }

        params
    }
}

fn collect_array<I, V>(values: I) -> Value
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Value::Array(values.into_iter().map(Into::into).collect())
}

fn point(coordinates: [f64; 2]) -> Value {
    Value::Array(vec![
        Value::from(coordinates[0]),
        Value::from(coordinates[1]),
    ])
}

fn joined(
    current: Map<String, Value>,
    operator: JoinOperator,
    others: Vec<Value>,
) -> Map<String, Value> {
    let mut members = Vec::with_capacity(others.len() + 1);
    // An empty left-hand side would make `$or` match everything.
    if !current.is_empty() {
        members.push(Value::Object(current));
    }
    members.extend(others);

    let mut filter = Map::new();
    filter.insert(operator.key().to_string(), Value::Array(members));
    filter
}

fn prefix_filter(filter: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
    filter
        .iter()
        .map(|(key, value)| match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let members = match value {
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(inner) => Value::Object(prefix_filter(inner, prefix)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                (key.clone(), members)
            }
            _ if key.starts_with('$') => (key.clone(), value.clone()),
            _ => (format!("{prefix}{key}"), value.clone()),
        })
        .collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
