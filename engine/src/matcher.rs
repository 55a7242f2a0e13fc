//! Filter compilation and matching.
//!
//! A raw filter object is compiled once into a [`Filter`] tree. Compilation
//! is where every operator and operand is checked, so a query that cannot
//! be evaluated locally fails even against an empty collection.

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::cmp::Ordering;

const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Whether `value` is an operator object (`{"$gt": 1, ...}`) rather than a
/// literal to compare against.
pub(crate) fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.keys().all(|key| key.starts_with('$')),
        _ => false,
    }
}

/// Resolve a dotted path inside a document.
///
/// Numeric segments index into arrays.
pub fn field_value<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Compare two JSON values for equality, numbers by numeric value.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over JSON values: by type first (null, number, string,
/// object, array, bool), then by value.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare_values(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => a.len().cmp(&b.len()),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

/// Ordering comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
        }
    }
}

/// A single check applied to the value found at a field path.
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    All(Vec<Value>),
    Compare(CompareOp, Value),
    Exists(bool),
    Mod { divisor: f64, remainder: f64 },
    Regex(Regex),
    Size(usize),
    WithinBox { min: [f64; 2], max: [f64; 2] },
    WithinPolygon(Vec<[f64; 2]>),
    Near { point: [f64; 2], max_distance: Option<f64> },
}

/// Compiled filter tree.
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, predicates: Vec<Predicate> },
}

impl Filter {
    /// Compile a raw filter object.
    pub fn compile(filter: &Map<String, Value>) -> Result<Filter> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (key, value) in filter {
            let clause = match key.as_str() {
                "$and" => Filter::And(compile_members(key, value)?),
                "$or" => Filter::Or(compile_members(key, value)?),
                "$nor" => Filter::Nor(compile_members(key, value)?),
                other if other.starts_with('$') => {
                    return Err(Error::UnsupportedLocally(other.to_string()))
                }
                path => Filter::Field {
                    path: path.to_string(),
                    predicates: compile_predicates(path, value)?,
                },
            };
            clauses.push(clause);
        }
        Ok(Filter::And(clauses))
    }

    /// Whether the document satisfies the filter.
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(document)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(document)),
            Filter::Nor(clauses) => !clauses.iter().any(|c| c.matches(document)),
            Filter::Field { path, predicates } => {
                let value = field_value(document, path);
                predicates.iter().all(|p| p.test(value))
            }
        }
    }
}

fn compile_members(operator: &str, value: &Value) -> Result<Vec<Filter>> {
    let members = value
        .as_array()
        .ok_or_else(|| Error::InvalidQuery(format!("{operator} expects an array of filters")))?;
    members
        .iter()
        .map(|member| match member {
            Value::Object(inner) => Filter::compile(inner),
            _ => Err(Error::InvalidQuery(format!(
                "{operator} expects an array of filters"
            ))),
        })
        .collect()
}

fn compile_predicates(path: &str, value: &Value) -> Result<Vec<Predicate>> {
    let conditions = match value {
        Value::Object(map) if !map.is_empty() && is_operator_object(value) => map,
        literal => return Ok(vec![Predicate::Eq(literal.clone())]),
    };

    let mut predicates = Vec::with_capacity(conditions.len());
    for (operator, operand) in conditions {
        let predicate = match operator.as_str() {
            "$eq" => Predicate::Eq(operand.clone()),
            "$ne" => Predicate::Ne(operand.clone()),
            "$in" => Predicate::In(array_operand(operator, operand)?),
            "$nin" => Predicate::Nin(array_operand(operator, operand)?),
            "$all" => Predicate::All(array_operand(operator, operand)?),
            "$gt" => Predicate::Compare(CompareOp::Gt, comparable_operand(operator, operand)?),
            "$gte" => Predicate::Compare(CompareOp::Gte, comparable_operand(operator, operand)?),
            "$lt" => Predicate::Compare(CompareOp::Lt, comparable_operand(operator, operand)?),
            "$lte" => Predicate::Compare(CompareOp::Lte, comparable_operand(operator, operand)?),
            "$exists" => match operand {
                Value::Bool(flag) => Predicate::Exists(*flag),
                _ => return Err(invalid(path, "$exists expects a boolean")),
            },
            "$mod" => compile_mod(path, operand)?,
            "$regex" => compile_regex(path, operand, conditions.get("$options"))?,
            "$options" => {
                if !conditions.contains_key("$regex") {
                    return Err(invalid(path, "$options requires $regex"));
                }
                continue;
            }
            "$size" => match operand.as_u64() {
                Some(size) => Predicate::Size(size as usize),
                None => return Err(invalid(path, "$size expects a non-negative integer")),
            },
            "$geoWithin" | "$within" => compile_within(path, operand)?,
            "$nearSphere" => {
                let point = coordinate(operand)
                    .ok_or_else(|| invalid(path, "$nearSphere expects [longitude, latitude]"))?;
                let max_distance = match conditions.get("$maxDistance") {
                    None => None,
                    Some(distance) => match distance.as_f64() {
                        Some(d) if d >= 0.0 => Some(d),
                        _ => return Err(invalid(path, "$maxDistance expects a non-negative number")),
                    },
                };
                Predicate::Near {
                    point,
                    max_distance,
                }
            }
            "$maxDistance" => {
                if !conditions.contains_key("$nearSphere") {
                    return Err(invalid(path, "$maxDistance requires $nearSphere"));
                }
                continue;
            }
            other => return Err(Error::UnsupportedLocally(other.to_string())),
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

fn invalid(path: &str, message: &str) -> Error {
    Error::InvalidQuery(format!("{path}: {message}"))
}

fn array_operand(operator: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| Error::InvalidQuery(format!("{operator} expects an array")))
}

fn comparable_operand(operator: &str, operand: &Value) -> Result<Value> {
    match operand {
        Value::Number(_) | Value::String(_) => Ok(operand.clone()),
        _ => Err(Error::InvalidQuery(format!(
            "{operator} operand must be a number or string"
        ))),
    }
}

fn compile_mod(path: &str, operand: &Value) -> Result<Predicate> {
    let parts = operand
        .as_array()
        .filter(|parts| parts.len() == 2)
        .ok_or_else(|| invalid(path, "$mod expects [divisor, remainder]"))?;
    let divisor = parts[0]
        .as_f64()
        .map(f64::trunc)
        .filter(|d| *d != 0.0)
        .ok_or_else(|| invalid(path, "$mod divisor must be a non-zero number"))?;
    let remainder = parts[1]
        .as_f64()
        .map(f64::trunc)
        .ok_or_else(|| invalid(path, "$mod remainder must be a number"))?;
    Ok(Predicate::Mod { divisor, remainder })
}

fn compile_regex(path: &str, operand: &Value, options: Option<&Value>) -> Result<Predicate> {
    let pattern = operand
        .as_str()
        .ok_or_else(|| invalid(path, "$regex expects a string"))?;
    if !pattern.starts_with('^') {
        return Err(invalid(path, "regular expression must start with ^"));
    }

    let mut builder = RegexBuilder::new(pattern);
    if let Some(options) = options {
        let flags = options
            .as_str()
            .ok_or_else(|| invalid(path, "$options expects a string"))?;
        for flag in flags.chars() {
            match flag {
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'x' => builder.ignore_whitespace(true),
                other => {
                    return Err(invalid(path, &format!("unsupported regex option '{other}'")))
                }
            };
        }
    }

    builder
        .build()
        .map(Predicate::Regex)
        .map_err(|e| invalid(path, &e.to_string()))
}

fn compile_within(path: &str, operand: &Value) -> Result<Predicate> {
    let shape = operand
        .as_object()
        .ok_or_else(|| invalid(path, "$geoWithin expects a shape"))?;

    if let Some(corners) = shape.get("$box") {
        let corners = corners
            .as_array()
            .filter(|c| c.len() == 2)
            .and_then(|c| Some((coordinate(&c[0])?, coordinate(&c[1])?)))
            .ok_or_else(|| invalid(path, "$box expects two corner coordinates"))?;
        let (a, b) = corners;
        return Ok(Predicate::WithinBox {
            min: [a[0].min(b[0]), a[1].min(b[1])],
            max: [a[0].max(b[0]), a[1].max(b[1])],
        });
    }

    if let Some(vertices) = shape.get("$polygon") {
        let vertices = vertices
            .as_array()
            .and_then(|v| v.iter().map(coordinate).collect::<Option<Vec<_>>>())
            .filter(|v| v.len() >= 3)
            .ok_or_else(|| invalid(path, "$polygon expects at least three coordinates"))?;
        return Ok(Predicate::WithinPolygon(vertices));
    }

    match shape.keys().next() {
        Some(other) => Err(Error::UnsupportedLocally(other.clone())),
        None => Err(invalid(path, "$geoWithin expects a shape")),
    }
}

fn coordinate(value: &Value) -> Option<[f64; 2]> {
    match value.as_array()?.as_slice() {
        [x, y] => Some([x.as_f64()?, y.as_f64()?]),
        _ => None,
    }
}

impl Predicate {
    fn test(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Eq(expected) => equals(value, expected),
            Predicate::Ne(expected) => !equals(value, expected),
            Predicate::In(candidates) => candidates.iter().any(|c| equals(value, c)),
            Predicate::Nin(candidates) => !candidates.iter().any(|c| equals(value, c)),
            Predicate::All(required) => match value {
                Some(Value::Array(items)) if !required.is_empty() => required
                    .iter()
                    .all(|r| items.iter().any(|item| values_equal(item, r))),
                _ => false,
            },
            Predicate::Compare(op, operand) => {
                any_element(value, |v| comparable(v, operand).is_some_and(|o| op.accepts(o)))
            }
            Predicate::Exists(expected) => value.is_some() == *expected,
            Predicate::Mod { divisor, remainder } => any_element(value, |v| {
                v.as_f64().is_some_and(|n| n.trunc() % divisor == *remainder)
            }),
            Predicate::Regex(regex) => {
                any_element(value, |v| v.as_str().is_some_and(|s| regex.is_match(s)))
            }
            Predicate::Size(size) => matches!(value, Some(Value::Array(items)) if items.len() == *size),
            Predicate::WithinBox { min, max } => value.and_then(coordinate).is_some_and(|p| {
                p[0] >= min[0] && p[0] <= max[0] && p[1] >= min[1] && p[1] <= max[1]
            }),
            Predicate::WithinPolygon(vertices) => value
                .and_then(coordinate)
                .is_some_and(|p| point_in_polygon(p, vertices)),
            Predicate::Near {
                point,
                max_distance,
            } => value.and_then(coordinate).is_some_and(|p| match max_distance {
                Some(limit) => haversine_miles(*point, p) <= *limit,
                None => true,
            }),
        }
    }
}

/// Equality with array-membership semantics: an array field equals a
/// scalar when any element does. A missing field equals `null`.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) => {
            values_equal(actual, expected)
                || matches!(actual, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

fn any_element(value: Option<&Value>, test: impl Fn(&Value) -> bool) -> bool {
    match value {
        None => false,
        Some(Value::Array(items)) => items.iter().any(&test),
        Some(other) => test(other),
    }
}

/// Ordering between a document value and a comparison operand, only when
/// both are numbers or both are strings.
fn comparable(value: &Value, operand: &Value) -> Option<Ordering> {
    match (value, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn point_in_polygon(point: [f64; 2], vertices: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i][0], vertices[i][1]);
        let (xj, yj) = (vertices[j][0], vertices[j][1]);
        if (yi > point[1]) != (yj > point[1])
            && point[0] < (xj - xi) * (point[1] - yi) / (yj - yi) + xi
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn haversine_miles(a: [f64; 2], b: [f64; 2]) -> f64 {
    let (lon1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lon2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}
