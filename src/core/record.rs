// ============================================================================
// Entity Records and Queries
// ============================================================================
//
// Providers never see concrete entity types. Everything that crosses the
// provider boundary is an `EntityRecord`: the entity's serialized fields plus
// the identity and row-version bookkeeping the engine owns.
//
// ============================================================================

use super::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Type-erased, provider-facing form of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub type_name: String,
    pub id: Option<EntityId>,
    pub row_version: u64,
    pub is_new: bool,
    pub fields: JsonValue,
}

impl EntityRecord {
    pub fn new(type_name: impl Into<String>, id: Option<EntityId>, fields: JsonValue) -> Self {
        Self {
            type_name: type_name.into(),
            id,
            row_version: 0,
            is_new: true,
            fields,
        }
    }

    /// Returns a top-level field, or `None` when absent or the record is not an object.
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.as_object().and_then(|fields| fields.get(name))
    }

    /// Returns the identity as text, or an empty string for unsaved records.
    pub fn id_text(&self) -> String {
        self.id.as_ref().map(ToString::to_string).unwrap_or_default()
    }
}

/// Comparison applied by a [`Criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Contains,
    IsNull,
}

/// A single `property <op> value` filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub property: String,
    pub operator: Operator,
    pub value: JsonValue,
}

impl Criterion {
    pub fn new(property: impl Into<String>, operator: Operator, value: impl Into<JsonValue>) -> Self {
        Self {
            property: property.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        let actual = record.field(&self.property).unwrap_or(&JsonValue::Null);
        match self.operator {
            Operator::IsNull => actual.is_null(),
            Operator::Equals => values_equal(actual, &self.value),
            Operator::NotEquals => !values_equal(actual, &self.value),
            Operator::Contains => match (actual, &self.value) {
                (JsonValue::String(a), JsonValue::String(b)) => a.contains(b.as_str()),
                (JsonValue::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
                _ => false,
            },
            Operator::GreaterThan => compare_values(actual, &self.value) == Some(Ordering::Greater),
            Operator::GreaterOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan => compare_values(actual, &self.value) == Some(Ordering::Less),
            Operator::LessOrEqual => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// Filter, ordering and paging for list reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    criteria: Vec<Criterion>,
    order_by: Option<(String, bool)>,
    skip: usize,
    take: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn where_eq(self, property: &str, value: impl Into<JsonValue>) -> Self {
        self.filter(Criterion::new(property, Operator::Equals, value))
    }

    pub fn order_by(mut self, property: &str) -> Self {
        self.order_by = Some((property.to_string(), false));
        self
    }

    pub fn order_by_desc(mut self, property: &str) -> Self {
        self.order_by = Some((property.to_string(), true));
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        self.criteria.iter().all(|c| c.matches(record))
    }

    /// Filters, orders and pages an in-memory set of records.
    pub fn apply(&self, records: impl IntoIterator<Item = EntityRecord>) -> Vec<EntityRecord> {
        let mut matched: Vec<EntityRecord> = records.into_iter().filter(|r| self.matches(r)).collect();

        if let Some((property, descending)) = &self.order_by {
            matched.sort_by(|a, b| {
                let left = a.field(property).unwrap_or(&JsonValue::Null);
                let right = b.field(property).unwrap_or(&JsonValue::Null);
                let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
                if *descending { ordering.reverse() } else { ordering }
            });
        }

        let paged = matched.into_iter().skip(self.skip);
        match self.take {
            Some(take) => paged.take(take).collect(),
            None => paged.collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateFunction {
    /// Folds the non-null values of a property. Returns `None` when nothing
    /// was aggregated (except for `Count`, which returns zero).
    pub fn apply<'a>(&self, values: impl Iterator<Item = &'a JsonValue>) -> Option<JsonValue> {
        let values: Vec<&JsonValue> = values.filter(|v| !v.is_null()).collect();
        match self {
            AggregateFunction::Count => Some(JsonValue::from(values.len() as u64)),
            AggregateFunction::Sum => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                if numbers.is_empty() {
                    return None;
                }
                Some(number_value(numbers.iter().sum()))
            }
            AggregateFunction::Average => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                if numbers.is_empty() {
                    return None;
                }
                Some(number_value(numbers.iter().sum::<f64>() / numbers.len() as f64))
            }
            AggregateFunction::Min => values
                .into_iter()
                .min_by(|a, b| compare_values(a, b).unwrap_or(Ordering::Equal))
                .cloned(),
            AggregateFunction::Max => values
                .into_iter()
                .max_by(|a, b| compare_values(a, b).unwrap_or(Ordering::Equal))
                .cloned(),
        }
    }
}

fn number_value(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        JsonValue::from(value as i64)
    } else {
        JsonValue::from(value)
    }
}

fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

pub(crate) fn compare_values(left: &JsonValue, right: &JsonValue) -> Option<Ordering> {
    match (left, right) {
        (JsonValue::Number(_), JsonValue::Number(_)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        (JsonValue::Null, _) => Some(Ordering::Less),
        (_, JsonValue::Null) => Some(Ordering::Greater),
        _ => None,
    }
}
