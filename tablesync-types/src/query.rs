//! Composable query expressions.
//!
//! A [`Query`] is an immutable, cloneable filter/sort/paging/projection
//! expression bound to a table name. The engine composes queries (adding
//! paging bounds or an incremental-pull window) but never evaluates them;
//! evaluation belongs to store implementations and the remote service.
//! [`Filter::matches`] is provided for stores that want a reference
//! evaluator.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// One ordering clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Field to order by.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// A structured comparison tree over row fields.
///
/// Deliberately small: the engine only ever composes field comparisons
/// and conjunctions. Anything richer is the remote service's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field does not equal value.
    Ne(String, Value),
    /// Field is greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Ge(String, Value),
    /// Field is less than value.
    Lt(String, Value),
    /// Field is less than or equal to value.
    Le(String, Value),
    /// All sub-filters match.
    And(Vec<Filter>),
}

impl Filter {
    /// Conjoin this filter with another.
    pub fn and(self, other: Filter) -> Filter {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// Evaluate this filter against a row.
    ///
    /// Missing fields never match comparison clauses.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(field, value) => row.get(field) == Some(value),
            Filter::Ne(field, value) => row.get(field) != Some(value),
            Filter::Gt(field, value) => cmp_field(row, field, value) == Some(Ordering::Greater),
            Filter::Ge(field, value) => matches!(
                cmp_field(row, field, value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            Filter::Lt(field, value) => cmp_field(row, field, value) == Some(Ordering::Less),
            Filter::Le(field, value) => matches!(
                cmp_field(row, field, value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }
}

fn cmp_field(row: &Value, field: &str, value: &Value) -> Option<Ordering> {
    compare_values(row.get(field)?, value)
}

/// Order two JSON scalars.
///
/// Numbers compare numerically, strings lexicographically, booleans
/// false-before-true. Mixed or non-scalar types do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// An immutable query expression bound to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    table_name: String,
    filter: Option<Filter>,
    order: Vec<OrderBy>,
    top: Option<u64>,
    skip: Option<u64>,
    select: Vec<String>,
}

impl Query {
    /// Create a query over the given table. The name is normalized to
    /// lower case.
    pub fn table(table_name: &str) -> Self {
        Self {
            table_name: table_name.trim().to_lowercase(),
            filter: None,
            order: Vec::new(),
            top: None,
            skip: None,
            select: Vec::new(),
        }
    }

    /// The table this query is bound to.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// The filter expression, if any.
    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    /// The ordering clauses.
    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    /// The page size bound, if any.
    pub fn top(&self) -> Option<u64> {
        self.top
    }

    /// The paging offset, if any.
    pub fn skip(&self) -> Option<u64> {
        self.skip
    }

    /// The projected fields; empty means all fields.
    pub fn select(&self) -> &[String] {
        &self.select
    }

    /// Replace the filter expression.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Conjoin a filter with any existing one.
    pub fn and_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Append an ordering clause.
    pub fn order_by(mut self, field: &str, order: SortOrder) -> Self {
        self.order.push(OrderBy {
            field: field.to_string(),
            order,
        });
        self
    }

    /// Set the page size bound.
    pub fn with_top(mut self, top: u64) -> Self {
        self.top = Some(top);
        self
    }

    /// Set the paging offset.
    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Set the projected fields.
    pub fn with_select(mut self, fields: Vec<String>) -> Self {
        self.select = fields;
        self
    }
}
