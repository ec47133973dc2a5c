use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{invalid_argument, SyncResult};
use crate::model::{
    value_compare, values_comparable, Document, DocumentComparator, FieldPath, ResourcePath,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl FilterOperator {
    fn keyword(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: Value) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    fn matches(&self, doc: &Document) -> bool {
        let value = match doc.data().get(&self.field) {
            Some(value) => value,
            // Filters never match documents missing the filtered field.
            None => return false,
        };
        match self.operator {
            FilterOperator::Equal => value == &self.value,
            FilterOperator::NotEqual => value != &self.value,
            FilterOperator::LessThan => {
                values_comparable(value, &self.value)
                    && value_compare(value, &self.value) == Ordering::Less
            }
            FilterOperator::LessThanOrEqual => {
                values_comparable(value, &self.value)
                    && value_compare(value, &self.value) != Ordering::Greater
            }
            FilterOperator::GreaterThan => {
                values_comparable(value, &self.value)
                    && value_compare(value, &self.value) == Ordering::Greater
            }
            FilterOperator::GreaterThanOrEqual => {
                values_comparable(value, &self.value)
                    && value_compare(value, &self.value) != Ordering::Less
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }
}

/// Immutable description of a query: collection (or single-document) path,
/// field filters, explicit ordering, and an optional limit.
///
/// Queries are equatable and hashable via their canonical id so they can key
/// the sync engine's view registry.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    canonical_id: String,
}

impl Query {
    /// Query over the immediate children of a collection path, or over the
    /// single document the path names when it has an even segment count.
    pub fn at_path(path: ResourcePath) -> Self {
        Self::build(path, Vec::new(), Vec::new(), None)
    }

    pub fn collection(path: &str) -> SyncResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.is_empty() || path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Collection queries need an odd number of segments: {path}"
            )));
        }
        Ok(Self::at_path(path))
    }

    fn build(
        path: ResourcePath,
        filters: Vec<FieldFilter>,
        explicit_order_by: Vec<OrderBy>,
        limit: Option<u32>,
    ) -> Self {
        let canonical_id = Self::canonicalize(&path, &filters, &explicit_order_by, limit);
        Self {
            path,
            filters,
            explicit_order_by,
            limit,
            canonical_id,
        }
    }

    fn canonicalize(
        path: &ResourcePath,
        filters: &[FieldFilter],
        order_by: &[OrderBy],
        limit: Option<u32>,
    ) -> String {
        let mut id = path.canonical_string();
        if !filters.is_empty() {
            id.push_str("|f:");
            for filter in filters {
                id.push_str(&filter.field.canonical_string());
                id.push_str(filter.operator.keyword());
                id.push_str(&filter.value.to_string());
                id.push(',');
            }
        }
        if !order_by.is_empty() {
            id.push_str("|ob:");
            for order in order_by {
                id.push_str(&order.field.canonical_string());
                id.push_str(match order.direction {
                    OrderDirection::Ascending => "asc",
                    OrderDirection::Descending => "desc",
                });
                id.push(',');
            }
        }
        if let Some(limit) = limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        id
    }

    pub fn where_field(&self, field: FieldPath, operator: FilterOperator, value: Value) -> Self {
        let mut filters = self.filters.clone();
        filters.push(FieldFilter::new(field, operator, value));
        Self::build(
            self.path.clone(),
            filters,
            self.explicit_order_by.clone(),
            self.limit,
        )
    }

    pub fn order_by(&self, field: FieldPath, direction: OrderDirection) -> Self {
        let mut order_by = self.explicit_order_by.clone();
        order_by.push(OrderBy::new(field, direction));
        Self::build(self.path.clone(), self.filters.clone(), order_by, self.limit)
    }

    pub fn with_limit(&self, limit: u32) -> Self {
        Self::build(
            self.path.clone(),
            self.filters.clone(),
            self.explicit_order_by.clone(),
            Some(limit),
        )
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        self.path.len() % 2 == 0 && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path(doc) && self.matches_order_by(doc) && self.matches_filters(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if self.path.len() % 2 == 0 {
            return doc_path == &self.path;
        }
        self.path.is_prefix_of(doc_path) && doc_path.len() == self.path.len() + 1
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        // A document must supply every explicitly ordered field to have a
        // defined position in the result.
        self.explicit_order_by
            .iter()
            .all(|order| doc.data().get(order.field()).is_some())
    }

    fn matches_filters(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| filter.matches(doc))
    }

    /// Compares two documents in this query's result order: explicit
    /// order-by entries first, then key order in the direction of the last
    /// explicit entry.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let mut last_direction = OrderDirection::Ascending;
        for order in &self.explicit_order_by {
            last_direction = order.direction();
            let left_value = left.data().get(order.field());
            let right_value = right.data().get(order.field());
            let ordering = match (left_value, right_value) {
                (Some(left_value), Some(right_value)) => value_compare(left_value, right_value),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match order.direction() {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        let key_order = left.key().cmp(right.key());
        match last_direction {
            OrderDirection::Ascending => key_order,
            OrderDirection::Descending => key_order.reverse(),
        }
    }

    pub fn comparator(&self) -> DocumentComparator {
        let query = self.clone();
        Arc::new(move |left, right| query.compare(left, right))
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id == other.canonical_id
    }
}

impl Eq for Query {}

impl Hash for Query {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey, DocumentState, ObjectValue, SnapshotVersion};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn doc(path: &str, pairs: &[(&str, Value)]) -> Document {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(1, 0),
            ObjectValue::new(map),
            DocumentState::Synced,
        )
    }

    #[test]
    fn collection_query_matches_immediate_children_only() {
        let query = Query::collection("users").unwrap();
        assert!(query.matches(&doc("users/a", &[])));
        assert!(!query.matches(&doc("users/a/posts/p1", &[])));
        assert!(!query.matches(&doc("rooms/a", &[])));
    }

    #[test]
    fn document_query_matches_exactly_one_key() {
        let path = ResourcePath::from_string("users/a").unwrap();
        let query = Query::at_path(path);
        assert!(query.is_document_query());
        assert!(query.matches(&doc("users/a", &[])));
        assert!(!query.matches(&doc("users/b", &[])));
    }

    #[test]
    fn filters_require_field_presence() {
        let query = Query::collection("users").unwrap().where_field(
            FieldPath::from_dot_separated("age").unwrap(),
            FilterOperator::GreaterThan,
            json!(21),
        );
        assert!(query.matches(&doc("users/a", &[("age", json!(30))])));
        assert!(!query.matches(&doc("users/b", &[("age", json!(18))])));
        assert!(!query.matches(&doc("users/c", &[])));
    }

    #[test]
    fn order_by_requires_field_presence() {
        let query = Query::collection("users").unwrap().order_by(
            FieldPath::from_dot_separated("age").unwrap(),
            OrderDirection::Ascending,
        );
        assert!(!query.matches(&doc("users/a", &[])));
    }

    #[test]
    fn compare_falls_back_to_key_order() {
        let query = Query::collection("users").unwrap();
        let a = doc("users/a", &[]);
        let b = doc("users/b", &[]);
        assert_eq!(query.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn descending_order_flips_key_tiebreak() {
        let query = Query::collection("users").unwrap().order_by(
            FieldPath::from_dot_separated("age").unwrap(),
            OrderDirection::Descending,
        );
        let a = doc("users/a", &[("age", json!(30))]);
        let b = doc("users/b", &[("age", json!(30))]);
        assert_eq!(query.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn equal_queries_share_canonical_id() {
        let first = Query::collection("users").unwrap().with_limit(10);
        let second = Query::collection("users").unwrap().with_limit(10);
        assert_eq!(first, second);
        assert_ne!(first, Query::collection("users").unwrap());
    }
}
