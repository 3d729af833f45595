//! Read-only projections over a collection.
//!
//! Views never touch the records they are given: they return references in
//! the original order (or a sorted copy of those references).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::store::Record;

/// Case- and accent-folded form of `text`, for containment matching.
pub fn fold_text(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Open/closed state of an order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Closed,
}

impl OrderStatus {
    pub fn of(record: &Record) -> Self {
        if record.is_closed() {
            OrderStatus::Closed
        } else {
            OrderStatus::Open
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "aberta"),
            OrderStatus::Closed => write!(f, "fechada"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_text(s.trim()).as_str() {
            "aberta" | "aberto" | "open" => Ok(OrderStatus::Open),
            "fechada" | "fechado" | "closed" | "paga" | "paid" => Ok(OrderStatus::Closed),
            _ => Err(format!(
                "Invalid status '{}'. Valid options: aberta, fechada",
                s
            )),
        }
    }
}

/// One condition on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Field contains the text, ignoring case and accents
    Text { field: String, needle: String },
    /// Field, rendered as a string, equals the value exactly
    Equals { field: String, value: String },
    /// Derived open/closed state
    Status(OrderStatus),
}

impl Predicate {
    pub fn text(field: impl Into<String>, needle: &str) -> Self {
        Predicate::Text {
            field: field.into(),
            needle: fold_text(needle),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::Text { field, needle } => record
                .text(field)
                .is_some_and(|text| fold_text(&text).contains(needle.as_str())),
            Predicate::Equals { field, value } => {
                record.text(field).as_deref() == Some(value.as_str())
            }
            Predicate::Status(status) => OrderStatus::of(record) == *status,
        }
    }
}

/// Predicates combined with AND. Empty text filters are dropped, so an
/// unfilled search box matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    predicates: Vec<Predicate>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, field: &str, needle: &str) -> Self {
        if !needle.trim().is_empty() {
            self.predicates.push(Predicate::text(field, needle));
        }
        self
    }

    pub fn with_equals(mut self, field: &str, value: &str) -> Self {
        self.predicates.push(Predicate::equals(field, value));
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.predicates.push(Predicate::Status(status));
        self
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}

/// Records matching every predicate, in collection order.
pub fn filter<'a>(records: &'a [Record], filters: &FilterSet) -> Vec<&'a Record> {
    records.iter().filter(|r| filters.matches(r)).collect()
}

/// Sort direction for [`sorted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Stable sort on `field`: numerically when both sides are numbers,
/// otherwise by folded text. Records missing the field sort last.
pub fn sorted<'a>(mut records: Vec<&'a Record>, field: &str, direction: Direction) -> Vec<&'a Record> {
    records.sort_by(|a, b| {
        let ordering = compare_field(a, b, field);
        match direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    });
    records
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) if !x.is_null() && !y.is_null() => {
            if let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            let x = fold_text(&a.text(field).unwrap_or_default());
            let y = fold_text(&b.text(field).unwrap_or_default());
            x.cmp(&y)
        }
        (Some(x), _) if !x.is_null() => Ordering::Less,
        (_, Some(y)) if !y.is_null() => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Distinct non-empty values of `field`, e.g. for a category picker.
pub fn distinct_values(records: &[Record], field: &str) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(|r| r.text(field))
        .filter(|v| !v.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_closed_status_filter() {
        let items = records(json!([{"id": 1, "ordem": "0"}, {"id": 2, "ordem": "3"}]));
        let status: OrderStatus = "fechada".parse().unwrap();

        let result = filter(&items, &FilterSet::new().with_status(status));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_filter_does_not_mutate() {
        let items = records(json!([{"id": 1, "pedido": "Caipirinha"}, {"id": 2, "pedido": "Suco"}]));
        let before = items.clone();
        let result = filter(&items, &FilterSet::new().with_text("pedido", "caip"));
        assert_eq!(result.len(), 1);
        assert_eq!(items, before);
    }

    #[test]
    fn test_text_is_case_and_accent_insensitive() {
        let items = records(json!([
            {"comanda": "Mesa São João"},
            {"comanda": "BALCÃO"},
            {"comanda": null}
        ]));
        assert_eq!(filter(&items, &FilterSet::new().with_text("comanda", "sao")).len(), 1);
        assert_eq!(filter(&items, &FilterSet::new().with_text("comanda", "Balcao")).len(), 1);
        assert_eq!(filter(&items, &FilterSet::new().with_text("comanda", "  ")).len(), 3);
    }

    #[test]
    fn test_predicates_are_anded() {
        let items = records(json!([
            {"id": 1, "categoria": 3, "pedido": "Batata", "ordem": 0},
            {"id": 2, "categoria": "3", "pedido": "Batata", "ordem": 5},
            {"id": 3, "categoria": 2, "pedido": "Batata", "ordem": 0}
        ]));
        let filters = FilterSet::new()
            .with_equals("categoria", "3")
            .with_text("pedido", "bat")
            .with_status(OrderStatus::Open);
        let ids: Vec<_> = filter(&items, &filters).iter().map(|r| r.int("id")).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_sorted() {
        let items = records(json!([
            {"id": 1, "comanda": "b"},
            {"id": 2},
            {"id": 3, "comanda": "Á"},
            {"id": 10, "comanda": "c"}
        ]));
        let by_name = sorted(items.iter().collect(), "comanda", Direction::Ascending);
        let ids: Vec<_> = by_name.iter().map(|r| r.int("id")).collect();
        assert_eq!(ids, vec![3, 1, 10, 2]);

        let by_id = sorted(items.iter().collect(), "id", Direction::Descending);
        let ids: Vec<_> = by_id.iter().map(|r| r.int("id")).collect();
        assert_eq!(ids, vec![10, 3, 2, 1]);
    }

    #[test]
    fn test_distinct_values() {
        let items = records(json!([
            {"categoria": 3}, {"categoria": "1"}, {"categoria": "3"}, {"categoria": null}, {"categoria": ""}
        ]));
        let values: Vec<_> = distinct_values(&items, "categoria").into_iter().collect();
        assert_eq!(values, vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Aberta".parse::<OrderStatus>(), Ok(OrderStatus::Open));
        assert_eq!("closed".parse::<OrderStatus>(), Ok(OrderStatus::Closed));
        assert!("pendente".parse::<OrderStatus>().is_err());
        assert_eq!(OrderStatus::Closed.to_string(), "fechada");
    }
}
