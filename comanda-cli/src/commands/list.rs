use std::time::Duration;

use clap::Args;
use comanda_core::store::Record;
use comanda_core::views::{filter, sorted, Direction, FilterSet, OrderStatus};
use comanda_core::CollectionKind;

use super::config_cmd::OutputFormat;
use super::{block_on, parse_kind, parse_pair, wait_for_snapshot, CommandError};
use crate::config::Config;
use crate::engine::Engine;

/// Fetch a collection and print a filtered view of it
#[derive(Args)]
pub struct ListCommand {
    /// Collection: orders, users, audit, stock, general-stock
    #[arg(value_parser = parse_kind)]
    collection: CollectionKind,

    /// Text search, case and accent insensitive (FIELD=TEXT, repeatable)
    #[arg(long, short, value_parser = parse_pair)]
    search: Vec<(String, String)>,

    /// Exact match on a field (FIELD=VALUE, repeatable)
    #[arg(long = "where", short = 'w', value_parser = parse_pair)]
    equals: Vec<(String, String)>,

    /// Order status: aberta or fechada
    #[arg(long)]
    status: Option<OrderStatus>,

    /// Sort by field
    #[arg(long)]
    sort: Option<String>,

    /// Sort descending
    #[arg(long)]
    desc: bool,

    /// Ignore the role's default category
    #[arg(long)]
    all: bool,

    /// Fields to show in text output (comma-separated)
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Seconds to wait for the snapshot
    #[arg(long, default_value = "10")]
    wait: u64,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ListCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        block_on(self.list(config))
    }

    async fn list(&self, config: &Config) -> Result<(), CommandError> {
        let engine = Engine::start(config).await?;
        let store = engine.open(self.collection.clone());
        wait_for_snapshot(&store, Duration::from_secs(self.wait)).await?;

        let mut filters = self.filters();
        if !self.all {
            if let Some(category) = store.view_category() {
                filters = filters.with_equals("categoria", &category);
            }
        }

        let records = store.records();
        let mut rows = filter(&records, &filters);
        if let Some(field) = &self.sort {
            let direction = if self.desc {
                Direction::Descending
            } else {
                Direction::Ascending
            };
            rows = sorted(rows, field, direction);
        }

        match self.format {
            OutputFormat::Json => {
                let values: Vec<_> = rows.iter().map(|r| r.fields()).collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&values)
                        .map_err(|e| CommandError::InvalidInput(e.to_string()))?
                );
            }
            OutputFormat::Text => {
                for record in &rows {
                    println!("{}", render_line(record, &self.fields));
                }
                println!();
                println!("{} of {} {}", rows.len(), records.len(), self.collection.name);
            }
        }
        Ok(())
    }

    fn filters(&self) -> FilterSet {
        let mut filters = FilterSet::new();
        for (field, text) in &self.search {
            filters = filters.with_text(field, text);
        }
        for (field, value) in &self.equals {
            filters = filters.with_equals(field, value);
        }
        if let Some(status) = self.status {
            filters = filters.with_status(status);
        }
        filters
    }
}

/// One record as `id  field=value ...`.
fn render_line(record: &Record, fields: &[String]) -> String {
    let id = record.id().map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    let mut parts = vec![format!("{:>6}", id)];

    if fields.is_empty() {
        for (field, value) in record.fields() {
            if field == "id" {
                continue;
            }
            parts.push(format!("{}={}", field, value));
        }
    } else {
        for field in fields {
            let value = record.text(field).unwrap_or_default();
            parts.push(format!("{}={}", field, value));
        }
    }
    parts.join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_line_with_fields() {
        let record = Record::from_value(json!({"id": 4, "comanda": "Mesa 2", "ordem": 1})).unwrap();
        assert_eq!(
            render_line(&record, &["comanda".to_string(), "missing".to_string()]),
            "     4  comanda=Mesa 2  missing="
        );
        assert!(render_line(&record, &[]).contains("ordem=1"));
    }
}
