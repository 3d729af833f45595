//! Kitchen receipt rendering.
//!
//! Receipts target 58 mm thermal paper (32 columns) and are emitted as
//! ESC/POS bytes in code page 1252.

use chrono::Local;
use serde_json::Value;

use crate::options::{normalize, parse};
use crate::store::{value_as_string, Record, RecordId};
use crate::views::fold_text;

/// Columns on 58 mm paper.
pub const NARROW_WIDTH: usize = 32;
/// Columns on 80 mm paper.
pub const WIDE_WIDTH: usize = 48;

mod escpos {
    pub const INIT: &str = "\x1b@";
    pub const LEFT: &str = "\x1ba\x00";
    pub const CENTER: &str = "\x1ba\x01";
    pub const BOLD_ON: &str = "\x1bE\x01";
    pub const BOLD_OFF: &str = "\x1bE\x00";
    pub const DOUBLE: &str = "\x1b!\x30";
    pub const NORMAL: &str = "\x1b!\x00";
    pub const CP1252: &str = "\x1bt\x10";
    pub const FEED2: &str = "\x1bd\x02";
    pub const CUT: &str = "\x1dV\x01";
}

const META_PREFIXES: [&str; 8] = [
    "mesa",
    "hora",
    "remetente",
    "operador",
    "enviado por",
    "enviou",
    "endereco",
    "pedido",
];
const FOOTER_LINES: [&str; 2] = ["obrigado pela preferencia", "nao e documento fiscal"];

/// One line item on a receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptItem {
    pub id: Option<RecordId>,
    pub name: String,
    pub quantity: i64,
    pub options: Option<String>,
    pub note: Option<String>,
}

impl ReceiptItem {
    pub fn new(name: impl Into<String>, quantity: i64) -> Self {
        Self {
            id: None,
            name: name.into(),
            quantity,
            options: None,
            note: None,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A kitchen ticket for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub title: String,
    pub table: String,
    pub time: String,
    pub sender: String,
    pub operator: String,
    pub address: String,
    pub deadline: String,
    pub items: Vec<ReceiptItem>,
    pub width: usize,
}

impl Receipt {
    pub fn new(items: Vec<ReceiptItem>) -> Self {
        Self {
            title: String::new(),
            table: String::new(),
            time: Local::now().format("%d/%m/%Y %H:%M:%S").to_string(),
            sender: String::new(),
            operator: String::new(),
            address: String::new(),
            deadline: String::new(),
            items,
            width: NARROW_WIDTH,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = time.into();
        self
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(8);
        self
    }

    /// Builds a ticket from an order record as pushed by the server.
    ///
    /// `pedido` may be a single item name or an array of item objects;
    /// record-level `quantidade`, `opcoes` and `extra` apply to the former.
    pub fn from_record(record: &Record) -> Self {
        let text = |fields: &[&str]| {
            fields
                .iter()
                .find_map(|f| record.text(f).filter(|v| !v.is_empty()))
                .unwrap_or_default()
        };

        let mut receipt = Receipt::new(items_from_record(record));
        receipt.table = text(&["mesa", "comanda"]);
        receipt.sender = text(&["remetente"]);
        receipt.title = receipt.sender.clone();
        receipt.operator = text(&["sendBy", "usuario"]);
        receipt.address = text(&["endereco", "endereco_entrega", "enderecoEntrega"]);
        receipt.deadline = text(&["prazo", "horario_para_entrega"]);
        let time = text(&["hora"]);
        if !time.is_empty() {
            receipt.time = time;
        }
        receipt
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// "2x Burger, 1x Suco", for logs.
    pub fn summary(&self) -> String {
        self.items
            .iter()
            .map(|i| format!("{}x {}", i.quantity, i.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Renders the ticket as text with embedded ESC/POS commands.
    pub fn render_text(&self) -> String {
        let width = self.width;
        let sep = format!("{}\n", "-".repeat(width));
        let mut out = String::new();

        out.push_str(escpos::INIT);
        out.push_str(escpos::CP1252);
        out.push_str(escpos::CENTER);
        out.push_str(escpos::BOLD_ON);
        out.push_str(escpos::DOUBLE);
        out.push_str(&self.title);
        out.push('\n');
        out.push_str(escpos::NORMAL);
        out.push_str(escpos::BOLD_OFF);
        out.push_str(&sep);

        out.push_str(escpos::LEFT);
        if !self.table.is_empty() {
            out.push_str(&line_kv("Mesa", &self.table, width));
        }
        out.push_str(&line_kv("Hora", &self.time, width));
        if !self.sender.is_empty() {
            out.push_str(&line_kv("Remetente", &self.sender, width));
        }
        if !self.operator.is_empty() {
            out.push_str(&line_kv("Operador", &self.operator, width));
        }
        if !self.address.is_empty() {
            out.push_str(&wrap_words(&format!("Endereço: {}", self.address), width));
        }
        if !self.deadline.is_empty() {
            out.push_str(&line_kv("Prazo", &self.deadline, width));
        }
        out.push_str(&sep);

        out.push_str(escpos::LEFT);
        for (i, item) in self.items.iter().enumerate() {
            out.push_str(escpos::BOLD_ON);
            out.push_str(&wrap_words(
                &format!("{}x {}", item.quantity, strip_meta_lines(&item.name)),
                width,
            ));
            out.push_str(escpos::BOLD_OFF);
            if let Some(options) = &item.options {
                out.push_str(&wrap_words(&strip_meta_lines(options), width));
            }
            if let Some(note) = &item.note {
                out.push_str(&wrap_words(&strip_meta_lines(&format!("Obs: {}", note)), width));
            }
            if i + 1 < self.items.len() {
                out.push_str(&sep);
            } else {
                out.push('\n');
            }
        }
        out.push_str(&sep);

        out.push_str(escpos::CENTER);
        out.push_str("Obrigado pela preferência!\n");
        out.push_str(escpos::CENTER);
        out.push_str("NAO E DOCUMENTO FISCAL\n");
        out.push('\n');
        out.push_str(escpos::FEED2);
        out.push_str(escpos::CUT);
        out
    }

    /// Bytes ready to send to the printer.
    pub fn render(&self) -> Vec<u8> {
        encode_cp1252(&self.render_text())
    }
}

/// Items of an order record, skipping ones without a name.
pub fn items_from_record(record: &Record) -> Vec<ReceiptItem> {
    if let Some(Value::Array(items)) = record.get("pedido") {
        if !items.is_empty() {
            return items.iter().filter_map(item_from_value).collect();
        }
    }

    let name = record.text("pedido").unwrap_or_default();
    let options = record.get("opcoes").and_then(options_text);
    let note = record.text("extra").filter(|n| !n.is_empty());
    if name.is_empty() && options.is_none() && note.is_none() {
        return Vec::new();
    }
    let quantity = match record.get("quantidade").or_else(|| record.get("quant")) {
        Some(v) if !v.is_null() => record_quantity(v),
        _ => 1,
    };

    vec![ReceiptItem {
        id: record.id(),
        name,
        quantity,
        options,
        note,
    }]
}

fn item_from_value(value: &Value) -> Option<ReceiptItem> {
    let Some(obj) = value.as_object() else {
        let name = value_as_string(value)?;
        return (!name.is_empty()).then(|| ReceiptItem::new(name, 1));
    };
    let item = Record::from_value(Value::Object(obj.clone()))?;
    let name = item
        .text("pedido")
        .or_else(|| item.text("nome"))
        .filter(|n| !n.is_empty())?;
    let quantity = match item.get("quantidade").or_else(|| item.get("quant")) {
        Some(v) if !v.is_null() => record_quantity(v),
        _ => 1,
    };

    Some(ReceiptItem {
        id: item.id(),
        name,
        quantity,
        options: item.get("opcoes").and_then(options_text),
        note: item.text("extra").filter(|n| !n.is_empty()),
    })
}

fn record_quantity(value: &Value) -> i64 {
    Record::new().with("q", value.clone()).int("q")
}

/// Options as printable text: a structured options document is summarized,
/// anything else is printed as-is.
fn options_text(value: &Value) -> Option<String> {
    let doc = normalize(&parse(value).groups);
    let text = if doc.is_empty() {
        value_as_string(value)?
    } else {
        doc.summary()
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Order ids a ticket covers: `ids`, then `id`, then item ids, deduplicated.
pub fn order_ids(record: &Record) -> Vec<RecordId> {
    let mut ids: Vec<RecordId> = Vec::new();
    let mut push = |value: &Value| {
        if let Some(id) = value_as_string(value).filter(|s| !s.is_empty()) {
            let id = RecordId::new(id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    };

    match record.get("ids") {
        Some(Value::Array(values)) => values.iter().for_each(&mut push),
        Some(value) => push(value),
        None => {}
    }
    if let Some(id) = record.get("id") {
        push(id);
    }
    if let Some(Value::Array(items)) = record.get("pedido") {
        for item in items {
            if let Some(id) = item.get("id") {
                push(id);
            }
        }
    }
    ids
}

/// Wraps `text` at word boundaries. Words longer than a line are split
/// with a trailing hyphen. Every output line ends with a newline.
pub fn wrap_words(text: &str, width: usize) -> String {
    if text.is_empty() || width == 0 {
        return String::new();
    }
    let mut lines: Vec<String> = Vec::new();

    for paragraph in text.replace("\r\n", "\n").replace('\r', "\n").split('\n') {
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        if words.is_empty() {
            lines.push(String::new());
            continue;
        }

        let mut line = String::new();
        for word in words {
            let line_len = line.chars().count();
            let word_len = word.chars().count();
            let sep = usize::from(!line.is_empty());

            if line_len + sep + word_len <= width {
                if sep == 1 {
                    line.push(' ');
                }
                line.push_str(word);
            } else if word_len > width {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                let take = width.saturating_sub(1).max(1);
                let mut rest: Vec<char> = word.chars().collect();
                while rest.len() > width {
                    let tail = rest.split_off(take);
                    let mut piece: String = rest.into_iter().collect();
                    piece.push('-');
                    lines.push(piece);
                    rest = tail;
                }
                line = rest.into_iter().collect();
            } else {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                line.push_str(word);
            }
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }

    let mut out = lines.join("\n");
    if !lines.is_empty() {
        out.push('\n');
    }
    out
}

/// "Key: value" padded to exactly `width` columns.
pub fn line_kv(key: &str, value: &str, width: usize) -> String {
    let key = format!("{}: ", key);
    let left = key.chars().count().min(width / 2);
    let right = width - left;
    format!("{}{}\n", pad(&key, left), pad(value, right))
}

fn pad(text: &str, len: usize) -> String {
    let mut out: String = text.chars().take(len).collect();
    let count = out.chars().count();
    out.extend(std::iter::repeat(' ').take(len - count));
    out
}

/// Removes header and footer lines that older clients embedded in item
/// text, so they are not printed twice.
pub fn strip_meta_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !is_meta_line(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

fn is_meta_line(line: &str) -> bool {
    let folded = fold_text(line.trim());
    if FOOTER_LINES.iter().any(|f| folded.trim() == *f) {
        return true;
    }
    META_PREFIXES.iter().any(|prefix| {
        folded
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start())
            .is_some_and(|rest| rest.starts_with(':') || rest.starts_with('-'))
    })
}

/// Latin-1 range maps to itself; anything else prints as `?`.
fn encode_cp1252(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
