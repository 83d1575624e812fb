//! Record schemas and their mapping onto the destination's column model.
//!
//! A [`RecordSchema`] is an explicit, ordered list of [`FieldDescriptor`]s. The
//! first descriptor is the record's title and is always declared and encoded as
//! the destination's title column, whatever its semantic kind. Declaring a
//! schema ([`RecordSchema::to_schema`]), encoding a value
//! ([`RecordSchema::encode`]) and decoding a stored property
//! ([`RecordSchema::decode`]) all dispatch through the same per-field column
//! mapping.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

/// Maximum content length of one rich-text object on the destination side.
pub const TEXT_CHUNK_LIMIT: usize = 2000;

const LIST_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Timestamp,
    /// Closed set of labels, in declaration order.
    Enumeration(&'static [&'static str]),
    /// Ordered list of strings. Has no column mapping of its own.
    List,
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Text => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Timestamp => "timestamp",
            FieldKind::Enumeration(_) => "enumeration",
            FieldKind::List => "list",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Label(String),
    List(Vec<String>),
    Empty,
}

impl FieldValue {
    fn variant_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Label(_) => "label",
            FieldValue::List(_) => "list",
            FieldValue::Empty => "empty",
        }
    }

    /// Plain-text rendering, used for the title column.
    fn render(&self) -> String {
        match self {
            FieldValue::Text(s) | FieldValue::Label(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Timestamp(ts) => iso8601(ts),
            FieldValue::List(items) => items.join(LIST_SEPARATOR),
            FieldValue::Empty => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{record} declares {expected} fields but {actual} values were supplied")]
    Arity {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field `{field}` is declared as {kind} but got a {value} value")]
    KindMismatch {
        field: &'static str,
        kind: &'static str,
        value: &'static str,
    },
    #[error("`{label}` is not an option of field `{field}`")]
    UnknownLabel { field: &'static str, label: String },
    #[error("{record} has no field named `{field}`")]
    UnknownField { record: &'static str, field: String },
    #[error("cannot decode field `{field}`: {reason}")]
    Decode { field: &'static str, reason: String },
}

/// Destination column a field is declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Title,
    RichText,
    Number,
    Date,
    Select(&'static [&'static str]),
}

impl Column {
    fn key(&self) -> &'static str {
        match self {
            Column::Title => "title",
            Column::RichText => "rich_text",
            Column::Number => "number",
            Column::Date => "date",
            Column::Select(_) => "select",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    record: &'static str,
    fields: Vec<FieldDescriptor>,
    watermark: Option<&'static str>,
}

impl RecordSchema {
    /// Starts a schema whose title column is `title`.
    pub fn new(record: &'static str, title: FieldDescriptor) -> Self {
        Self {
            record,
            fields: vec![title],
            watermark: None,
        }
    }

    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }

    /// Names the field holding the record's source-update time.
    pub fn watermark(mut self, field: &'static str) -> Self {
        self.watermark = Some(field);
        self
    }

    pub fn record_name(&self) -> &'static str {
        self.record
    }

    pub fn title(&self) -> &FieldDescriptor {
        &self.fields[0]
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn watermark_field(&self) -> Option<&FieldDescriptor> {
        let name = self.watermark?;
        self.fields.iter().find(|d| d.name == name)
    }

    fn position(&self, field: &str) -> Result<usize, SchemaError> {
        self.fields
            .iter()
            .position(|d| d.name == field)
            .ok_or_else(|| SchemaError::UnknownField {
                record: self.record,
                field: field.to_string(),
            })
    }

    fn column(&self, index: usize) -> Column {
        if index == 0 {
            return Column::Title;
        }
        let descriptor = &self.fields[index];
        match descriptor.kind {
            FieldKind::Text => Column::RichText,
            FieldKind::Integer | FieldKind::Float => Column::Number,
            FieldKind::Timestamp => Column::Date,
            FieldKind::Enumeration(labels) => Column::Select(labels),
            FieldKind::List => {
                warn!(
                    record = self.record,
                    field = descriptor.name,
                    declared = descriptor.kind.type_name(),
                    "no column mapping for field type; falling back to a text column"
                );
                Column::RichText
            }
        }
    }

    /// Table property declarations, keyed by field name.
    pub fn to_schema(&self) -> JsonValue {
        let mut properties = Map::new();
        for (index, descriptor) in self.fields.iter().enumerate() {
            let declaration = match self.column(index) {
                Column::Select(labels) => json!({
                    "type": "select",
                    "select": {
                        "options": labels
                            .iter()
                            .map(|label| json!({ "name": label, "color": "default" }))
                            .collect::<Vec<_>>(),
                    },
                }),
                column => json!({ column.key(): {} }),
            };
            properties.insert(descriptor.name.to_string(), declaration);
        }
        JsonValue::Object(properties)
    }

    /// Encodes one record value laid out as this schema's fields.
    pub fn encode(&self, values: &[FieldValue]) -> Result<JsonValue, SchemaError> {
        if values.len() != self.fields.len() {
            return Err(SchemaError::Arity {
                record: self.record,
                expected: self.fields.len(),
                actual: values.len(),
            });
        }

        let mut properties = Map::new();
        for (index, (descriptor, value)) in self.fields.iter().zip(values).enumerate() {
            check_kind(descriptor, value)?;
            let encoded = match self.column(index) {
                Column::Title => json!({ "title": text_chunks(&value.render()) }),
                Column::RichText => json!({ "rich_text": text_chunks(&value.render()) }),
                Column::Number => match value {
                    FieldValue::Integer(n) => json!({ "number": n }),
                    FieldValue::Float(f) => json!({ "number": f }),
                    _ => json!({ "number": null }),
                },
                Column::Date => match value {
                    FieldValue::Timestamp(ts) => json!({ "date": { "start": iso8601(ts) } }),
                    _ => json!({ "date": null }),
                },
                Column::Select(_) => match value {
                    FieldValue::Label(label) => json!({ "select": { "name": label } }),
                    _ => json!({ "select": null }),
                },
            };
            properties.insert(descriptor.name.to_string(), encoded);
        }
        Ok(JsonValue::Object(properties))
    }

    /// Decodes a stored property of `field` back into a value of its declared kind.
    pub fn decode(&self, field: &str, property: &JsonValue) -> Result<FieldValue, SchemaError> {
        let index = self.position(field)?;
        let descriptor = self.fields[index];
        let column = self.column(index);
        let raw = &property[column.key()];

        match column {
            Column::Title | Column::RichText => {
                let text = plain_text(raw);
                if text.is_empty() {
                    return Ok(FieldValue::Empty);
                }
                parse_text(&descriptor, text)
            }
            Column::Number => match (descriptor.kind, raw) {
                (_, JsonValue::Null) => Ok(FieldValue::Empty),
                (FieldKind::Integer, n) => n
                    .as_i64()
                    .map(FieldValue::Integer)
                    .ok_or_else(|| decode_error(&descriptor, "expected an integer number")),
                (_, n) => n
                    .as_f64()
                    .map(FieldValue::Float)
                    .ok_or_else(|| decode_error(&descriptor, "expected a number")),
            },
            Column::Date => match raw.get("start").and_then(JsonValue::as_str) {
                None => Ok(FieldValue::Empty),
                Some(start) => parse_timestamp(&descriptor, start).map(FieldValue::Timestamp),
            },
            Column::Select(_) => match raw.get("name").and_then(JsonValue::as_str) {
                None => Ok(FieldValue::Empty),
                Some(name) => Ok(FieldValue::Label(name.to_string())),
            },
        }
    }
}

/// A typed record with a fixed, registered schema.
pub trait Record {
    fn schema() -> &'static RecordSchema
    where
        Self: Sized;

    /// Field values in schema order.
    fn values(&self) -> Vec<FieldValue>;
}

pub fn encode_record<R: Record>(record: &R) -> Result<JsonValue, SchemaError> {
    R::schema().encode(&record.values())
}

pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn check_kind(descriptor: &FieldDescriptor, value: &FieldValue) -> Result<(), SchemaError> {
    let fits = match (descriptor.kind, value) {
        (_, FieldValue::Empty) => true,
        (FieldKind::Text, FieldValue::Text(_)) => true,
        (FieldKind::Integer, FieldValue::Integer(_)) => true,
        (FieldKind::Float, FieldValue::Float(_) | FieldValue::Integer(_)) => true,
        (FieldKind::Timestamp, FieldValue::Timestamp(_)) => true,
        (FieldKind::List, FieldValue::List(_)) => true,
        (FieldKind::Enumeration(labels), FieldValue::Label(label)) => {
            if !labels.contains(&label.as_str()) {
                return Err(SchemaError::UnknownLabel {
                    field: descriptor.name,
                    label: label.clone(),
                });
            }
            true
        }
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(SchemaError::KindMismatch {
            field: descriptor.name,
            kind: descriptor.kind.type_name(),
            value: value.variant_name(),
        })
    }
}

fn text_chunks(text: &str) -> Vec<JsonValue> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(TEXT_CHUNK_LIMIT)
        .map(|chunk| {
            json!({
                "type": "text",
                "text": { "content": chunk.iter().collect::<String>() },
            })
        })
        .collect()
}

fn plain_text(raw: &JsonValue) -> String {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.pointer("/text/content")
                        .or_else(|| item.get("plain_text"))
                        .and_then(JsonValue::as_str)
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn parse_text(descriptor: &FieldDescriptor, text: String) -> Result<FieldValue, SchemaError> {
    match descriptor.kind {
        FieldKind::Text => Ok(FieldValue::Text(text)),
        FieldKind::Enumeration(_) => Ok(FieldValue::Label(text)),
        FieldKind::List => Ok(FieldValue::List(
            text.split(LIST_SEPARATOR).map(str::to_string).collect(),
        )),
        FieldKind::Integer => text
            .parse()
            .map(FieldValue::Integer)
            .map_err(|e| decode_error(descriptor, e)),
        FieldKind::Float => text
            .parse()
            .map(FieldValue::Float)
            .map_err(|e| decode_error(descriptor, e)),
        FieldKind::Timestamp => parse_timestamp(descriptor, &text).map(FieldValue::Timestamp),
    }
}

fn parse_timestamp(descriptor: &FieldDescriptor, text: &str) -> Result<DateTime<Utc>, SchemaError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| decode_error(descriptor, format!("`{text}` is not ISO-8601: {e}")))
}

fn decode_error(descriptor: &FieldDescriptor, reason: impl ToString) -> SchemaError {
    SchemaError::Decode {
        field: descriptor.name,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATEGORIES: &[&str] = &["A", "B"];

    fn person_schema() -> RecordSchema {
        RecordSchema::new("Person", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("age", FieldKind::Integer))
            .field(FieldDescriptor::new("category", FieldKind::Enumeration(CATEGORIES)))
    }

    #[test]
    fn schema_declares_title_number_and_ordered_select() {
        let schema = person_schema().to_schema();
        assert_eq!(
            schema,
            json!({
                "name": { "title": {} },
                "age": { "number": {} },
                "category": {
                    "type": "select",
                    "select": {
                        "options": [
                            { "name": "A", "color": "default" },
                            { "name": "B", "color": "default" },
                        ]
                    }
                }
            })
        );
    }

    #[test]
    fn first_field_is_title_whatever_its_kind() {
        let schema = RecordSchema::new("Counter", FieldDescriptor::new("count", FieldKind::Integer))
            .field(FieldDescriptor::new("label", FieldKind::Text));

        assert_eq!(schema.title().name, "count");
        assert_eq!(
            schema.to_schema(),
            json!({ "count": { "title": {} }, "label": { "rich_text": {} } })
        );
        let encoded = schema
            .encode(&[FieldValue::Integer(42), FieldValue::Text("x".into())])
            .expect("encode");
        assert_eq!(encoded["count"]["title"][0]["text"]["content"], "42");
    }

    #[test]
    fn float_and_timestamp_map_to_number_and_date() {
        let schema = RecordSchema::new("M", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("height", FieldKind::Float))
            .field(FieldDescriptor::new("birthday", FieldKind::Timestamp));
        assert_eq!(
            schema.to_schema(),
            json!({
                "name": { "title": {} },
                "height": { "number": {} },
                "birthday": { "date": {} },
            })
        );
    }

    #[test]
    fn unmapped_list_falls_back_to_text_column() {
        let schema = RecordSchema::new("Tagged", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("tags", FieldKind::List));
        assert_eq!(schema.to_schema()["tags"], json!({ "rich_text": {} }));

        let encoded = schema
            .encode(&[
                FieldValue::Text("n".into()),
                FieldValue::List(vec!["x".into(), "y".into()]),
            ])
            .expect("encode");
        assert_eq!(encoded["tags"]["rich_text"][0]["text"]["content"], "x, y");
    }

    #[test]
    fn enum_value_carries_only_the_selected_label() {
        let encoded = person_schema()
            .encode(&[
                FieldValue::Text("Ada".into()),
                FieldValue::Integer(36),
                FieldValue::Label("B".into()),
            ])
            .expect("encode");
        assert_eq!(encoded["category"], json!({ "select": { "name": "B" } }));
        assert_eq!(encoded["age"], json!({ "number": 36 }));
    }

    #[test]
    fn encode_rejects_wrong_arity_kind_and_label() {
        let schema = person_schema();
        assert!(matches!(
            schema.encode(&[FieldValue::Text("Ada".into())]),
            Err(SchemaError::Arity { expected: 3, actual: 1, .. })
        ));
        assert!(matches!(
            schema.encode(&[
                FieldValue::Text("Ada".into()),
                FieldValue::Text("36".into()),
                FieldValue::Label("A".into()),
            ]),
            Err(SchemaError::KindMismatch { field: "age", .. })
        ));
        assert!(matches!(
            schema.encode(&[
                FieldValue::Text("Ada".into()),
                FieldValue::Integer(36),
                FieldValue::Label("C".into()),
            ]),
            Err(SchemaError::UnknownLabel { field: "category", .. })
        ));
    }

    #[test]
    fn long_text_is_split_into_chunks() {
        let schema = RecordSchema::new("Note", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("body", FieldKind::Text));
        let body = "a".repeat(TEXT_CHUNK_LIMIT + 10);
        let encoded = schema
            .encode(&[FieldValue::Text("n".into()), FieldValue::Text(body.clone())])
            .expect("encode");
        let chunks = encoded["body"]["rich_text"].as_array().expect("array");
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[1]["text"]["content"].as_str().map(str::len),
            Some(10)
        );
        assert_eq!(
            schema.decode("body", &encoded["body"]).expect("decode"),
            FieldValue::Text(body)
        );
    }

    #[test]
    fn empty_values_encode_as_destination_empties() {
        let schema = RecordSchema::new("E", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("url", FieldKind::Text))
            .field(FieldDescriptor::new("when", FieldKind::Timestamp))
            .field(FieldDescriptor::new("kind", FieldKind::Enumeration(CATEGORIES)));
        let encoded = schema
            .encode(&[
                FieldValue::Text("n".into()),
                FieldValue::Empty,
                FieldValue::Empty,
                FieldValue::Empty,
            ])
            .expect("encode");
        assert_eq!(encoded["url"], json!({ "rich_text": [] }));
        assert_eq!(encoded["when"], json!({ "date": null }));
        assert_eq!(encoded["kind"], json!({ "select": null }));
        assert_eq!(schema.decode("when", &encoded["when"]), Ok(FieldValue::Empty));
    }

    #[test]
    fn decode_reads_destination_response_shapes() {
        let schema = RecordSchema::new("M", FieldDescriptor::new("name", FieldKind::Text))
            .field(FieldDescriptor::new("updated", FieldKind::Timestamp))
            .watermark("updated");
        let property = json!({
            "id": "abc",
            "type": "date",
            "date": { "start": "2025-01-02T03:04:05.000+00:00", "end": null }
        });
        let expected = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(schema.watermark_field().map(|d| d.name), Some("updated"));
        assert_eq!(
            schema.decode("updated", &property),
            Ok(FieldValue::Timestamp(expected))
        );
        assert!(matches!(
            schema.decode("missing", &property),
            Err(SchemaError::UnknownField { .. })
        ));
    }
}
