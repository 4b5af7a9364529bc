//! Record source: turn an uploaded object into records.
//!
//! Supported layouts:
//! - CSV with a header row, one record per row
//! - YAML or JSON: a list of flat maps, or `{records: [...]}`
//! - key/value CSV (`*.kv.csv`): two columns per row, the whole file is one
//!   stack named `{file stem}-stack`

use crate::error::{BackendError, ProvisionError};
use crate::record::Record;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

/// Object storage read access.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    KeyValueCsv,
    Yaml,
    Json,
}

impl FileFormat {
    /// Pick a format from the object key's extension.
    pub fn detect(key: &str) -> Result<Self, ProvisionError> {
        let lower = key.to_ascii_lowercase();
        if lower.ends_with(".kv.csv") {
            Ok(FileFormat::KeyValueCsv)
        } else if lower.ends_with(".csv") {
            Ok(FileFormat::Csv)
        } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            Ok(FileFormat::Yaml)
        } else if lower.ends_with(".json") {
            Ok(FileFormat::Json)
        } else {
            Err(ProvisionError::Source(format!(
                "cannot tell the format of '{}' from its extension",
                key
            )))
        }
    }
}

/// Fetch `bucket/key` and parse it into records.
pub async fn load_records<O: ObjectSource + ?Sized>(
    source: &O,
    bucket: &str,
    key: &str,
) -> Result<Vec<Record>, ProvisionError> {
    let format = FileFormat::detect(key)?;
    let body = source.get_object(bucket, key).await?;
    parse_records(format, &body, key)
}

pub fn parse_records(
    format: FileFormat,
    body: &[u8],
    object_key: &str,
) -> Result<Vec<Record>, ProvisionError> {
    match format {
        FileFormat::Csv => parse_csv(body),
        FileFormat::KeyValueCsv => parse_key_value_csv(body, object_key),
        FileFormat::Yaml => {
            let doc: Value = serde_yaml::from_slice(body)
                .map_err(|e| ProvisionError::Source(format!("invalid YAML: {}", e)))?;
            records_from_document(doc)
        }
        FileFormat::Json => {
            let doc: Value = serde_json::from_slice(body)
                .map_err(|e| ProvisionError::Source(format!("invalid JSON: {}", e)))?;
            records_from_document(doc)
        }
    }
}

fn parse_csv(body: &[u8]) -> Result<Vec<Record>, ProvisionError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    let headers = reader
        .headers()
        .map_err(|e| ProvisionError::Source(format!("invalid CSV header: {}", e)))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| ProvisionError::Source(format!("invalid CSV row: {}", e)))?;
        let record: Record = headers
            .iter()
            .zip(row.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.to_string(), value.to_string()))
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn parse_key_value_csv(body: &[u8], object_key: &str) -> Result<Vec<Record>, ProvisionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    let mut record = Record::new();
    record.insert("StackName".into(), format!("{}-stack", file_stem(object_key)));
    for row in reader.records() {
        let row = row.map_err(|e| ProvisionError::Source(format!("invalid CSV row: {}", e)))?;
        if row.len() == 2 {
            record.insert(row[0].to_string(), row[1].to_string());
        }
    }
    Ok(vec![record])
}

fn file_stem(object_key: &str) -> String {
    let name = Path::new(object_key)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(object_key);
    let lower = name.to_ascii_lowercase();
    let cut = [".kv.csv", ".csv"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| name.len() - ext.len())
        .unwrap_or(name.len());
    name[..cut].to_string()
}

fn records_from_document(doc: Value) -> Result<Vec<Record>, ProvisionError> {
    let items = match doc {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ProvisionError::Source(
                    "expected a list of records or a 'records' list".into(),
                ))
            }
        },
        Value::Null => Vec::new(),
        _ => {
            return Err(ProvisionError::Source(
                "expected a list of records".into(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(fields) => fields
                .into_iter()
                .map(|(key, value)| scalar(value, i + 1).map(|v| (key, v)))
                .collect(),
            _ => Err(ProvisionError::Source(format!(
                "record {} is not a map of fields",
                i + 1
            ))),
        })
        .collect()
}

fn scalar(value: Value, index: usize) -> Result<String, ProvisionError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => Err(ProvisionError::Source(format!(
            "record {} has a nested value; fields must be scalars",
            index
        ))),
    }
}
