//! Dataset acquisition: JSON Lines first, single JSON array as fallback.
//!
//! The fallback is an explicit branch on [`ParseOutcome`], not an error handler.
//! Every record must carry a string `"text"` field; the check runs right after
//! parsing so malformed input is rejected before any model is loaded.

use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The one field the trainer reads from every record.
pub const TEXT_FIELD: &str = "text";

/// A single dataset record (a JSON object).
pub type Record = Map<String, Value>;

/// Which parse attempt produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    JsonLines,
    JsonArray,
}

/// Result of the two-attempt parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    ParsedAsLines(Vec<Record>),
    ParsedAsArray(Vec<Record>),
    Failed {
        lines_error: String,
        array_error: String,
    },
}

impl ParseOutcome {
    pub fn strategy(&self) -> Option<ParseStrategy> {
        match self {
            Self::ParsedAsLines(_) => Some(ParseStrategy::JsonLines),
            Self::ParsedAsArray(_) => Some(ParseStrategy::JsonArray),
            Self::Failed { .. } => None,
        }
    }
}

/// Parse `content` as JSON Lines, falling back to a single JSON array.
pub fn parse_dataset(content: &str) -> ParseOutcome {
    let lines_error = match parse_json_lines(content) {
        Ok(records) => return ParseOutcome::ParsedAsLines(records),
        Err(e) => e,
    };

    match parse_json_array(content) {
        Ok(records) => ParseOutcome::ParsedAsArray(records),
        Err(array_error) => ParseOutcome::Failed {
            lines_error,
            array_error,
        },
    }
}

fn parse_json_lines(content: &str) -> std::result::Result<Vec<Record>, String> {
    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("line {}: {e}", lineno + 1))?;
        match value {
            Value::Object(map) => records.push(map),
            other => {
                return Err(format!(
                    "line {}: expected a JSON object, found {}",
                    lineno + 1,
                    json_kind(&other)
                ));
            }
        }
    }
    if records.is_empty() {
        return Err("no JSON objects found".to_string());
    }
    Ok(records)
}

fn parse_json_array(content: &str) -> std::result::Result<Vec<Record>, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let Value::Array(items) = value else {
        return Err(format!("expected a JSON array, found {}", json_kind(&value)));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(format!(
                "element {i}: expected a JSON object, found {}",
                json_kind(&other)
            )),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A loaded, validated, read-only text dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    records: Vec<Record>,
}

impl Dataset {
    /// Build a dataset, checking that every record has a string `field`.
    pub fn from_records(records: Vec<Record>, field: &str) -> Result<Self> {
        if records.is_empty() {
            return Err(TuneError::dataset("dataset contains no records"));
        }
        if let Some(index) = records
            .iter()
            .position(|r| !matches!(r.get(field), Some(Value::String(_))))
        {
            return Err(TuneError::MissingField {
                index,
                field: field.to_string(),
            });
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Text of record `index` under `field`.
    pub fn text(&self, index: usize, field: &str) -> Option<&str> {
        self.records.get(index)?.get(field)?.as_str()
    }

    /// Union of keys over all records, in first-seen order.
    pub fn column_names(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for record in &self.records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Serialize the dataset as JSON Lines for a training helper.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut output = String::new();
        for record in &self.records {
            output.push_str(&serde_json::to_string(record)?);
            output.push('\n');
        }
        Ok(output)
    }

    /// Write the dataset as JSON Lines to `path`.
    pub async fn write_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_jsonl()?).await?;
        Ok(())
    }
}

/// A dataset together with how it was obtained.
#[derive(Debug, Clone)]
pub struct AcquiredDataset {
    pub dataset: Dataset,
    pub strategy: ParseStrategy,
    pub source: PathBuf,
}

/// Read `path`, parse it and validate the text field.
pub async fn acquire_dataset(path: &Path, field: &str) -> Result<AcquiredDataset> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            TuneError::not_found(format!("dataset file {}", path.display()))
        }
        _ => TuneError::dataset(format!("failed to read dataset {}: {e}", path.display())),
    })?;

    let outcome = parse_dataset(&content);
    let (records, strategy) = match outcome {
        ParseOutcome::ParsedAsLines(records) => (records, ParseStrategy::JsonLines),
        ParseOutcome::ParsedAsArray(records) => {
            warn!(
                path = %path.display(),
                "Dataset is not JSON Lines, loaded it as a single JSON array"
            );
            (records, ParseStrategy::JsonArray)
        }
        ParseOutcome::Failed {
            lines_error,
            array_error,
        } => {
            return Err(TuneError::dataset(format!(
                "could not load {}: ensure it is either JSON Lines or a single JSON array of \
                 objects (as JSON Lines: {lines_error}; as JSON array: {array_error})",
                path.display()
            )));
        }
    };

    let dataset = Dataset::from_records(records, field)?;
    info!(
        path = %path.display(),
        records = dataset.len(),
        strategy = ?strategy,
        "Dataset loaded"
    );
    if let Some(first) = dataset.get(0) {
        let first = serde_json::Value::Object(first.clone()).to_string();
        info!(first = %first, "First example");
    }

    Ok(AcquiredDataset {
        dataset,
        strategy,
        source: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_array_scenario_falls_back() {
        let outcome = parse_dataset(r#"[{"text": "a"}, {"text": "b"}]"#);
        assert_eq!(outcome.strategy(), Some(ParseStrategy::JsonArray));
        let ParseOutcome::ParsedAsArray(records) = outcome else {
            panic!("expected array fallback");
        };
        let dataset = Dataset::from_records(records, TEXT_FIELD).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.text(0, TEXT_FIELD), Some("a"));
    }

    #[test]
    fn test_lines_scenario_uses_primary_path() {
        let outcome = parse_dataset("{\"text\": \"a\"}\n{\"text\": \"b\"}\n");
        let ParseOutcome::ParsedAsLines(records) = outcome else {
            panic!("expected JSON Lines");
        };
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_pretty_printed_array_falls_back() {
        let content = "[\n  {\"text\": \"a\"},\n  {\"text\": \"b\"},\n  {\"text\": \"c\"}\n]\n";
        match parse_dataset(content) {
            ParseOutcome::ParsedAsArray(records) => assert_eq!(records.len(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let outcome = parse_dataset("\n{\"text\": \"a\"}\n\n   \n{\"text\": \"b\"}");
        assert!(matches!(outcome, ParseOutcome::ParsedAsLines(ref r) if r.len() == 2));
    }

    #[test]
    fn test_garbage_fails_both_attempts() {
        let outcome = parse_dataset("not json at all");
        let ParseOutcome::Failed {
            lines_error,
            array_error,
        } = outcome
        else {
            panic!("expected failure");
        };
        assert!(lines_error.starts_with("line 1"));
        assert!(!array_error.is_empty());
    }

    #[test]
    fn test_array_of_scalars_fails() {
        let outcome = parse_dataset("[1, 2, 3]");
        assert!(matches!(outcome, ParseOutcome::Failed { .. }));
    }

    #[test]
    fn test_empty_array_parses_but_is_rejected() {
        let outcome = parse_dataset("[]");
        let ParseOutcome::ParsedAsArray(records) = outcome else {
            panic!("expected array");
        };
        assert!(records.is_empty());
        let err = Dataset::from_records(records, TEXT_FIELD).unwrap_err();
        assert!(matches!(err, TuneError::Dataset(_)));
    }

    #[test]
    fn test_missing_text_field_names_record() {
        let ParseOutcome::ParsedAsLines(records) =
            parse_dataset("{\"text\": \"a\"}\n{\"prompt\": \"b\"}\n")
        else {
            panic!("expected JSON Lines");
        };
        let err = Dataset::from_records(records, TEXT_FIELD).unwrap_err();
        match err {
            TuneError::MissingField { index, field } => {
                assert_eq!(index, 1);
                assert_eq!(field, "text");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_string_text_is_rejected() {
        let ParseOutcome::ParsedAsLines(records) = parse_dataset("{\"text\": 5}") else {
            panic!("expected JSON Lines");
        };
        assert!(Dataset::from_records(records, TEXT_FIELD).is_err());
    }

    #[test]
    fn test_column_names_union() {
        let ParseOutcome::ParsedAsLines(records) =
            parse_dataset("{\"text\": \"a\", \"id\": 1}\n{\"text\": \"b\", \"lang\": \"en\"}\n")
        else {
            panic!("expected JSON Lines");
        };
        let dataset = Dataset::from_records(records, TEXT_FIELD).unwrap();
        let mut columns = dataset.column_names();
        columns.sort();
        assert_eq!(columns, vec!["id", "lang", "text"]);
    }

    #[test]
    fn test_to_jsonl_is_reparsed_as_lines() {
        let ParseOutcome::ParsedAsArray(records) =
            parse_dataset(r#"[{"text": "a"}, {"text": "b"}]"#)
        else {
            panic!("expected array");
        };
        let dataset = Dataset::from_records(records, TEXT_FIELD).unwrap();
        let reparsed = parse_dataset(&dataset.to_jsonl().unwrap());
        assert_eq!(reparsed.strategy(), Some(ParseStrategy::JsonLines));
    }

    #[tokio::test]
    async fn test_acquire_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = acquire_dataset(&dir.path().join("absent.json"), TEXT_FIELD)
            .await
            .unwrap_err();
        assert!(matches!(err, TuneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_acquire_array_file_logs_first_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"[{"text": "a", "id": 1}, {"text": "b"}]"#).unwrap();

        let acquired = acquire_dataset(&path, TEXT_FIELD).await.unwrap();
        assert_eq!(acquired.strategy, ParseStrategy::JsonArray);
        assert_eq!(acquired.dataset.len(), 2);
        assert_eq!(acquired.dataset.text(0, TEXT_FIELD), Some("a"));
        assert_eq!(acquired.source, path);
    }

    #[tokio::test]
    async fn test_acquire_reports_both_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"text\": ").unwrap();
        let err = acquire_dataset(&path, TEXT_FIELD).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("as JSON Lines"));
        assert!(msg.contains("as JSON array"));
    }
}
