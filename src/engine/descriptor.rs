//! Units of work going in (descriptors, jobs) and rows coming out.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::client::{DEFAULT_OPERATION, Invocable, Params};
use crate::error::Result;

/// One queued API call. Immutable once enqueued.
#[derive(Clone)]
pub struct CallDescriptor {
    pub endpoint: String,
    pub invocable: Arc<dyn Invocable>,
    pub parameters: Params,
    pub metadata: Params,
}

impl CallDescriptor {
    pub fn new(endpoint: impl Into<String>, invocable: Arc<dyn Invocable>, parameters: Params, metadata: Params) -> Self {
        Self {
            endpoint: endpoint.into(),
            invocable,
            parameters,
            metadata,
        }
    }

    /// The `model` parameter, if any.
    pub fn model(&self) -> Option<&str> {
        self.parameters.get("model").and_then(Value::as_str)
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("endpoint", &self.endpoint)
            .field("parameters", &self.parameters)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn default_endpoint() -> String {
    DEFAULT_OPERATION.to_string()
}

/// A job as read from a JSONL file: `{"endpoint": ..., "metadata": {...}, "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub metadata: Params,
    #[serde(default, alias = "parameters")]
    pub params: Params,
}

impl Job {
    pub fn new(endpoint: impl Into<String>, metadata: Params, params: Params) -> Self {
        Self {
            endpoint: endpoint.into(),
            metadata,
            params,
        }
    }

    /// Parse one job per non-blank line.
    pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<Job>> {
        let reader = BufReader::new(File::open(path)?);
        let mut jobs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                jobs.push(serde_json::from_str(&line)?);
            }
        }
        Ok(jobs)
    }
}

/// One successful call. Never mutated after it is appended to the output.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub metadata: Params,
    pub endpoint: String,
    pub parameters: Params,
    pub result: Value,
}

impl ResultRow {
    /// Flatten into a single record: metadata keys, `endpoint`, parameter keys, `result`.
    pub fn to_record(&self) -> Params {
        let mut record = self.metadata.clone();
        record.insert("endpoint".to_string(), Value::String(self.endpoint.clone()));
        record.extend(self.parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        record.insert("result".to_string(), self.result.clone());
        record
    }

    /// Resolve a dotted field path.
    ///
    /// `metadata.x`, `parameters.x` (or `params.x`), `result.a.b` and
    /// `endpoint` address a section explicitly; a bare key is looked up in
    /// metadata first, then parameters.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        match (head, rest) {
            ("endpoint", None) => Some(Value::String(self.endpoint.clone())),
            ("metadata", Some(rest)) => nested(&self.metadata, rest),
            ("parameters" | "params", Some(rest)) => nested(&self.parameters, rest),
            ("result", Some(rest)) => pointer(&self.result, rest),
            ("result", None) => Some(self.result.clone()),
            _ => nested(&self.metadata, path).or_else(|| nested(&self.parameters, path)),
        }
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_record().serialize(serializer)
    }
}

fn nested(map: &Params, path: &str) -> Option<Value> {
    match path.split_once('.') {
        Some((key, rest)) => map.get(key).and_then(|v| pointer(v, rest)),
        None => map.get(path).cloned(),
    }
}

fn pointer(value: &Value, path: &str) -> Option<Value> {
    value.pointer(&format!("/{}", path.replace('.', "/"))).cloned()
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Final tally for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub queued: u64,
    pub succeeded: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub tokens: u64,
    pub exit_code: i32,
    pub cancelled: bool,
}

impl RunSummary {
    /// Descriptors that reached a terminal outcome.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.timed_out + self.failed
    }
}

/// Output of a run: rows in arrival order, or sorted by the configured index.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    rows: Vec<ResultRow>,
    index: Option<Vec<String>>,
    summary: RunSummary,
}

impl ResultSet {
    pub fn new(rows: Vec<ResultRow>, index: Option<Vec<String>>, summary: RunSummary) -> Self {
        let mut set = Self { rows, index, summary };
        set.sort_by_index();
        set
    }

    /// Stable ascending sort over the index fields; a no-op without an index.
    pub fn sort_by_index(&mut self) {
        let Some(index) = self.index.as_ref() else {
            return;
        };
        let mut keyed: Vec<(Vec<Value>, ResultRow)> = self
            .rows
            .drain(..)
            .map(|row| {
                let key = index.iter().map(|f| row.lookup(f).unwrap_or(Value::Null)).collect();
                (key, row)
            })
            .collect();

        keyed.sort_by(|(a, _), (b, _)| {
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| compare_values(x, y))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    /// Append another set's rows, re-sorting if indexed.
    pub fn extend(&mut self, other: ResultSet) {
        self.rows.extend(other.rows);
        self.summary.queued += other.summary.queued;
        self.summary.succeeded += other.summary.succeeded;
        self.summary.timed_out += other.summary.timed_out;
        self.summary.failed += other.summary.failed;
        self.summary.tokens += other.summary.tokens;
        self.summary.cancelled |= other.summary.cancelled;
        if self.summary.exit_code == 0 {
            self.summary.exit_code = other.summary.exit_code;
        }
        self.sort_by_index();
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn index(&self) -> Option<&[String]> {
        self.index.as_deref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter()
    }

    /// Write one flattened row per line.
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        for row in &self.rows {
            writeln!(writer, "{}", serde_json::to_string(row)?)?;
        }
        writer.flush()?;
        Ok(())
    }
}
