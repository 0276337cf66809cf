use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sentinel written for an absent optional field
pub const DEFAULT_SENTINEL: &str = "NULL";

/// Rows per `INSERT IGNORE` statement
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// One flat output row: column name -> value.
///
/// Every row produced by an extractor carries a `wos_id` column.
pub type Row = Map<String, Value>;

/// Start a row owned by the record `wos_id`
pub fn keyed_row(wos_id: &str) -> Row {
    let mut row = Row::new();
    row.insert("wos_id".to_string(), Value::String(wos_id.to_string()));
    row
}

/// The kind of rows an extractor produces. Several output tables may
/// project the same family (e.g. `source` and `publications`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFamily {
    Publication,
    Language,
    Heading,
    Subheading,
    Subject,
    Publisher,
    Contributor,
    Institution,
    Affiliation,
    Edition,
    Reference,
    FundingText,
    Funding,
    Keyword,
    KeywordPlus,
    Conference,
    ConferenceSponsor,
    UnindexedPublication,
    UnindexedContributor,
}

/// Rows grouped by table family, in arrival order.
///
/// Used both as the per-record staging buffer and as the run-wide
/// accumulator: a record's set is appended to the accumulator only once
/// all of its extractors have succeeded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    tables: BTreeMap<TableFamily, Vec<Row>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, family: TableFamily, row: Row) {
        self.tables.entry(family).or_default().push(row);
    }

    pub fn extend<I: IntoIterator<Item = Row>>(&mut self, family: TableFamily, rows: I) {
        let mut rows = rows.into_iter().peekable();
        if rows.peek().is_some() {
            self.tables.entry(family).or_default().extend(rows);
        }
    }

    /// Move every row of `other` to the end of this set
    pub fn append(&mut self, other: TableSet) {
        for (family, rows) in other.tables {
            self.extend(family, rows);
        }
    }

    pub fn rows(&self, family: TableFamily) -> &[Row] {
        self.tables.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, family: TableFamily) -> usize {
        self.rows(family).len()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableFamily, &[Row])> {
        self.tables.iter().map(|(family, rows)| (*family, rows.as_slice()))
    }
}

/// What to do with a title type, identifier type or attribute that has no
/// column in the key maps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKeyPolicy {
    /// Collect into the row's `overflow` column as a JSON object
    #[default]
    Overflow,
    /// Discard silently
    Drop,
    /// Reject the whole record
    Error,
}

/// Output serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Chunked `INSERT IGNORE` statements
    #[default]
    Sql,
    /// One `{table: [rows]}` document per table
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Sql => "sql",
            OutputFormat::Json => "json",
        }
    }
}

/// Configuration for the melting process
#[derive(Debug, Clone)]
pub struct MeltConfig {
    /// Value written for absent optional fields
    pub sentinel: String,

    /// Maximum number of value tuples per insert statement
    pub chunk_size: usize,

    /// Policy for keys missing from the explicit key maps
    pub unknown_keys: UnknownKeyPolicy,

    /// Emit rows for cited works that are not indexed themselves
    pub include_unindexed: bool,

    pub format: OutputFormat,
}

impl Default for MeltConfig {
    fn default() -> Self {
        MeltConfig {
            sentinel: String::from(DEFAULT_SENTINEL),
            chunk_size: DEFAULT_CHUNK_SIZE,
            unknown_keys: UnknownKeyPolicy::default(),
            include_unindexed: false,
            format: OutputFormat::default(),
        }
    }
}

impl MeltConfig {
    pub fn null(&self) -> Value {
        Value::String(self.sentinel.clone())
    }

    /// The value itself, or the sentinel when absent
    pub fn or_null(&self, value: Option<&str>) -> Value {
        match value {
            Some(v) => Value::String(v.to_string()),
            None => self.null(),
        }
    }
}
