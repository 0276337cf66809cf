//! Record melting - flatten bibliographic XML records into relational tables
//!
//! A document is split into records (`reader`), each record is parsed into
//! an element tree (`record`) and melted into rows for every table family
//! (`extractor`). The rows of a record are committed together, either to an
//! in-memory `TableSet` dumped at the end or to per-table streaming writers
//! (`writer`), using the column order and preambles of a `MeltPlan` (`plan`).

pub mod types;
pub mod reader;
pub mod record;
pub mod extractor;
pub mod plan;
pub mod writer;

pub use types::{MeltConfig, OutputFormat, Row, TableFamily, TableSet, UnknownKeyPolicy};
pub use reader::RecordReader;
pub use record::{parse_record, Element, ParsedRecord};
pub use extractor::WosMelter;
pub use plan::{KeyMap, MeltPlan, TablePlan};
pub use writer::{dump, write_tables, StreamingWriter, TableSink, TableWriter};
