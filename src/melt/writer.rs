use crate::melt::plan::{MeltPlan, TablePlan};
use crate::melt::types::{MeltConfig, OutputFormat, Row, TableFamily, TableSet};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Encode a value as a double-quoted literal.
///
/// JSON string escaping (`\"`, `\\`, `\n`, ...) is also understood by
/// MySQL inside a double-quoted string.
pub fn sql_literal(value: &Value) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode value")
}

/// The row's values in `columns` order, with the sentinel for any column
/// the row does not carry
pub fn project(row: &Row, columns: &[String], sentinel: &Value) -> Map<String, Value> {
    columns
        .iter()
        .map(|column| {
            let value = row.get(column).unwrap_or(sentinel).clone();
            (column.clone(), value)
        })
        .collect()
}

/// Writes the rows of one table incrementally.
///
/// In SQL format at most one chunk of encoded tuples is held back, so the
/// writer knows whether a tuple is the last of the table only when the
/// next row arrives or `finish` is called. The output is the same whether
/// rows are fed one record at a time or all at once.
pub struct TableWriter<W: Write> {
    out: W,
    table: TablePlan,
    format: OutputFormat,
    chunk_size: usize,
    sentinel: Value,
    pending: Vec<String>,
    rows_written: usize,
}

impl<W: Write> TableWriter<W> {
    /// Create a writer and emit the table's header
    pub fn new(mut out: W, table: &TablePlan, config: &MeltConfig) -> Result<Self> {
        match config.format {
            OutputFormat::Sql => {
                let preamble = table.render_preamble();
                if !preamble.is_empty() {
                    writeln!(out, "{}", preamble).context("Failed to write preamble")?;
                }
            }
            OutputFormat::Json => {
                let name = serde_json::to_string(&table.name)?;
                write!(out, "{{{}:[", name).context("Failed to write document header")?;
            }
        }

        Ok(TableWriter {
            out,
            table: table.clone(),
            format: config.format,
            chunk_size: config.chunk_size.max(1),
            sentinel: config.null(),
            pending: Vec::new(),
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        match self.format {
            OutputFormat::Sql => {
                if self.pending.len() == self.chunk_size {
                    self.flush_chunk(false)?;
                }
                let tuple = self.encode_tuple(row)?;
                self.pending.push(tuple);
            }
            OutputFormat::Json => {
                if self.rows_written > 0 {
                    self.out.write_all(b",")?;
                }
                let projected = project(row, &self.table.columns, &self.sentinel);
                serde_json::to_writer(&mut self.out, &projected)
                    .context("Failed to serialize row")?;
                self.rows_written += 1;
            }
        }
        Ok(())
    }

    /// Terminate the last statement or document and hand back the output
    pub fn finish(mut self) -> Result<W> {
        match self.format {
            OutputFormat::Sql => {
                if !self.pending.is_empty() {
                    self.flush_chunk(true)?;
                }
            }
            OutputFormat::Json => {
                writeln!(self.out, "]}}").context("Failed to close document")?;
            }
        }
        self.out.flush().context("Failed to flush writer")?;
        debug!(table = %self.table.name, rows = self.rows_written, "finished table");
        Ok(self.out)
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written + self.pending.len()
    }

    fn encode_tuple(&self, row: &Row) -> Result<String> {
        let values = self
            .table
            .columns
            .iter()
            .map(|column| sql_literal(row.get(column).unwrap_or(&self.sentinel)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", values.join(", ")))
    }

    /// One `INSERT IGNORE` statement. Only the table's last tuple carries
    /// the `;`; a statement followed by another is closed on its own line.
    fn flush_chunk(&mut self, last: bool) -> Result<()> {
        writeln!(
            self.out,
            "INSERT IGNORE INTO {} ({})\nVALUES\n{}{}",
            self.table.name,
            self.table.columns.join(", "),
            self.pending.join(",\n"),
            if last { ";" } else { "\n;" }
        )
        .context("Failed to write insert statement")?;

        self.rows_written += self.pending.len();
        self.pending.clear();
        Ok(())
    }
}

/// Write one table's rows to `out` in the configured format
pub fn dump<W: Write>(rows: &[Row], table: &TablePlan, out: W, config: &MeltConfig) -> Result<W> {
    let mut writer = TableWriter::new(out, table, config)?;
    for row in rows {
        writer.write_row(row)?;
    }
    writer.finish()
}

fn create_table_file(dir: &Path, table: &TablePlan, config: &MeltConfig) -> Result<BufWriter<File>> {
    let path = dir.join(table.file_name(config.format.extension()));
    let file = File::create(&path).context(format!("Failed to create file: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Dump every table of `plan` from an accumulated set into `dir`
pub fn write_tables(tables: &TableSet, plan: &MeltPlan, dir: &Path, config: &MeltConfig) -> Result<()> {
    std::fs::create_dir_all(dir).context("Failed to create output directory")?;

    for table in &plan.tables {
        let rows = tables.rows(table.family);
        let out = create_table_file(dir, table, config)?;
        dump(rows, table, out, config).context(format!("Failed to dump table {}", table.name))?;
        info!(table = %table.name, rows = rows.len(), "wrote table");
    }
    Ok(())
}

/// Destination for the rows of records that melted successfully
pub trait TableSink {
    fn commit(&mut self, rows: TableSet) -> Result<()>;
}

/// Accumulate everything in memory, to be dumped with `write_tables`
impl TableSink for TableSet {
    fn commit(&mut self, rows: TableSet) -> Result<()> {
        self.append(rows);
        Ok(())
    }
}

/// One open `TableWriter` per table, fed as records are committed
pub struct StreamingWriter {
    writers: Vec<(TableFamily, TableWriter<BufWriter<File>>)>,
}

impl StreamingWriter {
    /// Create every table file in `dir` and write its header
    pub fn create(dir: &Path, plan: &MeltPlan, config: &MeltConfig) -> Result<Self> {
        std::fs::create_dir_all(dir).context("Failed to create output directory")?;

        let writers = plan
            .tables
            .iter()
            .map(|table| -> Result<_> {
                let out = create_table_file(dir, table, config)?;
                Ok((table.family, TableWriter::new(out, table, config)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StreamingWriter { writers })
    }

    /// Close every table
    pub fn finish(self) -> Result<()> {
        for (_, writer) in self.writers {
            let name = writer.table.name.clone();
            let rows = writer.rows_written();
            writer.finish().context(format!("Failed to finish table {}", name))?;
            info!(table = %name, rows, "wrote table");
        }
        Ok(())
    }
}

impl TableSink for StreamingWriter {
    fn commit(&mut self, rows: TableSet) -> Result<()> {
        for (family, writer) in &mut self.writers {
            for row in rows.rows(*family) {
                writer.write_row(row)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::melt::types::keyed_row;

    fn plan() -> TablePlan {
        TablePlan::new(
            "keywords",
            TableFamily::Keyword,
            &["wos_id", "keyword"],
            "CREATE TABLE IF NOT EXISTS {table} (wos_id VARCHAR(64), keyword VARCHAR(255));"
                .to_string(),
        )
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = keyed_row(&format!("WOS:{}", i));
                row.insert("keyword".to_string(), Value::String(format!("kw \"{}\"", i)));
                row
            })
            .collect()
    }

    fn sql(rows: &[Row], config: &MeltConfig) -> String {
        String::from_utf8(dump(rows, &plan(), Vec::new(), config).unwrap()).unwrap()
    }

    /// Decode the value tuples back into string vectors
    fn tuples(output: &str) -> Vec<Vec<String>> {
        output
            .lines()
            .filter(|line| line.starts_with('('))
            .map(|line| {
                let inner = &line[1..line.rfind(')').unwrap()];
                serde_json::from_str(&format!("[{}]", inner)).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_sql_literal_escapes() {
        let value = Value::String("O'Brien \"quoted\"\nnext".to_string());
        assert_eq!(sql_literal(&value).unwrap(), r#""O'Brien \"quoted\"\nnext""#);
    }

    #[test]
    fn test_chunking() {
        let output = sql(&rows(2500), &MeltConfig::default());

        let blocks: Vec<&str> = output.split("INSERT IGNORE INTO").skip(1).collect();
        assert_eq!(blocks.len(), 3);
        let sizes: Vec<usize> = blocks
            .iter()
            .map(|b| b.lines().filter(|l| l.starts_with('(')).count())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);

        let terminated = output
            .lines()
            .filter(|l| l.starts_with('(') && l.ends_with(");"))
            .count();
        assert_eq!(terminated, 1);
        assert!(output.ends_with(");\n"));
        assert_eq!(output.lines().filter(|l| *l == ";").count(), 2);
    }

    #[test]
    fn test_statement_framing() {
        let output = sql(&rows(2), &MeltConfig::default());
        assert_eq!(
            output,
            "CREATE TABLE IF NOT EXISTS keywords (wos_id VARCHAR(64), keyword VARCHAR(255));\n\
             INSERT IGNORE INTO keywords (wos_id, keyword)\n\
             VALUES\n\
             (\"WOS:0\", \"kw \\\"0\\\"\"),\n\
             (\"WOS:1\", \"kw \\\"1\\\"\");\n"
        );
    }

    #[test]
    fn test_round_trip_in_column_order() {
        let mut input = rows(3);
        input[1].remove("keyword");
        // Not a column of the table
        input[2].insert("extra".to_string(), Value::String("x".to_string()));

        let decoded = tuples(&sql(&input, &MeltConfig::default()));
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], vec!["WOS:0", "kw \"0\""]);
        assert_eq!(decoded[1], vec!["WOS:1", "NULL"]);
        assert_eq!(decoded[2], vec!["WOS:2", "kw \"2\""]);
    }

    #[test]
    fn test_custom_sentinel_and_chunk_size() {
        let config = MeltConfig {
            sentinel: "\\N".to_string(),
            chunk_size: 2,
            ..MeltConfig::default()
        };
        let mut input = rows(5);
        input[4].remove("keyword");
        let output = sql(&input, &config);

        assert_eq!(output.matches("INSERT IGNORE INTO").count(), 3);
        assert_eq!(tuples(&output)[4], vec!["WOS:4", "\\N"]);
    }

    #[test]
    fn test_empty_table_writes_only_preamble() {
        let output = sql(&[], &MeltConfig::default());
        assert_eq!(output.lines().count(), 1);
        assert!(!output.contains("INSERT"));
    }

    #[test]
    fn test_json_document() {
        let config = MeltConfig {
            format: OutputFormat::Json,
            ..MeltConfig::default()
        };
        let mut input = rows(2);
        input[1].remove("keyword");
        let output = sql(&input, &config);

        assert!(output.starts_with(r#"{"keywords":[{"wos_id":"WOS:0","keyword""#));
        let doc: Value = serde_json::from_str(&output).unwrap();
        let table = doc["keywords"].as_array().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[1]["keyword"], "NULL");

        let empty: Value = serde_json::from_str(&sql(&[], &config)).unwrap();
        assert_eq!(empty, serde_json::json!({"keywords": []}));
    }

    #[test]
    fn test_incremental_writes_match_dump() {
        let input = rows(7);
        let config = MeltConfig {
            chunk_size: 3,
            ..MeltConfig::default()
        };

        let mut writer = TableWriter::new(Vec::new(), &plan(), &config).unwrap();
        for row in &input {
            writer.write_row(row).unwrap();
        }
        assert_eq!(writer.rows_written(), 7);
        let streamed = writer.finish().unwrap();

        assert_eq!(String::from_utf8(streamed).unwrap(), sql(&input, &config));
    }

    #[test]
    fn test_write_tables_creates_one_file_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = TableSet::new();
        set.extend(TableFamily::Keyword, rows(2));

        let plan = MeltPlan { tables: vec![plan()] };
        write_tables(&set, &plan, dir.path(), &MeltConfig::default()).unwrap();

        let written = std::fs::read_to_string(dir.path().join("keywords.sql")).unwrap();
        assert_eq!(tuples(&written).len(), 2);
    }
}
