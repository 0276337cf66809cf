//! # wos_melt - Web of Science XML to relational tables
//!
//! Splits a Web of Science XML export into `<REC>` records, melts every
//! record into normalized rows (publications, contributors, institutions,
//! references, funding, conferences, ...) and writes one file per table,
//! either as chunked `INSERT IGNORE` statements or as JSON documents.
//!
//! ## Quick Start
//!
//! ```rust
//! use wos_melt::melt::{MeltConfig, TableFamily, WosMelter};
//!
//! # fn main() -> anyhow::Result<()> {
//! let xml = r#"<REC><UID>WOS:1</UID><static_data><summary>
//!     <pub_info pubyear="2020"><page begin="1" end="9"/></pub_info>
//!     <titles><title type="item">A Title</title></titles>
//! </summary></static_data></REC>"#;
//!
//! let melter = WosMelter::new(MeltConfig::default());
//! let (wos_id, rows) = melter.melt(xml)?;
//!
//! assert_eq!(wos_id, "WOS:1");
//! assert_eq!(rows.len(TableFamily::Publication), 1);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, error};

pub mod error;
pub mod melt;

// Re-export commonly used types for convenience
pub use error::MeltError;
pub use melt::{
    MeltConfig, MeltPlan, OutputFormat, RecordReader, StreamingWriter, TableSet, TableSink,
    UnknownKeyPolicy, WosMelter,
};

/// Placeholder for records whose identifier could not be read
pub const UNKNOWN_ID: &str = "<unknown>";

/// Record counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeltStats {
    pub records: usize,
    pub committed: usize,
    pub skipped: usize,
}

/// Per-record outcome, reported as records are processed
#[derive(Debug)]
pub enum MeltEvent<'a> {
    Committed { wos_id: &'a str },
    Skipped { wos_id: Option<&'a str>, error: &'a MeltError },
}

/// Melt every record of a stream into `sink`.
///
/// A record that fails to parse or extract is logged, reported and skipped
/// without contributing any rows. Read and sink failures abort the run.
pub fn melt_records<R, S, F>(reader: R, melter: &WosMelter, sink: &mut S, mut on_event: F) -> Result<MeltStats>
where
    R: BufRead,
    S: TableSink,
    F: FnMut(MeltEvent),
{
    let mut stats = MeltStats::default();

    for text in RecordReader::new(reader) {
        let text = text.context("Failed to read record")?;
        stats.records += 1;

        // A record that parsed is reported under its own identifier
        let (wos_id, outcome) = match melt::parse_record(&text) {
            Ok(record) => {
                let outcome = melter.melt_record(&record);
                (Some(record.wos_id), outcome)
            }
            Err(err) => (melt::record::identifier_hint(&text).map(str::to_string), Err(err)),
        };

        match outcome {
            Ok(rows) => {
                let wos_id = wos_id.as_deref().unwrap_or(UNKNOWN_ID);
                sink.commit(rows)
                    .context(format!("Failed to write rows of {}", wos_id))?;
                stats.committed += 1;
                on_event(MeltEvent::Committed { wos_id });
            }
            Err(err) if err.is_record_error() => {
                let wos_id = wos_id.as_deref();
                error!(wos_id = wos_id.unwrap_or(UNKNOWN_ID), error = %err, "skipping record");
                stats.skipped += 1;
                on_event(MeltEvent::Skipped { wos_id, error: &err });
            }
            Err(err) => return Err(err.into()),
        }
    }

    debug!(?stats, "finished melting");
    Ok(stats)
}

/// Melt a stream and write every table of `plan` into `dir`.
///
/// With `streaming` the tables are written as records are committed;
/// otherwise all rows are accumulated and dumped at the end. Both produce
/// identical files.
pub fn melt_to_dir<R, F>(
    reader: R,
    plan: &MeltPlan,
    dir: &Path,
    config: &MeltConfig,
    streaming: bool,
    on_event: F,
) -> Result<MeltStats>
where
    R: BufRead,
    F: FnMut(MeltEvent),
{
    let plan = if config.include_unindexed {
        plan.clone()
    } else {
        plan.clone().without_unindexed()
    };
    let melter = WosMelter::new(config.clone());

    if streaming {
        let mut sink = StreamingWriter::create(dir, &plan, config)?;
        let stats = melt_records(reader, &melter, &mut sink, on_event)?;
        sink.finish()?;
        Ok(stats)
    } else {
        let mut tables = TableSet::new();
        let stats = melt_records(reader, &melter, &mut tables, on_event)?;
        melt::write_tables(&tables, &plan, dir, config)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::melt::TableFamily;
    use std::io::Cursor;

    const SCENARIO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<records xmlns="http://clarivate.com/schema/wok5.27/public/FullRecord">
<REC r_id_disclaimer="ResearcherID data provided by Clarivate">
  <UID>WOS:000123456789</UID>
  <static_data>
    <summary>
      <EWUID><WUID coll_id="WOS"/><edition value="WOS.SCI"/></EWUID>
      <pub_info coverdate="JAN 2020" has_abstract="Y" issue="1" pubtype="Journal" pubyear="2020" vol="7">
        <page begin="1" end="12" page_count="12">1-12</page>
      </pub_info>
      <titles count="2">
        <title type="source">JOURNAL OF EXAMPLES</title>
        <title type="item">An Example Study</title>
      </titles>
      <names count="1">
        <name addr_no="1 2" reprint="Y" role="author" seq_no="1">
          <display_name>Doe, Jane</display_name>
          <full_name>Doe, Jane</full_name>
          <first_name>Jane</first_name>
          <last_name>Doe</last_name>
        </name>
      </names>
      <doctypes count="1"><doctype>Article</doctype></doctypes>
    </summary>
    <fullrecord_metadata>
      <languages count="1"><language type="primary">English</language></languages>
      <addresses count="2">
        <address_name>
          <address_spec addr_no="1">
            <full_address>Univ A, Dept B, City, Country</full_address>
            <city>City</city>
            <country>Country</country>
            <organizations count="2">
              <organization>Univ A</organization>
              <organization pref="Y">University of A</organization>
            </organizations>
            <suborganizations count="1"><suborganization>Dept B</suborganization></suborganizations>
          </address_spec>
          <names count="1"><name addr_no="1" role="author" seq_no="1"><display_name>Doe, Jane</display_name></name></names>
        </address_name>
        <address_name>
          <address_spec addr_no="2">
            <full_address>Inst C, Lab D, Town, Country</full_address>
            <organizations count="1"><organization>Inst C</organization></organizations>
            <suborganizations count="1"><suborganization>Lab D</suborganization></suborganizations>
          </address_spec>
        </address_name>
      </addresses>
      <references count="1">
        <reference>
          <uid>WOS:000000000001</uid>
          <citedAuthor>Smith, J</citedAuthor>
          <year>2001</year>
        </reference>
      </references>
    </fullrecord_metadata>
  </static_data>
</REC>
</records>
"#;

    fn melt_all(input: &str) -> (MeltStats, TableSet, Vec<Option<String>>) {
        let melter = WosMelter::new(MeltConfig::default());
        let mut tables = TableSet::new();
        let mut skipped = Vec::new();
        let stats = melt_records(Cursor::new(input), &melter, &mut tables, |event| {
            if let MeltEvent::Skipped { wos_id, .. } = event {
                skipped.push(wos_id.map(str::to_string));
            }
        })
        .unwrap();
        (stats, tables, skipped)
    }

    fn read_dir(dir: &Path) -> Vec<(String, String)> {
        let mut files: Vec<(String, String)> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let path = entry.unwrap().path();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                (name, std::fs::read_to_string(&path).unwrap())
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (stats, tables, skipped) = melt_all(SCENARIO);

        assert_eq!(stats, MeltStats { records: 1, committed: 1, skipped: 0 });
        assert!(skipped.is_empty());
        assert_eq!(tables.len(TableFamily::Publication), 1);
        assert_eq!(tables.len(TableFamily::Contributor), 1);
        assert_eq!(tables.len(TableFamily::Institution), 3);
        assert!(tables.len(TableFamily::Affiliation) >= 1);
        assert_eq!(tables.len(TableFamily::Reference), 1);

        let publication = &tables.rows(TableFamily::Publication)[0];
        assert_eq!(publication["wos_id"], "WOS:000123456789");
        assert_eq!(publication["title"], "An Example Study");

        let author = &tables.rows(TableFamily::Contributor)[0];
        assert_eq!(author["position"], "1");
        assert_eq!(author["role"], "author");

        assert_eq!(tables.rows(TableFamily::Reference)[0]["cited_id"], "WOS:000000000001");
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let missing_pub_info = r#"<REC><UID>WOS:2</UID><static_data><summary>
            <titles><title type="item">T</title></titles>
            <names><name seq_no="1" role="author"><full_name>X</full_name></name></names>
        </summary></static_data></REC>"#;
        let malformed = "<REC><UID>WOS:3</UID><static_data></REC>";
        let no_uid = "<REC><static_data/></REC>";
        let input = format!(
            "<records>\n{}\n{}\n{}\n{}\n</records>\n",
            missing_pub_info,
            malformed,
            no_uid,
            SCENARIO.replace("<?xml version=\"1.0\" encoding=\"UTF-8\"?>", "")
        );

        let (stats, tables, skipped) = melt_all(&input);

        assert_eq!(stats.records, 4);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.skipped, 3);
        assert_eq!(
            skipped,
            vec![Some("WOS:2".to_string()), Some("WOS:3".to_string()), None]
        );

        // Nothing from the skipped records, not even rows extracted before the failure
        assert_eq!(tables.len(TableFamily::Publication), 1);
        assert_eq!(tables.len(TableFamily::Contributor), 1);
        for (_, rows) in tables.iter() {
            assert!(rows.iter().all(|r| r["wos_id"] == "WOS:000123456789"));
        }
    }

    #[test]
    fn test_skipped_record_reports_parsed_identifier() {
        let prefixed = r#"<REC xmlns:wos="urn:wos"><wos:UID>WOS:7</wos:UID><static_data><summary>
            <titles><title type="item">T</title></titles>
        </summary></static_data></REC>"#;

        let (stats, _, skipped) = melt_all(prefixed);
        assert_eq!(stats.skipped, 1);
        assert_eq!(skipped, vec![Some("WOS:7".to_string())]);
    }

    #[test]
    fn test_output_is_idempotent() {
        let plan = MeltPlan::default();
        let config = MeltConfig::default();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();

        melt_to_dir(Cursor::new(SCENARIO), &plan, first.path(), &config, false, |_| {}).unwrap();
        melt_to_dir(Cursor::new(SCENARIO), &plan, second.path(), &config, false, |_| {}).unwrap();

        let files = read_dir(first.path());
        assert_eq!(files.len(), plan.clone().without_unindexed().tables.len());
        assert_eq!(files, read_dir(second.path()));
    }

    #[test]
    fn test_streaming_matches_accumulated_output() {
        let records: String = (0..5)
            .map(|i| SCENARIO.replace("WOS:000123456789", &format!("WOS:00000000000{}", i)))
            .map(|r| r.replace("<?xml version=\"1.0\" encoding=\"UTF-8\"?>", ""))
            .collect();
        let plan = MeltPlan::default();

        for format in [OutputFormat::Sql, OutputFormat::Json] {
            let config = MeltConfig {
                chunk_size: 2,
                include_unindexed: true,
                format,
                ..MeltConfig::default()
            };
            let batch = tempfile::tempdir().unwrap();
            let streamed = tempfile::tempdir().unwrap();

            let stats = melt_to_dir(Cursor::new(&records), &plan, batch.path(), &config, false, |_| {}).unwrap();
            assert_eq!(stats.committed, 5);
            melt_to_dir(Cursor::new(&records), &plan, streamed.path(), &config, true, |_| {}).unwrap();

            let files = read_dir(batch.path());
            assert_eq!(files.len(), plan.tables.len());
            assert_eq!(files, read_dir(streamed.path()));
        }
    }

    #[test]
    fn test_sql_output_contents() {
        let dir = tempfile::tempdir().unwrap();
        melt_to_dir(Cursor::new(SCENARIO), &MeltPlan::default(), dir.path(), &MeltConfig::default(), false, |_| {})
            .unwrap();

        let institutions = std::fs::read_to_string(dir.path().join("institutions.sql")).unwrap();
        assert!(institutions.starts_with("CREATE TABLE IF NOT EXISTS institutions ("));
        assert_eq!(institutions.lines().filter(|l| l.starts_with("(\"WOS:000123456789\"")).count(), 3);
        assert!(institutions.contains("\"University of A\", \"Dept B\""));

        let funding = std::fs::read_to_string(dir.path().join("funding.sql")).unwrap();
        assert!(!funding.contains("INSERT"));
    }
}
