//! Output table catalog
//!
//! A `MeltPlan` lists the tables to emit: for each one its name, the row
//! family it projects, its column order and the SQL preamble written at the
//! top of its file. The default plan is built in; a JSON file with the same
//! shape can replace it.
//!
//! The key maps at the bottom fix, at design time, which attribute- or
//! tag-named source keys become which output columns.

use crate::error::{MeltError, Result};
use crate::melt::types::TableFamily;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placeholder substituted with the table name in a preamble
pub const TABLE_PLACEHOLDER: &str = "{table}";

/// Column that collects unmapped keys
pub const OVERFLOW_COLUMN: &str = "overflow";

/// One output table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePlan {
    pub name: String,
    pub family: TableFamily,
    pub columns: Vec<String>,
    /// SQL written once before the inserts, `{table}` is replaced by `name`
    #[serde(default)]
    pub preamble: String,
}

impl TablePlan {
    pub fn new(name: &str, family: TableFamily, columns: &[&str], preamble: String) -> Self {
        TablePlan {
            name: name.to_string(),
            family,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            preamble,
        }
    }

    pub fn render_preamble(&self) -> String {
        self.preamble.replace(TABLE_PLACEHOLDER, &self.name)
    }

    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.name, extension)
    }
}

/// The complete set of output tables, in dump order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltPlan {
    pub tables: Vec<TablePlan>,
}

impl MeltPlan {
    /// Load a catalog from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let plan: MeltPlan = serde_json::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Table names must be unique and every table needs `wos_id` and at
    /// least one column
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(MeltError::Catalog(format!("duplicate table '{}'", table.name)));
            }
            if !table.columns.iter().any(|c| c == "wos_id") {
                return Err(MeltError::Catalog(format!(
                    "table '{}' has no wos_id column",
                    table.name
                )));
            }
        }
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Option<&TablePlan> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables fed by `family`
    pub fn tables_for(&self, family: TableFamily) -> impl Iterator<Item = &TablePlan> {
        self.tables.iter().filter(move |t| t.family == family)
    }

    /// Drop tables for families the configuration never produces
    pub fn without_unindexed(mut self) -> Self {
        self.tables.retain(|t| {
            !matches!(
                t.family,
                TableFamily::UnindexedPublication | TableFamily::UnindexedContributor
            )
        });
        self
    }
}

/// A column and its SQL type
type ColumnDef = (&'static str, &'static str);

const ID: ColumnDef = ("wos_id", "VARCHAR(64) NOT NULL");
const SHORT: &str = "VARCHAR(255)";
const TEXT: &str = "TEXT";

fn columns(defs: &[ColumnDef]) -> Vec<&'static str> {
    defs.iter().map(|(name, _)| *name).collect()
}

/// `CREATE TABLE IF NOT EXISTS` template keyed on the table's natural key
fn create_table(defs: &[ColumnDef], key: &str) -> String {
    let body: Vec<String> = defs
        .iter()
        .map(|(name, sql_type)| format!("  {} {}", name, sql_type))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{},\n  {}\n) DEFAULT CHARSET=utf8mb4;",
        TABLE_PLACEHOLDER,
        body.join(",\n"),
        key
    )
}

fn table(name: &str, family: TableFamily, defs: &[ColumnDef], key: &str) -> TablePlan {
    TablePlan::new(name, family, &columns(defs), create_table(defs, key))
}

impl Default for MeltPlan {
    fn default() -> Self {
        use TableFamily::*;

        let source: &[ColumnDef] = &[
            ID,
            ("source", TEXT),
            ("source_abbrev", SHORT),
            ("abbrev_iso", SHORT),
            ("abbrev_11", SHORT),
            ("abbrev_29", SHORT),
            ("issn", "VARCHAR(32)"),
            ("eissn", "VARCHAR(32)"),
            ("isbn", "VARCHAR(32)"),
            ("pubyear", "VARCHAR(8)"),
            ("vol", "VARCHAR(64)"),
            ("issue", "VARCHAR(64)"),
        ];

        let publications: &[ColumnDef] = &[
            ID,
            ("title", TEXT),
            ("doc_type", SHORT),
            ("pubtype", SHORT),
            ("pubyear", "VARCHAR(8)"),
            ("pubmonth", "VARCHAR(32)"),
            ("coverdate", "VARCHAR(64)"),
            ("sortdate", "VARCHAR(32)"),
            ("vol", "VARCHAR(64)"),
            ("issue", "VARCHAR(64)"),
            ("part_no", "VARCHAR(64)"),
            ("supplement", "VARCHAR(64)"),
            ("special_issue", "VARCHAR(64)"),
            ("page_begin", "VARCHAR(64)"),
            ("page_end", "VARCHAR(64)"),
            ("page_count", "VARCHAR(16)"),
            ("has_abstract", "VARCHAR(8)"),
            ("early_access_date", "VARCHAR(32)"),
            ("early_access_month", "VARCHAR(32)"),
            ("early_access_year", "VARCHAR(8)"),
            ("journal_oas_gold", "VARCHAR(8)"),
            ("source", TEXT),
            ("source_abbrev", SHORT),
            ("abbrev_iso", SHORT),
            ("abbrev_11", SHORT),
            ("abbrev_29", SHORT),
            ("series", TEXT),
            ("book_series", TEXT),
            ("book_subtitle", TEXT),
            ("book_seriessub", TEXT),
            ("accession_no", "VARCHAR(64)"),
            ("issn", "VARCHAR(32)"),
            ("eissn", "VARCHAR(32)"),
            ("isbn", "VARCHAR(32)"),
            ("eisbn", "VARCHAR(32)"),
            ("doi", SHORT),
            ("xref_doi", SHORT),
            ("art_no", "VARCHAR(64)"),
            ("meeting_abs", "VARCHAR(64)"),
            ("pmid", "VARCHAR(32)"),
            ("parent_book_doi", SHORT),
            ("oases_type_gold", "VARCHAR(8)"),
            ("abstract", "MEDIUMTEXT"),
            (OVERFLOW_COLUMN, TEXT),
        ];

        let contributors: &[ColumnDef] = &[
            ID,
            ("position", "VARCHAR(16)"),
            ("role", "VARCHAR(32)"),
            ("cluster_id", "VARCHAR(64)"),
            ("reprint", "VARCHAR(8)"),
            ("display_name", SHORT),
            ("full_name", SHORT),
            ("wos_standard", SHORT),
            ("first_name", SHORT),
            ("last_name", SHORT),
            ("suffix", "VARCHAR(32)"),
            ("email_addr", SHORT),
            (OVERFLOW_COLUMN, TEXT),
        ];

        let institutions: &[ColumnDef] = &[
            ID,
            ("addr_num", "VARCHAR(16)"),
            ("organization", SHORT),
            ("suborganization", SHORT),
            ("full_address", TEXT),
            ("city", SHORT),
            ("state", SHORT),
            ("country", SHORT),
            ("zip", "VARCHAR(64)"),
        ];

        let references: &[ColumnDef] = &[
            ID,
            ("cited_id", "VARCHAR(64)"),
            ("cited_author", SHORT),
            ("year", "VARCHAR(8)"),
            ("page", "VARCHAR(64)"),
            ("volume", "VARCHAR(64)"),
            ("cited_title", TEXT),
            ("cited_work", TEXT),
            ("doi", SHORT),
        ];

        let conferences: &[ColumnDef] = &[
            ID,
            ("conf_id", "VARCHAR(32)"),
            ("info", TEXT),
            ("title", TEXT),
            ("dates", SHORT),
            ("conf_start", "VARCHAR(16)"),
            ("conf_end", "VARCHAR(16)"),
            ("conf_city", SHORT),
            ("conf_state", SHORT),
            ("conf_host", TEXT),
            (OVERFLOW_COLUMN, TEXT),
        ];

        let unindexed_publications: &[ColumnDef] = &[
            ID,
            ("uid", "VARCHAR(128)"),
            ("doi", SHORT),
            ("author", SHORT),
            ("title", TEXT),
            ("source", TEXT),
            ("pubyear", "VARCHAR(8)"),
            ("volume", "VARCHAR(64)"),
            ("page", "VARCHAR(64)"),
        ];

        MeltPlan {
            tables: vec![
                table("source", Publication, source, "PRIMARY KEY (wos_id)"),
                table("publications", Publication, publications, "PRIMARY KEY (wos_id)"),
                table(
                    "languages",
                    Language,
                    &[ID, ("language", "VARCHAR(64)")],
                    "UNIQUE KEY (wos_id, language)",
                ),
                table(
                    "headings",
                    Heading,
                    &[ID, ("heading", SHORT)],
                    "UNIQUE KEY (wos_id, heading)",
                ),
                table(
                    "subheadings",
                    Subheading,
                    &[ID, ("subheading", SHORT)],
                    "UNIQUE KEY (wos_id, subheading)",
                ),
                table(
                    "subjects",
                    Subject,
                    &[ID, ("ascatype", "VARCHAR(32)"), ("subject", SHORT)],
                    "UNIQUE KEY (wos_id, ascatype, subject)",
                ),
                table(
                    "publishers",
                    Publisher,
                    &[
                        ID,
                        ("display_name", SHORT),
                        ("full_name", SHORT),
                        ("full_address", TEXT),
                        ("city", SHORT),
                    ],
                    "PRIMARY KEY (wos_id)",
                ),
                table("contributors", Contributor, contributors, "PRIMARY KEY (wos_id, position)"),
                table(
                    "institutions",
                    Institution,
                    institutions,
                    "UNIQUE KEY (wos_id, addr_num, organization(191), suborganization(191))",
                ),
                table(
                    "affiliations",
                    Affiliation,
                    &[ID, ("position", "VARCHAR(16)"), ("addr_num", "VARCHAR(16)")],
                    "UNIQUE KEY (wos_id, position, addr_num)",
                ),
                table(
                    "editions",
                    Edition,
                    &[ID, ("edition", "VARCHAR(32)")],
                    "UNIQUE KEY (wos_id, edition)",
                ),
                table("refs", Reference, references, "UNIQUE KEY (wos_id, cited_id)"),
                table(
                    "fundingtext",
                    FundingText,
                    &[ID, ("funding_text", "MEDIUMTEXT")],
                    "PRIMARY KEY (wos_id)",
                ),
                table(
                    "funding",
                    Funding,
                    &[ID, ("agency", SHORT), ("grant_id", SHORT)],
                    "UNIQUE KEY (wos_id, agency(191), grant_id(191))",
                ),
                table(
                    "keywords",
                    Keyword,
                    &[ID, ("keyword", SHORT)],
                    "UNIQUE KEY (wos_id, keyword(191))",
                ),
                table(
                    "keywords_plus",
                    KeywordPlus,
                    &[ID, ("keyword", SHORT)],
                    "UNIQUE KEY (wos_id, keyword(191))",
                ),
                table("conferences", Conference, conferences, "UNIQUE KEY (wos_id, conf_id)"),
                table(
                    "conf_sponsors",
                    ConferenceSponsor,
                    &[ID, ("conf_id", "VARCHAR(32)"), ("sponsor", SHORT)],
                    "UNIQUE KEY (wos_id, conf_id, sponsor(191))",
                ),
                table(
                    "unindexed_publications",
                    UnindexedPublication,
                    unindexed_publications,
                    "UNIQUE KEY (wos_id, uid)",
                ),
                table(
                    "unindexed_contributors",
                    UnindexedContributor,
                    &[
                        ID,
                        ("uid", "VARCHAR(128)"),
                        ("role", "VARCHAR(32)"),
                        ("display_name", SHORT),
                        ("full_name", SHORT),
                    ],
                    "UNIQUE KEY (wos_id, uid)",
                ),
            ],
        }
    }
}

/// Fixed mapping from source keys of one kind to output columns
#[derive(Debug)]
pub struct KeyMap {
    /// Used in log lines and errors, e.g. "title type"
    pub kind: &'static str,
    entries: &'static [(&'static str, &'static str)],
}

impl KeyMap {
    pub fn column(&self, key: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(source, _)| *source == key)
            .map(|(_, column)| *column)
    }
}

pub static TITLE_TYPES: KeyMap = KeyMap {
    kind: "title type",
    entries: &[
        ("item", "title"),
        ("source", "source"),
        ("source_abbrev", "source_abbrev"),
        ("abbrev_iso", "abbrev_iso"),
        ("abbrev_11", "abbrev_11"),
        ("abbrev_29", "abbrev_29"),
        ("series", "series"),
        ("book_series", "book_series"),
        ("book_subtitle", "book_subtitle"),
        ("book_seriessub", "book_seriessub"),
    ],
};

pub static PUB_INFO_ATTRS: KeyMap = KeyMap {
    kind: "pub_info attribute",
    entries: &[
        ("pubtype", "pubtype"),
        ("pubyear", "pubyear"),
        ("pubmonth", "pubmonth"),
        ("coverdate", "coverdate"),
        ("sortdate", "sortdate"),
        ("vol", "vol"),
        ("issue", "issue"),
        ("part_no", "part_no"),
        ("supplement", "supplement"),
        ("special_issue", "special_issue"),
        ("has_abstract", "has_abstract"),
        ("early_access_date", "early_access_date"),
        ("early_access_month", "early_access_month"),
        ("early_access_year", "early_access_year"),
        ("journal_oas_gold", "journal_oas_gold"),
    ],
};

pub static PAGE_ATTRS: KeyMap = KeyMap {
    kind: "page attribute",
    entries: &[
        ("begin", "page_begin"),
        ("end", "page_end"),
        ("page_count", "page_count"),
    ],
};

pub static IDENTIFIER_TYPES: KeyMap = KeyMap {
    kind: "identifier type",
    entries: &[
        ("accession_no", "accession_no"),
        ("issn", "issn"),
        ("eissn", "eissn"),
        ("isbn", "isbn"),
        ("eisbn", "eisbn"),
        ("doi", "doi"),
        ("xref_doi", "xref_doi"),
        ("art_no", "art_no"),
        ("meeting_abs", "meeting_abs"),
        ("pmid", "pmid"),
        ("parent_book_doi", "parent_book_doi"),
    ],
};

pub static CONTRIBUTOR_FIELDS: KeyMap = KeyMap {
    kind: "contributor field",
    entries: &[
        ("display_name", "display_name"),
        ("full_name", "full_name"),
        ("wos_standard", "wos_standard"),
        ("first_name", "first_name"),
        ("last_name", "last_name"),
        ("suffix", "suffix"),
        ("email_addr", "email_addr"),
    ],
};

pub static CONF_DATE_ATTRS: KeyMap = KeyMap {
    kind: "conference date attribute",
    entries: &[("conf_start", "conf_start"), ("conf_end", "conf_end")],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_valid() {
        let plan = MeltPlan::default();
        plan.validate().unwrap();
        assert_eq!(plan.tables_for(TableFamily::Publication).count(), 2);
        assert_eq!(plan.get_table("refs").unwrap().family, TableFamily::Reference);
    }

    #[test]
    fn test_mapped_columns_exist_in_publications() {
        let plan = MeltPlan::default();
        let publications = plan.get_table("publications").unwrap();
        for map in [&TITLE_TYPES, &PUB_INFO_ATTRS, &PAGE_ATTRS, &IDENTIFIER_TYPES] {
            for (_, column) in map.entries {
                assert!(
                    publications.columns.iter().any(|c| c == column),
                    "{} missing from publications",
                    column
                );
            }
        }
    }

    #[test]
    fn test_preamble_substitutes_table_name() {
        let plan = MeltPlan::default();
        let editions = plan.get_table("editions").unwrap();
        let sql = editions.render_preamble();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS editions ("));
        assert!(sql.contains("  edition VARCHAR(32)"));
        assert!(!sql.contains(TABLE_PLACEHOLDER));
    }

    #[test]
    fn test_catalog_from_json() {
        let plan = MeltPlan::from_json(
            r#"{"tables": [
                {"name": "kw", "family": "keyword_plus", "columns": ["wos_id", "keyword"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.tables[0].family, TableFamily::KeywordPlus);
        assert_eq!(plan.tables[0].preamble, "");
    }

    #[test]
    fn test_catalog_rejects_duplicates_and_missing_key() {
        let dup = r#"{"tables": [
            {"name": "kw", "family": "keyword", "columns": ["wos_id"]},
            {"name": "kw", "family": "keyword", "columns": ["wos_id"]}
        ]}"#;
        assert!(matches!(MeltPlan::from_json(dup), Err(MeltError::Catalog(_))));

        let no_key = r#"{"tables": [{"name": "kw", "family": "keyword", "columns": ["keyword"]}]}"#;
        assert!(matches!(MeltPlan::from_json(no_key), Err(MeltError::Catalog(_))));
    }

    #[test]
    fn test_key_map_lookup() {
        assert_eq!(TITLE_TYPES.column("item"), Some("title"));
        assert_eq!(PAGE_ATTRS.column("end"), Some("page_end"));
        assert_eq!(IDENTIFIER_TYPES.column("unknown"), None);
    }
}
