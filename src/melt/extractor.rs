use crate::error::{MeltError, Result};
use crate::melt::plan::{
    KeyMap, CONF_DATE_ATTRS, CONTRIBUTOR_FIELDS, IDENTIFIER_TYPES, OVERFLOW_COLUMN, PAGE_ATTRS,
    PUB_INFO_ATTRS, TITLE_TYPES,
};
use crate::melt::record::{parse_record, Element, ParsedRecord};
use crate::melt::types::{keyed_row, MeltConfig, Row, TableFamily, TableSet, UnknownKeyPolicy};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

const SUMMARY: &str = "static_data/summary";
const FULL_RECORD: &str = "static_data/fullrecord_metadata";

const PUBLISHER_FIELDS: [&str; 4] = ["display_name", "full_name", "full_address", "city"];
const ADDRESS_FIELDS: [&str; 5] = ["full_address", "city", "state", "country", "zip"];

/// Output column -> child tag of a `reference`
const REFERENCE_FIELDS: [(&str, &str); 7] = [
    ("cited_author", "citedAuthor"),
    ("year", "year"),
    ("page", "page"),
    ("volume", "volume"),
    ("cited_title", "citedTitle"),
    ("cited_work", "citedWork"),
    ("doi", "doi"),
];

/// Output column -> child tag of an unindexed `reference`
const UNINDEXED_FIELDS: [(&str, &str); 7] = [
    ("doi", "doi"),
    ("author", "citedAuthor"),
    ("title", "citedTitle"),
    ("source", "citedWork"),
    ("pubyear", "year"),
    ("volume", "volume"),
    ("page", "page"),
];

/// Category rows produced alongside a publication
#[derive(Debug, Default)]
pub struct Categories {
    pub languages: Vec<Row>,
    pub headings: Vec<Row>,
    pub subheadings: Vec<Row>,
    pub subjects: Vec<Row>,
}

/// Builds a row whose attribute-named keys go through a `KeyMap`
struct RowBuilder<'a> {
    wos_id: &'a str,
    policy: UnknownKeyPolicy,
    row: Row,
    overflow: Map<String, Value>,
}

impl<'a> RowBuilder<'a> {
    fn new(wos_id: &'a str, policy: UnknownKeyPolicy) -> Self {
        RowBuilder {
            wos_id,
            policy,
            row: keyed_row(wos_id),
            overflow: Map::new(),
        }
    }

    fn set(&mut self, column: &str, value: Value) {
        self.row.insert(column.to_string(), value);
    }

    fn map_key(&mut self, map: &KeyMap, key: &str, value: &str) -> Result<()> {
        if let Some(column) = map.column(key) {
            self.set(column, Value::String(value.to_string()));
            return Ok(());
        }

        match self.policy {
            UnknownKeyPolicy::Overflow => {
                self.overflow
                    .insert(key.to_string(), Value::String(value.to_string()));
                Ok(())
            }
            UnknownKeyPolicy::Drop => {
                debug!(wos_id = self.wos_id, kind = map.kind, key, "dropping unmapped key");
                Ok(())
            }
            UnknownKeyPolicy::Error => Err(MeltError::UnknownKey {
                wos_id: self.wos_id.to_string(),
                kind: map.kind,
                key: key.to_string(),
            }),
        }
    }

    fn finish(mut self) -> Result<Row> {
        if !self.overflow.is_empty() {
            let packed = serde_json::to_string(&self.overflow)?;
            self.row
                .insert(OVERFLOW_COLUMN.to_string(), Value::String(packed));
        }
        Ok(self.row)
    }
}

/// Melts one bibliographic record into rows for every table family.
///
/// Extractors only read the record tree. `melt_record` stages all of a
/// record's rows in a fresh `TableSet` and returns it only if every
/// extractor succeeded, so a failing record contributes nothing.
pub struct WosMelter {
    config: MeltConfig,
}

impl WosMelter {
    pub fn new(config: MeltConfig) -> Self {
        WosMelter { config }
    }

    pub fn config(&self) -> &MeltConfig {
        &self.config
    }

    /// Parse and melt the raw text of one record
    pub fn melt(&self, text: &str) -> Result<(String, TableSet)> {
        let record = parse_record(text)?;
        let rows = self.melt_record(&record)?;
        Ok((record.wos_id, rows))
    }

    pub fn melt_record(&self, record: &ParsedRecord) -> Result<TableSet> {
        use TableFamily::*;

        let wos_id = record.wos_id.as_str();
        let rec = &record.root;
        let mut rows = TableSet::new();

        rows.extend(Publication, self.extract_publication(wos_id, rec)?);

        let categories = self.extract_categories(wos_id, rec);
        rows.extend(Language, categories.languages);
        rows.extend(Heading, categories.headings);
        rows.extend(Subheading, categories.subheadings);
        rows.extend(Subject, categories.subjects);

        rows.push(Publisher, self.extract_publisher(wos_id, rec));
        rows.extend(Contributor, self.extract_contributors(wos_id, rec)?);

        let (institutions, affiliations) = self.extract_addresses(wos_id, rec)?;
        rows.extend(Institution, institutions);
        rows.extend(Affiliation, affiliations);

        rows.extend(Edition, self.extract_editions(wos_id, rec));
        rows.extend(Reference, self.extract_references(wos_id, rec));

        let (funding_text, funding) = self.extract_funding(wos_id, rec);
        rows.extend(FundingText, funding_text);
        rows.extend(Funding, funding);

        let (conferences, sponsors) = self.extract_conferences(wos_id, rec)?;
        rows.extend(Conference, conferences);
        rows.extend(ConferenceSponsor, sponsors);

        let (keywords, keywords_plus) = self.extract_keywords(wos_id, rec);
        rows.extend(Keyword, keywords);
        rows.extend(KeywordPlus, keywords_plus);

        if self.config.include_unindexed {
            let (publications, contributors) = self.extract_unindexed(wos_id, rec);
            rows.extend(UnindexedPublication, publications);
            rows.extend(UnindexedContributor, contributors);
        }

        debug!(wos_id, rows = rows.total_rows(), "melted record");
        Ok(rows)
    }

    /// The publication row: pub_info and page attributes, titles by type,
    /// doctype, identifiers, gold open access flag and abstract.
    ///
    /// `pub_info`, its `page` and the `item` title are required.
    pub fn extract_publication(&self, wos_id: &str, rec: &Element) -> Result<Vec<Row>> {
        let pub_info = rec
            .first(&format!("{}/pub_info", SUMMARY))
            .ok_or_else(|| {
                debug!(wos_id, "could not capture pub_info");
                MeltError::missing(wos_id, "pub_info")
            })?;
        let page = pub_info
            .first("page")
            .ok_or_else(|| MeltError::missing(wos_id, "pub_info/page"))?;

        let mut row = RowBuilder::new(wos_id, self.config.unknown_keys);
        for (key, value) in &pub_info.attrs {
            row.map_key(&PUB_INFO_ATTRS, key, value)?;
        }
        for (key, value) in &page.attrs {
            row.map_key(&PAGE_ATTRS, key, value)?;
        }

        let mut has_item_title = false;
        for title in rec.select(&format!("{}/titles/title", SUMMARY)) {
            let Some(kind) = title.attr("type") else {
                debug!(wos_id, "title without a type attribute");
                continue;
            };
            has_item_title |= kind == "item";
            row.map_key(&TITLE_TYPES, kind, title.text())?;
        }
        if !has_item_title {
            return Err(MeltError::missing(wos_id, "title[@type='item']"));
        }

        let doc_type = rec.first_text(&format!("{}/doctypes/doctype", SUMMARY));
        if doc_type.is_none() {
            warn!(wos_id, "could not capture doctype, setting to {}", self.config.sentinel);
        }
        row.set("doc_type", self.config.or_null(doc_type));

        for identifier in rec.select("dynamic_data/cluster_related/identifiers/identifier") {
            if let (Some(kind), Some(value)) = (identifier.attr("type"), identifier.attr("value")) {
                row.map_key(&IDENTIFIER_TYPES, kind, value)?;
            }
        }

        let gold = rec
            .select("dynamic_data/ic_related/oases/oas")
            .iter()
            .any(|oas| oas.text() == "Yes" && oas.attr("type") == Some("gold"));
        row.set(
            "oases_type_gold",
            if gold {
                Value::String("Yes".to_string())
            } else {
                self.config.null()
            },
        );

        let paragraphs = rec.select(&format!(
            "{}/abstracts/abstract/abstract_text/p",
            FULL_RECORD
        ));
        let abstract_text = if paragraphs.is_empty() {
            self.config.null()
        } else {
            Value::String(
                paragraphs
                    .iter()
                    .map(|p| format!("\n<p>{}</p>", p.text()))
                    .collect(),
            )
        };
        row.set("abstract", abstract_text);

        Ok(vec![row.finish()?])
    }

    /// Languages, headings, subheadings and subjects
    pub fn extract_categories(&self, wos_id: &str, rec: &Element) -> Categories {
        let category_info = format!("{}/category_info", FULL_RECORD);

        let subjects = rec
            .select(&format!("{}/subjects/subject", category_info))
            .into_iter()
            .map(|subject| {
                let mut row = keyed_row(wos_id);
                row.insert("ascatype".to_string(), self.config.or_null(subject.attr("ascatype")));
                row.insert("subject".to_string(), Value::String(subject.text.clone()));
                row
            })
            .collect();

        Categories {
            languages: self.text_rows(
                wos_id,
                rec,
                &format!("{}/languages/language", FULL_RECORD),
                "language",
            ),
            headings: self.text_rows(
                wos_id,
                rec,
                &format!("{}/headings/heading", category_info),
                "heading",
            ),
            subheadings: self.text_rows(
                wos_id,
                rec,
                &format!("{}/subheadings/subheading", category_info),
                "subheading",
            ),
            subjects,
        }
    }

    /// Exactly one row, all-sentinel when the record names no publisher
    pub fn extract_publisher(&self, wos_id: &str, rec: &Element) -> Row {
        let mut row = keyed_row(wos_id);
        for field in PUBLISHER_FIELDS {
            row.insert(field.to_string(), self.config.null());
        }

        for publishers in rec.select(&format!("{}/publishers", SUMMARY)) {
            for item in publishers.descendants() {
                if PUBLISHER_FIELDS.contains(&item.tag.as_str()) {
                    row.insert(item.tag.clone(), Value::String(item.text.clone()));
                }
            }
        }
        row
    }

    /// One row per `name` in the summary block. Leaf elements under a name
    /// become sub-fields; the first occurrence of a tag wins.
    pub fn extract_contributors(&self, wos_id: &str, rec: &Element) -> Result<Vec<Row>> {
        let mut contributors = Vec::new();

        for name in rec.select(&format!("{}/names/name", SUMMARY)) {
            let mut row = RowBuilder::new(wos_id, self.config.unknown_keys);
            row.set("position", self.config.or_null(name.attr("seq_no")));
            row.set("reprint", self.config.or_null(name.attr("reprint")));
            row.set("cluster_id", self.config.or_null(name.attr("dais_id")));
            row.set("role", self.config.or_null(name.attr("role")));

            let mut seen = HashSet::new();
            for item in name.descendants().skip(1).filter(|e| e.is_leaf()) {
                if seen.insert(item.tag.as_str()) {
                    row.map_key(&CONTRIBUTOR_FIELDS, &item.tag, item.text())?;
                }
            }
            contributors.push(row.finish()?);
        }

        Ok(contributors)
    }

    /// Institutions and affiliations from the address blocks.
    ///
    /// Each block yields the cross product of its organizations and
    /// suborganizations (each defaulting to a single sentinel), every row
    /// sharing the block's address fields. Every `names/name` in the block
    /// yields an affiliation linking its `seq_no` to the address number.
    pub fn extract_addresses(&self, wos_id: &str, rec: &Element) -> Result<(Vec<Row>, Vec<Row>)> {
        let mut institutions = Vec::new();
        let mut affiliations = Vec::new();

        for block in rec.select(&format!("{}/addresses/address_name", FULL_RECORD)) {
            let addr_num = block
                .first("address_spec")
                .and_then(|spec| spec.attr("addr_no"))
                .ok_or_else(|| MeltError::missing(wos_id, "address_spec/@addr_no"))?;

            let mut base = keyed_row(wos_id);
            base.insert("addr_num".to_string(), Value::String(addr_num.to_string()));
            for field in ADDRESS_FIELDS {
                base.insert(field.to_string(), self.config.null());
            }
            for item in block.descendants() {
                if ADDRESS_FIELDS.contains(&item.tag.as_str()) {
                    base.insert(item.tag.clone(), Value::String(item.text.clone()));
                }
            }

            let organizations = self.texts_or_null(block.descendant_texts("organization"));
            let suborganizations = self.texts_or_null(block.descendant_texts("suborganization"));

            for organization in &organizations {
                for suborganization in &suborganizations {
                    let mut row = base.clone();
                    row.insert("organization".to_string(), organization.clone());
                    row.insert("suborganization".to_string(), suborganization.clone());
                    institutions.push(row);
                }
            }

            for name in block.select("names/name") {
                let mut row = keyed_row(wos_id);
                row.insert("position".to_string(), self.config.or_null(name.attr("seq_no")));
                row.insert(
                    "addr_num".to_string(),
                    Value::String(name.attr("addr_no").unwrap_or(addr_num).to_string()),
                );
                affiliations.push(row);
            }
        }

        Ok((institutions, affiliations))
    }

    pub fn extract_editions(&self, wos_id: &str, rec: &Element) -> Vec<Row> {
        rec.select(&format!("{}/EWUID/edition", SUMMARY))
            .into_iter()
            .map(|edition| {
                let mut row = keyed_row(wos_id);
                row.insert("edition".to_string(), self.config.or_null(edition.attr("value")));
                row
            })
            .collect()
    }

    /// References with a cited-record id; the rest are dropped
    pub fn extract_references(&self, wos_id: &str, rec: &Element) -> Vec<Row> {
        self.cited_references(rec)
            .map(|(cited_id, reference)| {
                let mut row = keyed_row(wos_id);
                row.insert("cited_id".to_string(), Value::String(cited_id.to_string()));
                for (column, tag) in REFERENCE_FIELDS {
                    row.insert(column.to_string(), self.config.or_null(reference.first_text(tag)));
                }
                row
            })
            .collect()
    }

    /// Cited works outside the index (cited id not starting with `WOS`):
    /// one publication row each, plus a contributor row for the cited author
    pub fn extract_unindexed(&self, wos_id: &str, rec: &Element) -> (Vec<Row>, Vec<Row>) {
        let mut publications = Vec::new();
        let mut contributors = Vec::new();

        for (uid, reference) in self.cited_references(rec) {
            if uid.starts_with("WOS") {
                continue;
            }

            let mut row = keyed_row(wos_id);
            row.insert("uid".to_string(), Value::String(uid.to_string()));
            for (column, tag) in UNINDEXED_FIELDS {
                row.insert(column.to_string(), self.config.or_null(reference.first_text(tag)));
            }
            publications.push(row);

            if let Some(author) = reference.first_text("citedAuthor") {
                let mut row = keyed_row(wos_id);
                row.insert("uid".to_string(), Value::String(uid.to_string()));
                row.insert("role".to_string(), Value::String("author".to_string()));
                row.insert("display_name".to_string(), Value::String(author.to_string()));
                row.insert("full_name".to_string(), Value::String(author.to_string()));
                contributors.push(row);
            }
        }

        (publications, contributors)
    }

    /// At most one funding-text row (all paragraphs, newline-joined) and
    /// one funding row per grant id, or one sentinel row for a grant with
    /// no ids
    pub fn extract_funding(&self, wos_id: &str, rec: &Element) -> (Vec<Row>, Vec<Row>) {
        let fund_ack = format!("{}/fund_ack", FULL_RECORD);

        let mut paragraphs: Vec<&str> = Vec::new();
        for fund_text in rec.select(&format!("{}/fund_text", fund_ack)) {
            let before = paragraphs.len();
            paragraphs.extend(fund_text.descendant_texts("p"));
            if paragraphs.len() == before && !fund_text.text().trim().is_empty() {
                paragraphs.push(fund_text.text().trim());
            }
        }

        let mut funding_text = Vec::new();
        if !paragraphs.is_empty() {
            let mut row = keyed_row(wos_id);
            row.insert("funding_text".to_string(), Value::String(paragraphs.join("\n")));
            funding_text.push(row);
        }

        let mut funding = Vec::new();
        for grant in rec.select(&format!("{}/grants/grant", fund_ack)) {
            let agency = self.config.or_null(grant.select("grant_agency").last().map(|a| a.text()));
            let ids = self.texts_or_null(grant.select("grant_ids/grant_id").into_iter().map(Element::text));

            for grant_id in ids {
                let mut row = keyed_row(wos_id);
                row.insert("agency".to_string(), agency.clone());
                row.insert("grant_id".to_string(), grant_id);
                funding.push(row);
            }
        }

        (funding_text, funding)
    }

    /// One row per conference, each sub-field independently optional, and
    /// one row per sponsor keyed by record and conference id
    pub fn extract_conferences(&self, wos_id: &str, rec: &Element) -> Result<(Vec<Row>, Vec<Row>)> {
        let mut conferences = Vec::new();
        let mut sponsors = Vec::new();

        for conf in rec.select(&format!("{}/conferences/conference", SUMMARY)) {
            let conf_id = self.config.or_null(conf.attr("conf_id"));

            let mut row = RowBuilder::new(wos_id, self.config.unknown_keys);
            row.set("conf_id", conf_id.clone());
            row.set("info", self.config.or_null(conf.first_text("conf_infos/conf_info")));
            row.set("title", self.config.or_null(conf.first_text("conf_titles/conf_title")));

            let date = conf.first("conf_dates/conf_date");
            row.set("dates", self.config.or_null(date.map(Element::text)));
            if let Some(date) = date {
                for (key, value) in &date.attrs {
                    row.map_key(&CONF_DATE_ATTRS, key, value)?;
                }
            }

            let location = "conf_locations/conf_location";
            row.set("conf_city", self.config.or_null(conf.first_text(&format!("{}/conf_city", location))));
            row.set("conf_state", self.config.or_null(conf.first_text(&format!("{}/conf_state", location))));
            row.set("conf_host", self.config.or_null(conf.first_text(&format!("{}/conf_host", location))));

            for sponsor in conf.select("sponsors/sponsor") {
                let mut sponsor_row = keyed_row(wos_id);
                sponsor_row.insert("conf_id".to_string(), conf_id.clone());
                sponsor_row.insert("sponsor".to_string(), Value::String(sponsor.text.clone()));
                sponsors.push(sponsor_row);
            }

            conferences.push(row.finish()?);
        }

        Ok((conferences, sponsors))
    }

    /// Author keywords and system-assigned "keywords plus", kept apart
    pub fn extract_keywords(&self, wos_id: &str, rec: &Element) -> (Vec<Row>, Vec<Row>) {
        (
            self.text_rows(wos_id, rec, &format!("{}/keywords/keyword", FULL_RECORD), "keyword"),
            self.text_rows(wos_id, rec, "static_data/item/keywords_plus/keyword", "keyword"),
        )
    }

    fn text_rows(&self, wos_id: &str, rec: &Element, path: &str, column: &str) -> Vec<Row> {
        rec.select(path)
            .into_iter()
            .map(|element| {
                let mut row = keyed_row(wos_id);
                row.insert(column.to_string(), Value::String(element.text.clone()));
                row
            })
            .collect()
    }

    fn texts_or_null<'a>(&self, texts: impl Iterator<Item = &'a str>) -> Vec<Value> {
        let values: Vec<Value> = texts.map(|t| Value::String(t.to_string())).collect();
        if values.is_empty() {
            vec![self.config.null()]
        } else {
            values
        }
    }

    fn cited_references<'a>(&self, rec: &'a Element) -> impl Iterator<Item = (&'a str, &'a Element)> {
        rec.select(&format!("{}/references/reference", FULL_RECORD))
            .into_iter()
            .filter_map(|reference| {
                let uid = reference.first_text("uid").map(str::trim).filter(|u| !u.is_empty())?;
                Some((uid, reference))
            })
    }
}
