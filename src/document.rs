//! # Document Parsing Module
//!
//! ## Purpose
//! Parses raw AniDB XML documents into the derived fields stored in the
//! searchable index. Parsing is a pure function of the raw bytes so the
//! index can always be rebuilt from the raw store alone, and so the logic
//! is testable without network access.
//!
//! ## Input/Output Specification
//! - **Input**: raw XML bytes as returned by the AniDB HTTP API
//! - **Output**: main title, weighted tags, relations, mature flag
//!
//! ## Key Features
//! - Tolerant extraction: missing sections yield empty collections
//! - Mature-content detection from the `restricted` attribute and from
//!   tag/category names
//! - No mutation of the raw document; filtering for presentation is the
//!   gateway's concern

use crate::errors::{MirrorError, Result};
use crate::{AnimeId, AnimeRecord, Relation, TagEntry};
use chrono::{DateTime, Utc};

/// Tag and category names that mark an entry as mature (18+) content
const MATURE_KEYWORDS: &[&str] = &["hentai", "pornography", "18 restricted", "adult"];

/// Derived fields extracted from one raw document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    /// Main title, when present
    pub title: Option<String>,
    /// Weighted tags
    pub tags: Vec<TagEntry>,
    /// Relations to other anime
    pub relations: Vec<Relation>,
    /// Whether the entry carries mature content markers
    pub mature: bool,
}

impl ParsedDocument {
    /// Build the index row for this document.
    pub fn into_record(
        self,
        aid: AnimeId,
        fetched_at: DateTime<Utc>,
        attempt_count: u32,
    ) -> AnimeRecord {
        AnimeRecord {
            aid,
            title: self.title,
            fetched_at,
            tags: self.tags,
            relations: self.relations,
            mature: self.mature,
            attempt_count,
        }
    }
}

/// Parse a raw AniDB anime document into its derived fields.
///
/// Fails on malformed XML and on in-band `<error>` documents; those must
/// never reach the store.
pub fn parse_document(aid: AnimeId, raw: &[u8]) -> Result<ParsedDocument> {
    let text = std::str::from_utf8(raw).map_err(|e| MirrorError::DocumentParse {
        aid,
        details: format!("Invalid UTF-8: {}", e),
    })?;

    let doc = roxmltree::Document::parse(text).map_err(|e| MirrorError::DocumentParse {
        aid,
        details: e.to_string(),
    })?;

    let root = doc.root_element();
    if root.has_tag_name("error") {
        return Err(MirrorError::DocumentParse {
            aid,
            details: format!(
                "Upstream error document: {}",
                root.text().unwrap_or("").trim()
            ),
        });
    }
    if !root.has_tag_name("anime") {
        return Err(MirrorError::DocumentParse {
            aid,
            details: format!("Unexpected root element <{}>", root.tag_name().name()),
        });
    }

    let title = extract_main_title(&doc);
    let tags = extract_tags(&doc);
    let relations = extract_relations(&doc);
    let mature = detect_mature(&doc, &tags);

    Ok(ParsedDocument {
        title,
        tags,
        relations,
        mature,
    })
}

/// Main title, falling back to the first title element found.
fn extract_main_title(doc: &roxmltree::Document) -> Option<String> {
    let mut first = None;
    for node in doc.descendants().filter(|n| n.has_tag_name("title")) {
        let text = match node.text() {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => continue,
        };
        if node.attribute("type") == Some("main") {
            return Some(text);
        }
        if first.is_none() {
            first = Some(text);
        }
    }
    first
}

/// Weighted tags; entries without a name are skipped.
fn extract_tags(doc: &roxmltree::Document) -> Vec<TagEntry> {
    doc.descendants()
        .filter(|n| n.has_tag_name("tag"))
        .filter_map(|tag| {
            let name = tag
                .children()
                .find(|c| c.has_tag_name("name"))
                .and_then(|n| n.text())
                .map(|t| t.trim().to_string())?;
            if name.is_empty() {
                return None;
            }
            let weight = tag
                .attribute("weight")
                .and_then(|w| w.parse().ok())
                .unwrap_or(0);
            Some(TagEntry { name, weight })
        })
        .collect()
}

/// Relations from the `relatedanime` block; entries missing an id or a type
/// are skipped.
fn extract_relations(doc: &roxmltree::Document) -> Vec<Relation> {
    doc.descendants()
        .filter(|n| n.has_tag_name("relatedanime"))
        .flat_map(|block| block.children().filter(|c| c.has_tag_name("anime")))
        .filter_map(|rel| {
            let related_aid: AnimeId = rel.attribute("id")?.parse().ok()?;
            let kind = rel.attribute("type")?.to_string();
            if related_aid == 0 || kind.is_empty() {
                return None;
            }
            Some(Relation { related_aid, kind })
        })
        .collect()
}

/// Mature detection: the document's `restricted` attribute, a tag named
/// "18 restricted", or a category name containing a mature keyword.
fn detect_mature(doc: &roxmltree::Document, tags: &[TagEntry]) -> bool {
    if doc.root_element().attribute("restricted") == Some("true") {
        return true;
    }

    if tags
        .iter()
        .any(|t| t.name.eq_ignore_ascii_case("18 restricted"))
    {
        return true;
    }

    doc.descendants()
        .filter(|n| n.has_tag_name("category"))
        .filter_map(|cat| {
            cat.children()
                .find(|c| c.has_tag_name("name"))
                .and_then(|n| n.text())
        })
        .any(|name| {
            let lowered = name.to_lowercase();
            MATURE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<anime id="1" restricted="false">
  <type>TV Series</type>
  <titles>
    <title xml:lang="x-jat" type="main">Seikai no Monshou</title>
    <title xml:lang="en" type="official">Crest of the Stars</title>
  </titles>
  <relatedanime>
    <anime id="4" type="Sequel">Seikai no Senki</anime>
    <anime id="6" type="Prequel">Seikai no Danshou</anime>
  </relatedanime>
  <tags>
    <tag id="2604" weight="600"><name>space opera</name></tag>
    <tag id="2607" weight="400"><name>military</name></tag>
    <tag id="2611" weight="0"><name>maintenance tags</name></tag>
  </tags>
</anime>"#;

    #[test]
    fn test_parse_full_document() {
        let parsed = parse_document(1, SAMPLE.as_bytes()).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Seikai no Monshou"));
        assert_eq!(parsed.tags.len(), 3);
        assert_eq!(parsed.tags[0].name, "space opera");
        assert_eq!(parsed.tags[0].weight, 600);
        assert_eq!(parsed.relations.len(), 2);
        assert_eq!(parsed.relations[0].related_aid, 4);
        assert_eq!(parsed.relations[0].kind, "Sequel");
        assert!(!parsed.mature);
    }

    #[test]
    fn test_falls_back_to_first_title() {
        let xml = r#"<anime id="2"><titles>
            <title xml:lang="en" type="official">Some Title</title>
        </titles></anime>"#;
        let parsed = parse_document(2, xml.as_bytes()).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Some Title"));
    }

    #[test]
    fn test_mature_from_restricted_attribute() {
        let xml = r#"<anime id="3" restricted="true"><titles>
            <title type="main">Restricted Show</title>
        </titles></anime>"#;
        let parsed = parse_document(3, xml.as_bytes()).unwrap();
        assert!(parsed.mature);
    }

    #[test]
    fn test_mature_from_tag_name() {
        let xml = r#"<anime id="4"><tags>
            <tag weight="600"><name>18 Restricted</name></tag>
        </tags></anime>"#;
        let parsed = parse_document(4, xml.as_bytes()).unwrap();
        assert!(parsed.mature);
    }

    #[test]
    fn test_mature_from_category_keyword() {
        let xml = r#"<anime id="5"><categories>
            <category><name>Hentai</name></category>
        </categories></anime>"#;
        let parsed = parse_document(5, xml.as_bytes()).unwrap();
        assert!(parsed.mature);
    }

    #[test]
    fn test_rejects_error_document() {
        let xml = r#"<error code="500">Anime not found</error>"#;
        assert!(parse_document(6, xml.as_bytes()).is_err());
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(parse_document(7, b"<anime><titles>").is_err());
        assert!(parse_document(8, &[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn test_skips_incomplete_relations_and_tags() {
        let xml = r#"<anime id="9">
          <relatedanime>
            <anime type="Sequel">missing id</anime>
            <anime id="10">missing type</anime>
          </relatedanime>
          <tags><tag weight="300"></tag></tags>
        </anime>"#;
        let parsed = parse_document(9, xml.as_bytes()).unwrap();
        assert!(parsed.relations.is_empty());
        assert!(parsed.tags.is_empty());
    }
}
