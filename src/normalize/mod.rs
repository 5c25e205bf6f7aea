//! `PartialRecord` → validated `Record`.
//!
//! Coercion never drops a record: unparseable counts and flags become `None`
//! with a `QualityFlag`. Only a bad natural key (or a key-forming field with
//! no fallback) rejects the record. Cross-record invariants live in
//! [`Validator`], owned by the stage's completion handler.

pub mod coerce;

use std::collections::HashSet;

use itertools::Itertools;
use tracing::debug;

use crate::error::RejectionReason;
use crate::extract::clean::{clean_lines, collapse_ws, resolve};
use crate::partial::{Field, PartialRecord, Slot, Value};
use crate::records::{
    Issue, Keyed, LinkPage, MetadataFields, ModelEntry, ModelLink, ModelRecord, QualityFlag,
    Record, VariationInfo,
};
use crate::sites::{kaggle, name_from_url, PageShape, Site};

pub fn normalize(partial: &PartialRecord) -> Result<Record, RejectionReason> {
    match partial.shape {
        PageShape::Listing => normalize_listing(partial).map(Record::Links),
        PageShape::Detail => normalize_model(partial).map(Record::Model),
        PageShape::Variation => normalize_variation(partial).map(Record::Variation),
    }
}

fn normalize_listing(p: &PartialRecord) -> Result<LinkPage, RejectionReason> {
    let anchors = match p.get(Field::DetailLinks) {
        Slot::Present(Value::Links(anchors)) => anchors,
        _ => {
            return Err(RejectionReason::MissingField {
                field: Field::DetailLinks,
            })
        }
    };
    let detail = p.site.rules(PageShape::Detail);

    let mut links = Vec::new();
    let mut rejected = Vec::new();
    for anchor in anchors {
        let url = match resolve(p.site.base_url(), &anchor.href)
            .ok_or_else(|| RejectionReason::MalformedSourceUrl {
                raw: anchor.href.clone(),
            })
            .and_then(|u| coerce::canonical_url(&u))
        {
            Ok(url) => url,
            Err(reason) => {
                rejected.push((anchor.href.clone(), reason));
                continue;
            }
        };
        if !detail.is_some_and(|rules| rules.matches_url(&url)) {
            debug!(%url, "not a model page link");
            continue;
        }
        let name = Some(collapse_ws(&anchor.text))
            .filter(|n| !n.is_empty())
            .or_else(|| name_from_url(&url))
            .unwrap_or_else(|| url.clone());
        links.push(ModelLink { name, url });
    }

    Ok(LinkPage {
        links: links.into_iter().unique_by(|l| l.url.clone()).collect(),
        has_next: !p.get(Field::NextPage).is_absent(),
        rejected,
    })
}

/// Accumulates quality flags while reading typed fields out of a partial.
struct Reader<'a> {
    partial: &'a PartialRecord,
    flags: Vec<QualityFlag>,
}

impl<'a> Reader<'a> {
    fn new(partial: &'a PartialRecord) -> Self {
        Reader {
            partial,
            flags: Vec::new(),
        }
    }

    fn flag(&mut self, field: Field, issue: Issue, raw: &str) {
        self.flags.push(QualityFlag {
            field,
            issue,
            raw: raw.to_string(),
        });
    }

    fn raw_text(&self, field: Field) -> Option<String> {
        match self.partial.get(field) {
            Slot::Present(Value::Text(t)) => Some(t.clone()),
            Slot::Present(Value::List(items)) => Some(items.join("\n")),
            _ => None,
        }
    }

    fn text(&self, field: Field) -> Option<String> {
        self.raw_text(field)
            .map(|t| collapse_ws(&t))
            .filter(|t| !t.is_empty())
    }

    fn long_text(&self, field: Field) -> Option<String> {
        self.raw_text(field)
            .map(|t| clean_lines(&t))
            .filter(|t| !t.is_empty())
    }

    fn count(&mut self, field: Field) -> Option<u64> {
        let raw = match self.partial.get(field) {
            Slot::Present(Value::Text(t)) => t.clone(),
            Slot::Malformed(raw) => raw.clone(),
            _ => return None,
        };
        let parsed = coerce::parse_count(&raw);
        if parsed.is_none() {
            self.flag(field, Issue::NotACount, &raw);
        }
        parsed
    }

    fn flag_value(&mut self, field: Field) -> Option<bool> {
        let raw = match self.partial.get(field) {
            Slot::Present(Value::Text(t)) => t.clone(),
            Slot::Malformed(raw) => raw.clone(),
            _ => return None,
        };
        let parsed = coerce::parse_flag(&raw);
        if parsed.is_none() {
            self.flag(field, Issue::UnrecognisedFlag, &raw);
        }
        parsed
    }

    fn list(&self, field: Field) -> Vec<String> {
        match self.partial.get(field) {
            Slot::Present(Value::Text(t)) => coerce::split_list(t),
            Slot::Present(Value::List(items)) => coerce::flatten_list(items),
            _ => Vec::new(),
        }
    }

    fn tags(&self) -> Vec<String> {
        match self.partial.get(Field::Tags) {
            Slot::Present(Value::Text(t)) => coerce::dedupe_tags(coerce::split_list(t)),
            Slot::Present(Value::List(items)) => coerce::dedupe_tags(items),
            _ => Vec::new(),
        }
    }

    fn example_usage(&self) -> Option<String> {
        self.long_text(Field::ExampleUsage)
            .filter(|t| !coerce::is_usage_placeholder(t))
    }
}

fn normalize_model(p: &PartialRecord) -> Result<ModelEntry, RejectionReason> {
    let source_url = coerce::canonical_url(&p.url)?;
    let mut r = Reader::new(p);

    let name = r
        .text(Field::Name)
        .or_else(|| name_from_url(&source_url))
        .ok_or(RejectionReason::MissingField { field: Field::Name })?;
    let downloads = r.count(Field::Downloads);

    let variation_urls = match (p.site, p.get(Field::VariationLinks)) {
        (Site::Kaggle, Slot::Present(Value::Links(anchors))) => anchors
            .iter()
            .filter_map(|a| resolve(kaggle::BASE_URL, &a.href))
            .filter_map(|u| coerce::canonical_url(&u).ok())
            .filter(|u| kaggle::parent_of(u).as_deref() == Some(source_url.as_str()))
            .unique()
            .collect(),
        _ => Vec::new(),
    };

    let model = ModelRecord {
        site: p.site,
        organization_or_name: name,
        scraped_at: p.fetched_at,
        downloads,
        usability: r.text(Field::Usability),
        short_description: r.text(Field::ShortDescription),
        model_card: r.long_text(Field::ModelCard),
        example_usage: r.example_usage(),
        quality_flags: Vec::new(),
        source_url,
    };
    let metadata = MetadataFields {
        collaborators: r.list(Field::Collaborators),
        authors: r.list(Field::Authors),
        provenance: r.long_text(Field::Provenance),
    };
    let tags = r.tags();

    Ok(ModelEntry {
        model: ModelRecord {
            quality_flags: r.flags,
            ..model
        },
        tags,
        metadata,
        variation_urls,
    })
}

fn normalize_variation(p: &PartialRecord) -> Result<VariationInfo, RejectionReason> {
    let source_url = coerce::canonical_url(&p.url)?;
    let model_url = match p.parent.clone().or_else(|| kaggle::parent_of(&source_url)) {
        Some(parent) => coerce::canonical_url(&parent).map_err(|_| {
            RejectionReason::OrphanVariation {
                key: source_url.clone(),
                parent: parent.clone(),
            }
        })?,
        None => {
            return Err(RejectionReason::OrphanVariation {
                key: source_url,
                parent: String::new(),
            })
        }
    };
    let mut r = Reader::new(p);

    let variation_name = r
        .text(Field::VariationName)
        .or_else(|| kaggle::variation_of(&source_url))
        .ok_or(RejectionReason::MissingField {
            field: Field::VariationName,
        })?;
    let downloads = r.count(Field::Downloads);
    let is_finetunable = r.flag_value(Field::IsFinetunable);

    Ok(VariationInfo {
        framework: kaggle::framework_of(&source_url),
        model_url,
        scraped_at: p.fetched_at,
        variation_name,
        variation_version: r.text(Field::VariationVersion),
        license: r.text(Field::License),
        downloads,
        model_card: r.long_text(Field::ModelCard),
        is_finetunable,
        example_usage: r.example_usage(),
        quality_flags: r.flags,
        source_url,
    })
}


/// Cross-record invariants of one stage: unique natural keys and, for
/// variations, a known parent model.
#[derive(Debug, Default)]
pub struct Validator {
    seen: HashSet<String>,
    parents: Option<HashSet<String>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parents(parents: impl IntoIterator<Item = String>) -> Self {
        Validator {
            seen: HashSet::new(),
            parents: Some(parents.into_iter().collect()),
        }
    }

    /// First sighting of a key; `false` for repeats.
    pub fn first_seen(&mut self, key: &str) -> bool {
        self.seen.insert(key.to_string())
    }

    pub fn admit<R: Keyed>(&mut self, record: &R) -> Result<(), RejectionReason> {
        if !self.first_seen(record.key()) {
            return Err(RejectionReason::DuplicateKey {
                key: record.key().to_string(),
            });
        }
        Ok(())
    }

    pub fn admit_variation(&mut self, v: &VariationInfo) -> Result<(), RejectionReason> {
        if let Some(parents) = &self.parents {
            if !parents.contains(&v.model_url) {
                return Err(RejectionReason::OrphanVariation {
                    key: v.source_url.clone(),
                    parent: v.model_url.clone(),
                });
            }
        }
        self.admit(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partial::Anchor;
    use chrono::Utc;

    const GEMMA: &str = "https://www.kaggle.com/models/google/gemma";
    const VARIANT: &str = "https://www.kaggle.com/models/google/gemma/transformers/2b/3";

    fn text(s: &str) -> Slot {
        Slot::Present(Value::Text(s.into()))
    }

    fn detail(url: &str) -> PartialRecord {
        PartialRecord::new(url, Site::Kaggle, PageShape::Detail, Utc::now())
    }

    fn model(record: Record) -> ModelEntry {
        match record {
            Record::Model(m) => m,
            other => panic!("expected a model, got {:?}", other),
        }
    }

    fn variation(record: Record) -> VariationInfo {
        match record {
            Record::Variation(v) => v,
            other => panic!("expected a variation, got {:?}", other),
        }
    }

    #[test]
    fn coerces_model_fields() {
        let p = detail(GEMMA)
            .with(Field::Name, text("  Gemma  "))
            .with(Field::Downloads, text("1.2K"))
            .with(
                Field::Tags,
                Slot::Present(Value::List(vec!["BERT".into(), "bert".into(), "Bert".into()])),
            )
            .with(Field::Authors, text("Alice, , Bob"))
            .with(
                Field::Collaborators,
                Slot::Present(Value::List(vec!["Google".into(), "  ".into()])),
            )
            .with(
                Field::ExampleUsage,
                text("This variation does not have a usage guide yet."),
            )
            .with(
                Field::VariationLinks,
                Slot::Present(Value::Links(vec![
                    Anchor { text: "2b".into(), href: "/models/google/gemma/transformers/2b/3".into() },
                    Anchor { text: "other".into(), href: "/models/meta/llama/pytorch/8b".into() },
                    Anchor { text: "dup".into(), href: VARIANT.into() },
                ])),
            );
        let m = model(normalize(&p).unwrap());
        assert_eq!(m.model.organization_or_name, "Gemma");
        assert_eq!(m.model.downloads, Some(1200));
        assert_eq!(m.tags, vec!["bert"]);
        assert_eq!(m.metadata.authors, vec!["Alice", "Bob"]);
        assert_eq!(m.metadata.collaborators, vec!["Google"]);
        assert_eq!(m.model.example_usage, None);
        assert_eq!(m.variation_urls, vec![VARIANT]);
        assert!(m.model.quality_flags.is_empty());
    }

    #[test]
    fn non_numeric_downloads_become_null_with_flag() {
        let p = detail(GEMMA).with(Field::Downloads, Slot::Malformed("lots".into()));
        let m = model(normalize(&p).unwrap());
        assert_eq!(m.model.downloads, None);
        assert_eq!(m.model.quality_flags[0].issue, Issue::NotACount);
        assert_eq!(m.model.quality_flags[0].raw, "lots");
        // name falls back to the URL
        assert_eq!(m.model.organization_or_name, "Gemma");
    }

    #[test]
    fn downloads_beyond_i64_become_null_with_flag() {
        let p = detail(GEMMA)
            .with(Field::Name, text("Gemma"))
            .with(Field::Downloads, text("99999999999B"));
        let m = model(normalize(&p).unwrap());
        assert_eq!(m.model.downloads, None);
        assert_eq!(m.model.quality_flags[0].issue, Issue::NotACount);
        assert_eq!(m.model.quality_flags[0].raw, "99999999999B");
    }

    #[test]
    fn bad_source_url_is_rejected() {
        let err = normalize(&detail("")).unwrap_err();
        assert_eq!(err, RejectionReason::MissingSourceUrl);
        let err = normalize(&detail("kaggle.com/models/x/y")).unwrap_err();
        assert_eq!(err.invariant(), "source_url_well_formed");
    }

    #[test]
    fn maybe_finetunable_is_unknown_not_rejected() {
        let p = PartialRecord::new(VARIANT, Site::Kaggle, PageShape::Variation, Utc::now())
            .with(Field::VariationName, text("2b"))
            .with(Field::License, text("Gemma"))
            .with(Field::IsFinetunable, Slot::Malformed("maybe".into()));
        let v = variation(normalize(&p).unwrap());
        assert_eq!(v.is_finetunable, None);
        assert_eq!(v.model_url, GEMMA);
        assert_eq!(v.framework.as_deref(), Some("transformers"));
        assert_eq!(
            v.quality_flags,
            vec![QualityFlag {
                field: Field::IsFinetunable,
                issue: Issue::UnrecognisedFlag,
                raw: "maybe".into()
            }]
        );
    }

    #[test]
    fn normalizing_twice_is_a_no_op() {
        let p = detail(GEMMA)
            .with(Field::Name, text("Gemma"))
            .with(Field::ShortDescription, text("Lightweight   open models"))
            .with(Field::Downloads, Slot::Malformed("0.5".into()))
            .with(Field::ModelCard, text("Card\n\n\nLinks:\n- https://ai.google.dev"))
            .with(
                Field::Tags,
                text("NLP (opens in new window), nlp, Text, Vision (opens in new window) (opens in new window)"),
            )
            .with(Field::Provenance, text("  Trained on web data "))
            .with(
                Field::VariationLinks,
                Slot::Present(Value::Links(vec![Anchor {
                    text: String::new(),
                    href: VARIANT.into(),
                }])),
            );
        let once = normalize(&p).unwrap();
        let twice = normalize(&once.to_partial()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(model(once).tags, vec!["nlp", "text", "vision"]);

        let v = PartialRecord::new(VARIANT, Site::Kaggle, PageShape::Variation, Utc::now())
            .with(Field::VariationName, text("2b"))
            .with(Field::IsFinetunable, text("Yes"))
            .with(Field::Downloads, text("3,000"));
        let once = normalize(&v).unwrap();
        assert_eq!(normalize(&once.to_partial()).unwrap(), once);
    }

    #[test]
    fn listing_resolves_and_filters_links() {
        let p = PartialRecord::new(
            &kaggle::listing_url(1),
            Site::Kaggle,
            PageShape::Listing,
            Utc::now(),
        )
        .with(
            Field::DetailLinks,
            Slot::Present(Value::Links(vec![
                Anchor { text: "Gemma".into(), href: "/models/google/gemma".into() },
                Anchor { text: String::new(), href: "/models/google/gemma-2/".into() },
                Anchor { text: "again".into(), href: GEMMA.into() },
                Anchor { text: "variant".into(), href: VARIANT.into() },
                Anchor { text: "bad".into(), href: "http://[::1".into() },
            ])),
        );
        let Record::Links(page) = normalize(&p).unwrap() else {
            panic!("expected links");
        };
        let urls: Vec<_> = page.links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(urls, vec![GEMMA, "https://www.kaggle.com/models/google/gemma-2"]);
        assert_eq!(page.links[1].name, "Gemma 2");
        assert_eq!(page.rejected.len(), 1);
        assert!(!page.has_next);
        assert_eq!(normalize(&page_partial(&page)).unwrap(), Record::Links(page));
    }

    fn page_partial(page: &LinkPage) -> PartialRecord {
        Record::Links(page.clone()).to_partial()
    }

    #[test]
    fn validator_catches_duplicates_and_orphans() {
        let mut validator = Validator::with_parents([GEMMA.to_string()]);
        let p = PartialRecord::new(VARIANT, Site::Kaggle, PageShape::Variation, Utc::now())
            .with(Field::VariationName, text("2b"));
        let v = variation(normalize(&p).unwrap());
        assert!(validator.admit_variation(&v).is_ok());
        assert_eq!(
            validator.admit_variation(&v),
            Err(RejectionReason::DuplicateKey { key: VARIANT.into() })
        );

        let orphan_url = "https://www.kaggle.com/models/meta/llama/pytorch/8b";
        let p = PartialRecord::new(orphan_url, Site::Kaggle, PageShape::Variation, Utc::now())
            .with(Field::VariationName, text("8b"));
        let orphan = variation(normalize(&p).unwrap());
        let err = validator.admit_variation(&orphan).unwrap_err();
        assert_eq!(err.invariant(), "variation_parent_exists");
    }
}
