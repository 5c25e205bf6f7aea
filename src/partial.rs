use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sites::{PageShape, Site};

/// Every field any page shape can yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    DetailLinks,
    NextPage,
    Name,
    ShortDescription,
    Downloads,
    Usability,
    ModelCard,
    ExampleUsage,
    Tags,
    Collaborators,
    Authors,
    Provenance,
    VariationLinks,
    VariationName,
    VariationVersion,
    License,
    IsFinetunable,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::DetailLinks => "detail_links",
            Field::NextPage => "next_page",
            Field::Name => "name",
            Field::ShortDescription => "short_description",
            Field::Downloads => "downloads",
            Field::Usability => "usability",
            Field::ModelCard => "model_card",
            Field::ExampleUsage => "example_usage",
            Field::Tags => "tags",
            Field::Collaborators => "collaborators",
            Field::Authors => "authors",
            Field::Provenance => "provenance",
            Field::VariationLinks => "variation_links",
            Field::VariationName => "variation_name",
            Field::VariationVersion => "variation_version",
            Field::License => "license",
            Field::IsFinetunable => "is_finetunable",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    List(Vec<String>),
    Links(Vec<Anchor>),
}

/// Extraction state of one field. `Absent` is never a zero value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Present(Value),
    Absent,
    Malformed(String),
}

impl Slot {
    pub fn is_absent(&self) -> bool {
        matches!(self, Slot::Absent)
    }
}

/// Per-field result of extracting one page, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRecord {
    pub url: String,
    pub site: Site,
    pub shape: PageShape,
    pub fetched_at: DateTime<Utc>,
    /// Parent model key, set for variation pages.
    pub parent: Option<String>,
    fields: BTreeMap<Field, Slot>,
}

impl PartialRecord {
    pub fn new(url: &str, site: Site, shape: PageShape, fetched_at: DateTime<Utc>) -> Self {
        PartialRecord {
            url: url.to_string(),
            site,
            shape,
            fetched_at,
            parent: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, field: Field, slot: Slot) {
        self.fields.insert(field, slot);
    }

    pub fn with(mut self, field: Field, slot: Slot) -> Self {
        self.set(field, slot);
        self
    }

    pub fn get(&self, field: Field) -> &Slot {
        self.fields.get(&field).unwrap_or(&Slot::Absent)
    }

    #[cfg(test)]
    pub fn text(&self, field: Field) -> Option<&str> {
        match self.get(field) {
            Slot::Present(Value::Text(t)) => Some(t),
            _ => None,
        }
    }

    pub fn into_fields(self) -> impl Iterator<Item = (Field, Slot)> {
        self.fields.into_iter()
    }

    /// Fields from `candidates` that are absent in this record.
    pub fn missing<'a>(&self, candidates: impl IntoIterator<Item = &'a Field>) -> BTreeSet<Field> {
        candidates
            .into_iter()
            .filter(|f| self.get(**f).is_absent())
            .copied()
            .collect()
    }
}
