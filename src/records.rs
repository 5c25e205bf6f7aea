//! Validated record shapes, one per stage, as written to artifacts and
//! loaded into the relational schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RejectionReason;
use crate::partial::Field;
use crate::sites::Site;

/// Records carried in an artifact are sorted and de-duplicated by this key.
pub trait Keyed {
    fn key(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    NotACount,
    UnrecognisedFlag,
}

/// A value that was found but could not be coerced; kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFlag {
    pub field: Field,
    pub issue: Issue,
    pub raw: String,
}

/// Stage 1 output: one detail-page URL discovered on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLink {
    pub name: String,
    pub url: String,
}

impl Keyed for ModelLink {
    fn key(&self) -> &str {
        &self.url
    }
}

/// Normalized view of one listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPage {
    pub links: Vec<ModelLink>,
    pub has_next: bool,
    /// Anchors dropped by normalization, keyed by their raw href.
    pub rejected: Vec<(String, RejectionReason)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub source_url: String,
    pub site: Site,
    pub organization_or_name: String,
    pub scraped_at: DateTime<Utc>,
    pub downloads: Option<u64>,
    pub usability: Option<String>,
    pub short_description: Option<String>,
    pub model_card: Option<String>,
    pub example_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_flags: Vec<QualityFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFields {
    pub collaborators: Vec<String>,
    pub authors: Vec<String>,
    pub provenance: Option<String>,
}

/// Stage 2 output: a model with its tags, metadata and variation seeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model: ModelRecord,
    pub tags: Vec<String>,
    pub metadata: MetadataFields,
    pub variation_urls: Vec<String>,
}

impl Keyed for ModelEntry {
    fn key(&self) -> &str {
        &self.model.source_url
    }
}

/// Stage 3 output. `is_finetunable: None` means unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationInfo {
    pub source_url: String,
    pub model_url: String,
    pub framework: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub variation_name: String,
    pub variation_version: Option<String>,
    pub license: Option<String>,
    pub downloads: Option<u64>,
    pub model_card: Option<String>,
    pub is_finetunable: Option<bool>,
    pub example_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality_flags: Vec<QualityFlag>,
}

impl Keyed for VariationInfo {
    fn key(&self) -> &str {
        &self.source_url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Links(LinkPage),
    Model(ModelEntry),
    Variation(VariationInfo),
}
