use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::partial::Field;
use crate::sites::PageShape;

/// Fetch failure surfaced after the capability's own retries are exhausted.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },
    #[error("fetch capability unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate request suppressed: {0}")]
    Duplicate(String),
}

impl FetchError {
    /// Whether the error means the capability itself is gone, not just one page.
    pub fn is_systemic(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Error)]
#[error("{url} is not a {expected} page: {reason}")]
pub struct ShapeMismatch {
    pub url: String,
    pub expected: PageShape,
    pub reason: String,
}

/// Why a normalized record was dropped from the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("source_url is missing")]
    MissingSourceUrl,
    #[error("source_url {raw:?} is not a well-formed http(s) URL")]
    MalformedSourceUrl { raw: String },
    #[error("required field {field} is missing")]
    MissingField { field: Field },
    #[error("natural key {key} already emitted in this stage")]
    DuplicateKey { key: String },
    #[error("variation {key} references unknown model {parent}")]
    OrphanVariation { key: String, parent: String },
}

impl RejectionReason {
    /// Name of the schema invariant the record failed.
    pub fn invariant(&self) -> &'static str {
        match self {
            RejectionReason::MissingSourceUrl | RejectionReason::MalformedSourceUrl { .. } => {
                "source_url_well_formed"
            }
            RejectionReason::MissingField { .. } => "required_field_present",
            RejectionReason::DuplicateKey { .. } => "unique_natural_key",
            RejectionReason::OrphanVariation { .. } => "variation_parent_exists",
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            RejectionReason::MissingSourceUrl
            | RejectionReason::MalformedSourceUrl { .. }
            | RejectionReason::DuplicateKey { .. } => "source_url",
            RejectionReason::MissingField { field } => field.as_str(),
            RejectionReason::OrphanVariation { .. } => "model_url",
        }
    }
}

/// Failures that abort a stage and the run.
#[derive(Debug, Error)]
pub enum SystemicFailure {
    #[error("{stage}: fetch capability unavailable: {message}")]
    CapabilityUnavailable { stage: String, message: String },
    #[error("{stage}: zero records extracted from {attempted} pages")]
    NothingExtracted { stage: String, attempted: usize },
    #[error("{stage}: incompatible input: {message}")]
    IncompatibleInput { stage: String, message: String },
    #[error("artifact {0:?} already exists")]
    ArtifactCollision(PathBuf),
    #[error("artifact I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_names_invariant_and_field() {
        let r = RejectionReason::MalformedSourceUrl { raw: "nope".into() };
        assert_eq!(r.invariant(), "source_url_well_formed");
        assert_eq!(r.field(), "source_url");

        let r = RejectionReason::MissingField { field: Field::VariationName };
        assert_eq!(r.field(), "variation_name");
    }

    #[test]
    fn only_unavailable_is_systemic() {
        assert!(FetchError::Unavailable("no key".into()).is_systemic());
        assert!(!FetchError::Status { url: "u".into(), status: 503 }.is_systemic());
    }
}
