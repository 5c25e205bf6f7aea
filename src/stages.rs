use std::fmt;

use crate::sites::{PageShape, Site};

/// One pipeline stage: which site and page shape it extracts, and which
/// stage's artifact feeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    pub site: Site,
    pub shape: PageShape,
    pub upstream: Option<&'static str>,
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub const REGISTRY: &[StageSpec] = &[
    StageSpec {
        name: "kaggle_links",
        site: Site::Kaggle,
        shape: PageShape::Listing,
        upstream: None,
    },
    StageSpec {
        name: "kaggle_metadata",
        site: Site::Kaggle,
        shape: PageShape::Detail,
        upstream: Some("kaggle_links"),
    },
    StageSpec {
        name: "kaggle_variations",
        site: Site::Kaggle,
        shape: PageShape::Variation,
        upstream: Some("kaggle_metadata"),
    },
    StageSpec {
        name: "nvidia_links",
        site: Site::Nvidia,
        shape: PageShape::Listing,
        upstream: None,
    },
    StageSpec {
        name: "nvidia_metadata",
        site: Site::Nvidia,
        shape: PageShape::Detail,
        upstream: Some("nvidia_links"),
    },
];

pub fn by_name(name: &str) -> Option<&'static StageSpec> {
    REGISTRY.iter().find(|s| s.name == name)
}

pub fn for_site(site: Site, shape: PageShape) -> Option<&'static StageSpec> {
    REGISTRY.iter().find(|s| s.site == site && s.shape == shape)
}

/// Stages of a site in dependency order.
pub fn chain(site: Site) -> Vec<&'static StageSpec> {
    let mut out = Vec::new();
    let mut next = REGISTRY.iter().find(|s| s.site == site && s.upstream.is_none());
    while let Some(stage) = next {
        out.push(stage);
        next = REGISTRY.iter().find(|s| s.upstream == Some(stage.name));
    }
    out
}
