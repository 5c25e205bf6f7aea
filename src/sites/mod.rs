pub mod kaggle;
pub mod nvidia;

use std::fmt;

use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::partial::Field;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Kaggle,
    Nvidia,
}

impl Site {
    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Kaggle => "kaggle",
            Site::Nvidia => "nvidia",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Site::Kaggle => kaggle::BASE_URL,
            Site::Nvidia => nvidia::BASE_URL,
        }
    }

    /// URL of the n-th (1-based) listing page.
    pub fn listing_url(&self, page: usize) -> String {
        match self {
            Site::Kaggle => kaggle::listing_url(page),
            Site::Nvidia => nvidia::listing_url(page),
        }
    }

    /// URL to fetch for a detail page whose natural key is `key`.
    pub fn detail_fetch_url(&self, key: &str) -> String {
        match self {
            Site::Kaggle => key.to_string(),
            Site::Nvidia => nvidia::modelcard_url(key),
        }
    }

    pub fn rules(&self, shape: PageShape) -> Option<&'static ShapeRules> {
        match (self, shape) {
            (Site::Kaggle, PageShape::Listing) => Some(&kaggle::LISTING),
            (Site::Kaggle, PageShape::Detail) => Some(&kaggle::DETAIL),
            (Site::Kaggle, PageShape::Variation) => Some(&kaggle::VARIATION),
            (Site::Nvidia, PageShape::Listing) => Some(&nvidia::LISTING),
            (Site::Nvidia, PageShape::Detail) => Some(&nvidia::DETAIL),
            (Site::Nvidia, PageShape::Variation) => None,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageShape {
    Listing,
    Detail,
    Variation,
}

impl fmt::Display for PageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PageShape::Listing => "listing",
            PageShape::Detail => "detail",
            PageShape::Variation => "variation",
        })
    }
}

/// How the extracted text of a field is cleaned and later coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single line, whitespace collapsed.
    Text,
    /// Multi-line, each line trimmed.
    LongText,
    /// Download-style counts; first numeric candidate wins.
    Count,
    /// Yes/no values; first recognised candidate wins.
    Flag,
    List,
    Links,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    /// Text of the first matching element.
    Text,
    /// Attribute of the first matching element that has it.
    Attr(&'static str),
    /// Text of every matching element.
    AllText,
    /// Text of the first match plus its outbound anchors.
    TextWithLinks,
    /// (label, href) of every matching anchor; label prefers the `title` attribute.
    Anchors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dom {
    Any,
    RenderedOnly,
}

#[derive(Debug)]
pub struct Recipe {
    pub css: &'static str,
    pub selector: Selector,
    pub take: Take,
    pub dom: Dom,
    /// Matches text that belongs to other fields too; a miss here is not a malformed value.
    pub shared: bool,
}

impl Recipe {
    pub fn css(css: &'static str) -> Self {
        Recipe {
            css,
            selector: Selector::parse(css).unwrap(),
            take: Take::Text,
            dom: Dom::Any,
            shared: false,
        }
    }

    pub fn attr(mut self, name: &'static str) -> Self {
        self.take = Take::Attr(name);
        self
    }

    pub fn all(mut self) -> Self {
        self.take = Take::AllText;
        self
    }

    pub fn with_links(mut self) -> Self {
        self.take = Take::TextWithLinks;
        self
    }

    pub fn anchors(mut self) -> Self {
        self.take = Take::Anchors;
        self
    }

    pub fn rendered(mut self) -> Self {
        self.dom = Dom::RenderedOnly;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn applies_to(&self, rendered: bool) -> bool {
        rendered || self.dom == Dom::Any
    }
}

#[derive(Debug)]
pub struct FieldRule {
    pub field: Field,
    pub kind: FieldKind,
    pub recipes: Vec<Recipe>,
}

impl FieldRule {
    pub fn new(field: Field, kind: FieldKind, recipes: Vec<Recipe>) -> Self {
        FieldRule { field, kind, recipes }
    }
}

/// Extraction recipe set for one (site, shape).
#[derive(Debug)]
pub struct ShapeRules {
    pub site: Site,
    pub shape: PageShape,
    pub url_pattern: Regex,
    pub fields: Vec<FieldRule>,
    pub required: Vec<Field>,
}

impl ShapeRules {
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_pattern.is_match(url)
    }
}

/// Title-cased name from the last path segment, e.g. `.../gemma-2` → `Gemma 2`.
pub fn name_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?.to_string();
    let words: Vec<String> = last
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_site_shape_compiles() {
        for site in [Site::Kaggle, Site::Nvidia] {
            for shape in [PageShape::Listing, PageShape::Detail, PageShape::Variation] {
                if let Some(rules) = site.rules(shape) {
                    assert_eq!(rules.shape, shape);
                    assert_eq!(rules.site, site);
                    for field in &rules.required {
                        assert!(
                            rules.fields.iter().any(|r| r.field == *field),
                            "{site} {shape} lacks {field}"
                        );
                    }
                }
            }
        }
        assert!(Site::Nvidia.rules(PageShape::Variation).is_none());
    }

    #[test]
    fn name_fallback_from_url() {
        assert_eq!(
            name_from_url("https://www.kaggle.com/models/google/gemma-2").as_deref(),
            Some("Gemma 2")
        );
        assert_eq!(
            name_from_url("https://build.nvidia.com/meta/llama_3-70b/").as_deref(),
            Some("Llama 3 70b")
        );
        assert_eq!(name_from_url("https://example.com/"), None);
    }
}
