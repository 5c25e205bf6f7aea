//! Kaggle model hub: organization listing, model pages, framework variations.
//!
//! Class names of the `sc-*` form come from the client-rendered React tree and
//! drift between deploys; meta tags and semantic markup are tried first.

use std::sync::LazyLock;

use regex::Regex;

use super::{FieldKind, FieldRule, PageShape, Recipe, ShapeRules, Site};
use crate::partial::Field;

pub const BASE_URL: &str = "https://www.kaggle.com";
const LISTING_URL: &str = "https://www.kaggle.com/models?owner-type=organization";

pub fn listing_url(page: usize) -> String {
    if page <= 1 {
        LISTING_URL.to_string()
    } else {
        format!("{}&page={}", LISTING_URL, page)
    }
}

/// `https://www.kaggle.com/models/<org>/<model>` of a variation URL.
pub fn parent_of(variation_url: &str) -> Option<String> {
    let caps = VARIATION.url_pattern.captures(variation_url)?;
    Some(format!("{}/models/{}/{}", BASE_URL, &caps[1], &caps[2]))
}

/// Framework segment (`transformers`, `pytorch`, ...) of a variation URL.
pub fn framework_of(variation_url: &str) -> Option<String> {
    let caps = VARIATION.url_pattern.captures(variation_url)?;
    Some(caps[3].to_lowercase())
}

/// Variation slug (`2b-it`) of a variation URL.
pub fn variation_of(variation_url: &str) -> Option<String> {
    let caps = VARIATION.url_pattern.captures(variation_url)?;
    Some(caps[4].to_string())
}

pub static LISTING: LazyLock<ShapeRules> = LazyLock::new(|| ShapeRules {
    site: Site::Kaggle,
    shape: PageShape::Listing,
    url_pattern: Regex::new(r"^https?://(?:www\.)?kaggle\.com/models/?(?:\?[^#]*)?$").unwrap(),
    fields: vec![
        FieldRule::new(
            Field::DetailLinks,
            FieldKind::Links,
            vec![
                Recipe::css(r#"ul li div a[href*="/models/"]"#).anchors(),
                Recipe::css(r#"a[href^="/models/"]"#).anchors().rendered(),
            ],
        ),
        FieldRule::new(
            Field::NextPage,
            FieldKind::Text,
            vec![
                Recipe::css(r#"a[rel="next"]"#).attr("href"),
                Recipe::css(r#"button[aria-label="Go to next page"]:not([disabled])"#)
                    .attr("aria-label"),
            ],
        ),
    ],
    required: vec![Field::DetailLinks],
});

pub static DETAIL: LazyLock<ShapeRules> = LazyLock::new(|| ShapeRules {
    site: Site::Kaggle,
    shape: PageShape::Detail,
    url_pattern: Regex::new(r"^https?://(?:www\.)?kaggle\.com/models/([^/?#]+)/([^/?#]+)/?$")
        .unwrap(),
    fields: vec![
        FieldRule::new(
            Field::Name,
            FieldKind::Text,
            vec![
                Recipe::css("h1"),
                Recipe::css(r#"meta[property="og:title"]"#).attr("content"),
            ],
        ),
        FieldRule::new(
            Field::ShortDescription,
            FieldKind::Text,
            vec![
                Recipe::css(r#"meta[name="description"]"#).attr("content"),
                Recipe::css("p.sc-gGKoUb.jJPcnF").rendered(),
                Recipe::css(".sc-fhfEft > p:nth-child(2)").rendered(),
            ],
        ),
        FieldRule::new(
            Field::Downloads,
            FieldKind::Count,
            vec![
                Recipe::css(
                    ".sc-jTpuXY > div:nth-child(1) > div:nth-child(2) > div:nth-child(1) > span:nth-child(1)",
                ),
                Recipe::css(
                    "div.sc-gUYSAC:nth-child(2) > div:nth-child(2) > div:nth-child(2) > span:nth-child(1)",
                ),
                Recipe::css("span.sc-kCuUfV.sc-hoocXy.iPCsnU.eqfbZr").all().shared(),
                Recipe::css("span.sc-hoocXy.eqfbZr").all().shared(),
                Recipe::css("span.iPCsnU.eqfbZr").all().rendered().shared(),
            ],
        ),
        FieldRule::new(
            Field::Usability,
            FieldKind::Text,
            vec![
                Recipe::css("p.sc-hwddKA:nth-child(5)"),
                Recipe::css("p.sc-hwddKA").rendered(),
            ],
        ),
        FieldRule::new(
            Field::ModelCard,
            FieldKind::LongText,
            vec![
                Recipe::css("div.sc-lkCrJH:nth-child(1)").with_links(),
                Recipe::css(".sc-chzmIZ > div:nth-child(1)").with_links(),
            ],
        ),
        FieldRule::new(
            Field::Tags,
            FieldKind::List,
            vec![
                Recipe::css("a.sc-hZpmlk.kpuQUO").all(),
                Recipe::css(".sc-hfCsLp a").all().rendered(),
                Recipe::css(r#"meta[name="keywords"]"#).attr("content"),
            ],
        ),
        FieldRule::new(
            Field::Collaborators,
            FieldKind::List,
            vec![
                Recipe::css("div.sc-bBhMX:nth-child(1) p.sc-gGKoUb").all(),
                Recipe::css(r#"p[style*="margin-left"]"#).all().rendered(),
            ],
        ),
        FieldRule::new(
            Field::Authors,
            FieldKind::List,
            vec![
                Recipe::css("div.sc-bBhMX:nth-child(2) > div:nth-child(2)"),
                Recipe::css("div.sc-bBhMX:nth-child(2) p.sc-gGKoUb").all(),
            ],
        ),
        FieldRule::new(
            Field::Provenance,
            FieldKind::LongText,
            vec![Recipe::css(".sc-fPzfn")],
        ),
        FieldRule::new(
            Field::VariationLinks,
            FieldKind::Links,
            vec![Recipe::css(r#"a[href*="/models/"]"#).anchors()],
        ),
    ],
    required: vec![Field::Name, Field::ShortDescription, Field::Downloads],
});

pub static VARIATION: LazyLock<ShapeRules> = LazyLock::new(|| ShapeRules {
    site: Site::Kaggle,
    shape: PageShape::Variation,
    url_pattern: Regex::new(
        r"^https?://(?:www\.)?kaggle\.com/models/([^/?#]+)/([^/?#]+)/([^/?#]+)/([^/?#]+)(?:/(\d+))?/?$",
    )
    .unwrap(),
    fields: vec![
        FieldRule::new(
            Field::VariationName,
            FieldKind::Text,
            vec![
                Recipe::css(r#"div[aria-label="Select Variation"] div.sc-jaGrhB"#),
                Recipe::css("div.sc-jaGrhB.hYa-DAr"),
            ],
        ),
        FieldRule::new(
            Field::VariationVersion,
            FieldKind::Text,
            vec![Recipe::css("a.sc-eVqvcJ.iRcjJz")],
        ),
        FieldRule::new(
            Field::License,
            FieldKind::Text,
            vec![
                Recipe::css("a.sc-bbbBoY.hzCdJV"),
                Recipe::css("p.sc-gGKoUb.bEqAGC"),
            ],
        ),
        FieldRule::new(
            Field::Downloads,
            FieldKind::Count,
            vec![
                Recipe::css(
                    ".sc-sphZQ > div:nth-child(2) > p:nth-child(2) > div:nth-child(1) > span:nth-child(1)",
                ),
                Recipe::css(".sc-sphZQ span.sc-hoocXy.eqfbZr").all().shared(),
            ],
        ),
        FieldRule::new(
            Field::ModelCard,
            FieldKind::LongText,
            vec![Recipe::css("div.sc-lkCrJH:nth-child(3)").with_links()],
        ),
        FieldRule::new(
            Field::IsFinetunable,
            FieldKind::Flag,
            vec![
                Recipe::css(r#"p.sc-gGKoUb.bEqAGC[style*="margin-top"]"#).all(),
                Recipe::css("p.sc-gGKoUb.bEqAGC").all().rendered().shared(),
            ],
        ),
        FieldRule::new(
            Field::ExampleUsage,
            FieldKind::LongText,
            vec![
                Recipe::css("div.sc-cfYtRh.eiwGaI"),
                Recipe::css("#example-use + div").rendered(),
            ],
        ),
    ],
    required: vec![Field::VariationName, Field::License],
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_pages() {
        assert_eq!(listing_url(1), "https://www.kaggle.com/models?owner-type=organization");
        assert_eq!(
            listing_url(3),
            "https://www.kaggle.com/models?owner-type=organization&page=3"
        );
        assert!(LISTING.matches_url(&listing_url(3)));
        assert!(!LISTING.matches_url("https://www.kaggle.com/models/google/gemma"));
    }

    #[test]
    fn shapes_are_disjoint() {
        let detail = "https://www.kaggle.com/models/google/gemma";
        let variation = "https://www.kaggle.com/models/google/gemma/transformers/2b";
        assert!(DETAIL.matches_url(detail));
        assert!(!DETAIL.matches_url(variation));
        assert!(VARIATION.matches_url(variation));
        assert!(VARIATION.matches_url(&format!("{}/3", variation)));
        assert!(!VARIATION.matches_url(detail));
    }

    #[test]
    fn variation_parent_and_framework() {
        let url = "https://www.kaggle.com/models/google/gemma/Transformers/2b-it/3";
        assert_eq!(
            parent_of(url).as_deref(),
            Some("https://www.kaggle.com/models/google/gemma")
        );
        assert_eq!(framework_of(url).as_deref(), Some("transformers"));
        assert_eq!(variation_of(url).as_deref(), Some("2b-it"));
        assert_eq!(parent_of("https://www.kaggle.com/models/google/gemma"), None);
    }
}
