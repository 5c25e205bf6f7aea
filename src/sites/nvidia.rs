//! NVIDIA model catalog. Model cards live on a `/modelcard` sub-page; the
//! natural key stays the model URL.

use std::sync::LazyLock;

use regex::Regex;

use super::{FieldKind, FieldRule, PageShape, Recipe, ShapeRules, Site};
use crate::partial::Field;

pub const BASE_URL: &str = "https://build.nvidia.com";

pub fn listing_url(page: usize) -> String {
    if page <= 1 {
        format!("{}/models", BASE_URL)
    } else {
        format!("{}/models?page={}", BASE_URL, page)
    }
}

pub fn modelcard_url(model_url: &str) -> String {
    let base = model_url.trim_end_matches('/');
    if base.ends_with("/modelcard") {
        base.to_string()
    } else {
        format!("{}/modelcard", base)
    }
}

pub static LISTING: LazyLock<ShapeRules> = LazyLock::new(|| ShapeRules {
    site: Site::Nvidia,
    shape: PageShape::Listing,
    url_pattern: Regex::new(r"^https?://build\.nvidia\.com/models/?(?:\?[^#]*)?$").unwrap(),
    fields: vec![
        FieldRule::new(
            Field::DetailLinks,
            FieldKind::Links,
            vec![Recipe::css(r#"a[data-linkbox-overlay="true"]"#).anchors()],
        ),
        FieldRule::new(
            Field::NextPage,
            FieldKind::Text,
            vec![Recipe::css(r#"a[rel="next"]"#).attr("href")],
        ),
    ],
    required: vec![Field::DetailLinks],
});

pub static DETAIL: LazyLock<ShapeRules> = LazyLock::new(|| ShapeRules {
    site: Site::Nvidia,
    shape: PageShape::Detail,
    url_pattern: Regex::new(r"^https?://build\.nvidia\.com/([^/?#]+)/([^/?#]+)(?:/modelcard)?/?$")
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
            vec![Recipe::css(r#"meta[name="description"]"#).attr("content")],
        ),
        FieldRule::new(
            Field::Tags,
            FieldKind::List,
            vec![
                Recipe::css("div.flex.items-center.gap-2.overflow-hidden button.inline-flex.min-w-fit a")
                    .all(),
                Recipe::css(r#"div[class*="flex"][class*="w-fit"][class*="flex-wrap"] button a"#)
                    .all()
                    .rendered(),
            ],
        ),
        FieldRule::new(
            Field::ModelCard,
            FieldKind::LongText,
            vec![Recipe::css("div.prose.prose-markdown-compat").with_links()],
        ),
    ],
    required: vec![Field::Name, Field::ModelCard],
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modelcard_url_is_idempotent() {
        let once = modelcard_url("https://build.nvidia.com/meta/llama-3_1-8b-instruct/");
        assert_eq!(once, "https://build.nvidia.com/meta/llama-3_1-8b-instruct/modelcard");
        assert_eq!(modelcard_url(&once), once);
        assert!(DETAIL.matches_url(&once));
    }

    #[test]
    fn listing_is_not_a_detail_page() {
        assert!(LISTING.matches_url(&listing_url(1)));
        assert!(!DETAIL.matches_url(&listing_url(1)));
    }
}
