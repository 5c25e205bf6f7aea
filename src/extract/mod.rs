//! Page → `PartialRecord`, following the recipe list of the page's shape.

pub mod clean;

use std::collections::BTreeSet;

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::debug;

use crate::error::ShapeMismatch;
use crate::fetch::Page;
use crate::normalize::coerce;
use crate::partial::{Anchor, Field, PartialRecord, Slot, Value};
use crate::sites::{FieldKind, FieldRule, PageShape, Recipe, ShapeRules, Site, Take};
use clean::{block_text, clean_lines, collapse_ws, resolve};

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// A partial record plus the required fields no recipe could fill.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub record: PartialRecord,
    pub missing: BTreeSet<Field>,
}

pub fn extract(page: &Page, site: Site, shape: PageShape) -> Result<Extraction, ShapeMismatch> {
    let rules = site.rules(shape).ok_or_else(|| ShapeMismatch {
        url: page.url.clone(),
        expected: shape,
        reason: format!("{} has no {} pages", site, shape),
    })?;
    extract_with(page, rules)
}

pub fn extract_with(page: &Page, rules: &ShapeRules) -> Result<Extraction, ShapeMismatch> {
    let mismatch = |reason: &str| ShapeMismatch {
        url: page.url.clone(),
        expected: rules.shape,
        reason: reason.to_string(),
    };

    if !rules.matches_url(&page.url) {
        return Err(mismatch("URL does not match the page pattern"));
    }

    let doc = Html::parse_document(&page.html);
    let has_body = doc
        .select(&BODY)
        .next()
        .is_some_and(|body| !collapse_ws(&block_text(body)).is_empty());
    if !has_body {
        return Err(mismatch("document has no body content"));
    }

    let mut record = PartialRecord::new(&page.url, rules.site, rules.shape, Utc::now());
    for rule in &rules.fields {
        let slot = extract_field(&doc, rule, page);
        if slot.is_absent() {
            debug!(url = %page.url, field = %rule.field, rendered = page.rendered, "no recipe matched");
        }
        record.set(rule.field, slot);
    }

    let missing = record.missing(&rules.required);
    Ok(Extraction { record, missing })
}

fn extract_field(doc: &Html, rule: &FieldRule, page: &Page) -> Slot {
    let recipes = rule.recipes.iter().filter(|r| r.applies_to(page.rendered));
    match rule.kind {
        FieldKind::Count => first_recognised(doc, recipes, |s| coerce::parse_count(s).is_some()),
        FieldKind::Flag => first_recognised(doc, recipes, |s| coerce::parse_flag(s).is_some()),
        kind => {
            for recipe in recipes {
                if let Some(value) = apply(doc, recipe, kind, page) {
                    return Slot::Present(value);
                }
            }
            Slot::Absent
        }
    }
}

/// First candidate `ok` accepts wins. Unrecognised text from a field-specific
/// recipe is `Malformed`; from a shared recipe it is ignored.
fn first_recognised<'a>(
    doc: &Html,
    recipes: impl Iterator<Item = &'a Recipe>,
    ok: impl Fn(&str) -> bool,
) -> Slot {
    let mut first_raw: Option<String> = None;
    for recipe in recipes {
        for candidate in texts(doc, recipe) {
            if ok(&candidate) {
                return Slot::Present(Value::Text(candidate));
            }
            if !recipe.shared {
                first_raw.get_or_insert(candidate);
            }
        }
    }
    match first_raw {
        Some(raw) => Slot::Malformed(raw),
        None => Slot::Absent,
    }
}

/// Non-empty, whitespace-collapsed candidates a recipe yields.
fn texts(doc: &Html, recipe: &Recipe) -> Vec<String> {
    let mut out = Vec::new();
    for el in doc.select(&recipe.selector) {
        let text = match recipe.take {
            Take::Attr(name) => el.value().attr(name).map(collapse_ws).unwrap_or_default(),
            _ => collapse_ws(&block_text(el)),
        };
        if !text.is_empty() {
            out.push(text);
            if !matches!(recipe.take, Take::AllText) {
                break;
            }
        }
    }
    out
}

fn apply(doc: &Html, recipe: &Recipe, kind: FieldKind, page: &Page) -> Option<Value> {
    match recipe.take {
        Take::Anchors => {
            let anchors: Vec<Anchor> = doc.select(&recipe.selector).filter_map(anchor).collect();
            (!anchors.is_empty()).then_some(Value::Links(anchors))
        }
        Take::AllText => {
            let all = texts(doc, recipe);
            (!all.is_empty()).then_some(Value::List(all))
        }
        Take::TextWithLinks => doc
            .select(&recipe.selector)
            .find_map(|el| card_with_links(el, &page.url))
            .map(Value::Text),
        Take::Text | Take::Attr(_) => {
            if kind == FieldKind::LongText && recipe.take == Take::Text {
                doc.select(&recipe.selector)
                    .map(|el| clean_lines(&block_text(el)))
                    .find(|t| !t.is_empty())
                    .map(Value::Text)
            } else {
                texts(doc, recipe).into_iter().next().map(Value::Text)
            }
        }
    }
}

fn anchor(el: ElementRef) -> Option<Anchor> {
    let href = el.value().attr("href")?.trim().to_string();
    if href.is_empty() {
        return None;
    }
    let text = el
        .value()
        .attr("title")
        .map(collapse_ws)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| collapse_ws(&block_text(el)));
    Some(Anchor { text, href })
}

/// Card text followed by a `Links:` list of its outbound anchors.
fn card_with_links(el: ElementRef, base: &str) -> Option<String> {
    let text = clean_lines(&block_text(el));
    if text.is_empty() {
        return None;
    }
    let mut links: Vec<String> = Vec::new();
    for a in el.select(&ANCHOR) {
        if let Some(href) = a.value().attr("href").and_then(|h| resolve(base, h)) {
            if !links.contains(&href) {
                links.push(href);
            }
        }
    }
    if links.is_empty() {
        return Some(text);
    }
    let list: Vec<String> = links.iter().map(|l| format!("- {}", l)).collect();
    Some(format!("{}\n\nLinks:\n{}", text, list.join("\n")))
}
