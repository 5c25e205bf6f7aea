use scraper::{ElementRef, Node};

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "li", "ul", "ol", "br", "pre", "tr", "table", "section", "article", "h1", "h2",
    "h3", "h4", "h5", "h6", "blockquote",
];

/// Text of an element with a line break at every block boundary.
pub fn block_text(el: ElementRef) -> String {
    let mut out = String::new();
    for node in el.descendants() {
        match node.value() {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) if BLOCK_TAGS.contains(&e.name()) => out.push('\n'),
            _ => {}
        }
    }
    out
}

/// Single line, runs of whitespace collapsed to one space.
pub fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Each line collapsed, blank runs reduced to one empty line.
pub fn clean_lines(s: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in s.lines().map(collapse_ws) {
        if line.is_empty() && out.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Absolute http(s) URL for `href` relative to `base`.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = url::Url::parse(base).ok()?;
    let joined = base.join(href).ok()?;
    match joined.scheme() {
        "http" | "https" => Some(joined.to_string()),
        _ => None,
    }
}
