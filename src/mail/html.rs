//! HTML body to plain text.
//!
//! The primary converter walks the parsed DOM. If it panics or produces
//! nothing, a plain tag-stripper is used instead.

use std::panic::{self, AssertUnwindSafe};

use scraper::{ElementRef, Html, Node};

const SKIPPED: &[&str] = &["script", "style", "head", "title", "noscript"];

const BLOCKS: &[&str] = &[
    "p", "div", "br", "tr", "li", "ul", "ol", "table", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "pre", "hr", "section", "article", "header", "footer",
];

/// Convert an HTML body to readable text.
pub fn html_to_text(html: &str) -> String {
    match panic::catch_unwind(AssertUnwindSafe(|| dom_to_text(html))) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => strip_html(html),
        Err(_) => {
            tracing::warn!("HTML converter panicked, falling back to tag stripping");
            strip_html(html)
        }
    }
}

fn dom_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    walk(document.root_element(), &mut out);
    tidy(&out)
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.is_empty() {
                    continue;
                }
                if !out.is_empty() && !out.ends_with(['\n', ' ']) && text.starts_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(&collapsed);
                if text.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED.contains(&name) {
                    continue;
                }
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCKS.contains(&name);
                if block {
                    out.push('\n');
                }
                walk(child_ref, out);
                if name == "a"
                    && let Some(href) = el.attr("href")
                    && !href.starts_with("mailto:")
                    && !href.starts_with('#')
                {
                    out.push_str(&format!(" ({href})"));
                }
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Trim each line and collapse runs of blank lines into one.
fn tidy(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    for line in raw.lines().map(str::trim) {
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Strip HTML tags from content.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
