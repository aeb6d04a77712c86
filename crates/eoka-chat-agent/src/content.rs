//! Cleaning of extracted response content.
//!
//! Interactive chrome (buttons, toolbars, icons) is removed inside the page
//! before extraction. What remains here is cosmetic: attributes that only
//! matter for styling or scripting, comments, and blank runs.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::driver::Extracted;

/// Tags that make HTML worth keeping over plain text.
const STRUCTURAL_TAGS: &[&str] = &[
    "p", "ul", "ol", "li", "pre", "code", "h1", "h2", "h3", "h4", "h5", "h6", "table", "tr",
    "td", "th", "blockquote", "strong", "em", "br", "hr", "a",
];

/// Prefixes and names of attributes that only matter for styling or scripts.
const COSMETIC_ATTRS: &[&str] = &[
    "class",
    "style",
    "id",
    "dir",
    "tabindex",
    "role",
    "draggable",
    "spellcheck",
];

fn is_cosmetic(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    COSMETIC_ATTRS.contains(&name.as_str())
        || name.starts_with("data-")
        || name.starts_with("aria-")
        || (name.len() > 2 && name.starts_with("on"))
}

/// One whole attribute: name plus optional value, quoted values consumed
/// entirely so nothing inside them is read as a name.
fn attr_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\s+([^\s"'<>/=]+)(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'>]+))?"#).ok()
    })
    .as_ref()
}

fn comment_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").ok()).as_ref()
}

fn open_tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([a-zA-Z][a-zA-Z0-9]*)[\s/>]").ok())
        .as_ref()
}

fn blank_lines_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n\s*\n+").ok()).as_ref()
}

/// Whether `html` contains any structural markup.
pub fn has_structure(html: &str) -> bool {
    let Some(re) = open_tag_re() else {
        return false;
    };
    re.captures_iter(html).any(|c| {
        let tag = c[1].to_ascii_lowercase();
        STRUCTURAL_TAGS.contains(&tag.as_str())
    })
}

/// Drop cosmetic attributes and comments from `html`.
pub fn strip_cosmetics(html: &str) -> String {
    let mut out = html.to_string();
    if let Some(re) = comment_re() {
        out = re.replace_all(&out, "").into_owned();
    }
    // only touch the inside of tags, never text content
    let mut cleaned = String::with_capacity(out.len());
    let mut rest = out.as_str();
    while let Some(start) = rest.find('<') {
        cleaned.push_str(&rest[..start]);
        let Some(len) = tag_end(&rest[start..]) else {
            cleaned.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = &rest[start..=start + len];
        match attr_re() {
            Some(re) => cleaned.push_str(&re.replace_all(tag, |caps: &Captures| {
                if is_cosmetic(&caps[1]) {
                    String::new()
                } else {
                    caps[0].to_string()
                }
            })),
            None => cleaned.push_str(tag),
        }
        rest = &rest[start + len + 1..];
    }
    cleaned.push_str(rest);
    if let Some(re) = blank_lines_re() {
        cleaned = re.replace_all(&cleaned, "\n\n").into_owned();
    }
    cleaned.trim().to_string()
}

/// Offset of the `>` closing the tag that opens `html`, skipping quoted
/// attribute values.
fn tag_end(html: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in html.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Final response content: cleaned HTML when it carries structure,
/// otherwise the plain text.
pub fn clean_response(extracted: &Extracted) -> String {
    if has_structure(&extracted.html) {
        let html = strip_cosmetics(&extracted.html);
        if !html.is_empty() {
            return html;
        }
    }
    let text = extracted.text.trim();
    if text.is_empty() {
        // markup without structure (spans only): keep its text
        return strip_cosmetics(&extracted.html);
    }
    text.to_string()
}
