//! Heuristic fallbacks used when no declarative rule matches.

use crate::driver::{ElementInfo, Viewport};

/// Words that suggest a control submits the prompt.
const SUBMIT_KEYWORDS: [&str; 6] = ["send", "submit", "search", "ask", "go", "enter"];

/// Words that mark a nearby control we must never press.
const AVOID_KEYWORDS: [&str; 9] = [
    "stop", "cancel", "attach", "upload", "voice", "microphone", "delete", "menu", "close",
];

/// Elements narrower or shorter than this are implausible click targets.
const TINY_PX: f64 = 16.0;

/// Laid out and not hidden. With `text_counts`, an element with text but a
/// zero box still counts (background tabs often skip layout).
pub fn is_visible(el: &ElementInfo, text_counts: bool) -> bool {
    el.style_visible && (el.bbox.area() > 0.0 || (text_counts && el.text_len > 0))
}

pub fn is_usable_input(el: &ElementInfo) -> bool {
    is_visible(el, false) && el.enabled && el.editable
}

pub fn is_usable_control(el: &ElementInfo) -> bool {
    is_visible(el, false) && el.enabled
}

fn tokens(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Whole-token match; keywords of four letters or more also match as a token prefix
/// (`sendButton` → `sendbutton`).
fn has_keyword(s: &str, keywords: &[&str]) -> bool {
    tokens(s).any(|t| {
        keywords
            .iter()
            .any(|kw| t == *kw || (kw.len() >= 4 && t.starts_with(kw)))
    })
}

/// Weighted submit-likelihood. Positive means plausible.
pub fn submit_score(el: &ElementInfo, viewport: &Viewport) -> i32 {
    let aria = el.attr("aria-label").unwrap_or("");
    let title = el.attr("title").unwrap_or("");
    let ident = format!(
        "{} {} {}",
        el.class,
        el.id.as_deref().unwrap_or(""),
        el.attr("data-testid").unwrap_or("")
    );

    let mut score = 0;
    if has_keyword(aria, &SUBMIT_KEYWORDS) {
        score += 8;
    }
    if has_keyword(&el.text, &SUBMIT_KEYWORDS) {
        score += 6;
    }
    if has_keyword(title, &SUBMIT_KEYWORDS) {
        score += 4;
    }
    if has_keyword(&ident, &SUBMIT_KEYWORDS) {
        score += 4;
    }
    if el.attr("type") == Some("submit") {
        score += 6;
    }
    if el.in_form {
        score += 3;
    }
    if el.has_icon {
        score += 2;
    }
    if viewport.width > 0.0 && el.bbox.center_x() > viewport.width * 0.6 {
        score += 3;
    }
    if el.bbox.width < TINY_PX || el.bbox.height < TINY_PX {
        score -= 5;
    }
    let all = format!("{} {} {} {}", el.text, aria, title, ident);
    if has_keyword(&all, &AVOID_KEYWORDS) {
        score -= 10;
    }
    score
}

/// Largest usable text-entry element.
pub fn pick_input(candidates: &[ElementInfo]) -> Option<&ElementInfo> {
    candidates
        .iter()
        .filter(|el| is_usable_input(el))
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
}

/// Highest-scoring usable control with a positive score.
pub fn pick_submit<'a>(candidates: &'a [ElementInfo], viewport: &Viewport) -> Option<&'a ElementInfo> {
    candidates
        .iter()
        .filter(|el| is_usable_control(el))
        .map(|el| (submit_score(el, viewport), el))
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, el)| el)
}

/// Trailing number of an explicit indexed identifier
/// (`model-response-3`, `conversation-turn-7`).
pub fn ordinal(el: &ElementInfo) -> Option<u64> {
    [el.id.as_deref(), el.attr("data-testid")]
        .into_iter()
        .flatten()
        .find_map(|ident| {
            let (prefix, digits) = ident.rsplit_once(|c: char| c == '-' || c == '_')?;
            if prefix.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
}

/// Choose the newest response among candidates already filtered to
/// "not present before submission".
///
/// Explicit ordinals win. Otherwise take the shallowest candidates (the
/// message wrapper rather than a paragraph inside it) and, among those, the
/// last in document order.
pub fn pick_response(candidates: &[ElementInfo]) -> Option<&ElementInfo> {
    let indexed = candidates
        .iter()
        .filter_map(|el| ordinal(el).map(|n| (n, el)))
        .max_by_key(|(n, el)| (*n, el.order));
    if let Some((_, el)) = indexed {
        return Some(el);
    }
    let depth = candidates.iter().map(|el| el.depth).min()?;
    candidates
        .iter()
        .filter(|el| el.depth == depth)
        .max_by_key(|el| el.order)
}
