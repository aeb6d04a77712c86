//! Built-in rules. Ordered most specific first.

use super::LocatorRule;

pub(super) const INPUT_POOL: &str = "textarea, input[type=\"text\"], input[type=\"search\"], input:not([type]), [contenteditable=\"true\"], [role=\"textbox\"]";

pub(super) const SUBMIT_POOL: &str = "button, [role=\"button\"], input[type=\"submit\"], input[type=\"button\"]";

pub(super) const RESPONSE_POOL: &str = "[data-message-author-role=\"assistant\"], [data-message-id], [id^=\"model-response-\"], [id^=\"response-\"], [data-testid^=\"conversation-turn-\"], [class*=\"message\" i], [class*=\"response\" i], [class*=\"answer\" i], [data-role=\"assistant\"]";

pub(super) fn input_rules() -> Vec<LocatorRule> {
    [
        "#prompt-textarea",
        "[contenteditable=\"true\"][role=\"textbox\"]",
        "div.ProseMirror[contenteditable=\"true\"]",
        "rich-textarea [contenteditable=\"true\"]",
        "textarea[placeholder*=\"message\" i]",
        "textarea[placeholder*=\"ask\" i]",
        "textarea[name=\"prompt\"]",
        "textarea",
    ]
    .into_iter()
    .map(LocatorRule::new)
    .collect()
}

pub(super) fn submit_rules() -> Vec<LocatorRule> {
    let mut rules: Vec<LocatorRule> = [
        "button[data-testid=\"send-button\"]",
        "button[aria-label*=\"send\" i]",
        "button[aria-label*=\"submit\" i]",
        "button.send-button",
        "form button[type=\"submit\"]",
    ]
    .into_iter()
    .map(LocatorRule::new)
    .collect();
    rules.push(LocatorRule::with_text("button", "send"));
    rules
}

pub(super) fn response_rules() -> Vec<LocatorRule> {
    [
        "[data-message-author-role=\"assistant\"]",
        "[id^=\"model-response-\"]",
        "model-response",
        "[data-testid^=\"conversation-turn-\"] .markdown",
        ".font-claude-message",
        "[data-is-streaming]",
    ]
    .into_iter()
    .map(LocatorRule::new)
    .collect()
}

pub(super) fn loading_selectors() -> Vec<String> {
    [
        "[role=\"progressbar\"]",
        "progress",
        "[aria-busy=\"true\"]",
        "[class*=\"spinner\" i]",
        "[class*=\"loading\" i]",
        "[data-loading=\"true\"]",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
