//! Locator strategy set. Finds the input box, the submit control and the
//! response container.
//!
//! Each target kind has an ordered list of declarative [`LocatorRule`]s and a
//! broad candidate pool. Rules are tried in order; the first one that yields a
//! usable element wins. Only when no rule matches is the pool scored by the
//! heuristics in [`scoring`].
//!
//! The whole set is plain data: it deserializes from YAML so a page redesign
//! means editing config, not code.

mod defaults;
pub mod scoring;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{ElementInfo, PageDriver};
use crate::wait::{self, WaitOptions, WaitOutcome};
use crate::{AgentError, Result};

/// What a locator is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Input,
    Submit,
    Response,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Input => f.write_str("input"),
            ElementKind::Submit => f.write_str("submit"),
            ElementKind::Response => f.write_str("response"),
        }
    }
}

/// A selector plus an optional case-insensitive substring the element's
/// text, aria-label or title must contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorRule {
    pub selector: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl LocatorRule {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            text: None,
        }
    }

    pub fn with_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            text: Some(text.into()),
        }
    }

    /// Whether `el` satisfies the text predicate (always true without one).
    pub fn accepts(&self, el: &ElementInfo) -> bool {
        let Some(ref needle) = self.text else {
            return true;
        };
        let needle = needle.to_lowercase();
        [
            Some(el.text.as_str()),
            el.attr("aria-label"),
            el.attr("title"),
        ]
        .into_iter()
        .flatten()
        .any(|s| s.to_lowercase().contains(&needle))
    }
}

impl fmt::Display for LocatorRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text {
            Some(ref t) => write!(f, "{} ~ \"{}\"", self.selector, t),
            None => f.write_str(&self.selector),
        }
    }
}

/// Ordered rules and fallback pools for every target kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorStrategy {
    pub input: Vec<LocatorRule>,
    pub submit: Vec<LocatorRule>,
    pub response: Vec<LocatorRule>,
    /// Generic busy markers checked while settling.
    pub loading: Vec<String>,
    /// Fallback candidate pools, scored when no rule matches.
    pub input_pool: String,
    pub submit_pool: String,
    pub response_pool: String,
}

impl Default for LocatorStrategy {
    fn default() -> Self {
        Self {
            input: defaults::input_rules(),
            submit: defaults::submit_rules(),
            response: defaults::response_rules(),
            loading: defaults::loading_selectors(),
            input_pool: defaults::INPUT_POOL.into(),
            submit_pool: defaults::SUBMIT_POOL.into(),
            response_pool: defaults::RESPONSE_POOL.into(),
        }
    }
}

impl LocatorStrategy {
    pub fn rules(&self, kind: ElementKind) -> &[LocatorRule] {
        match kind {
            ElementKind::Input => &self.input,
            ElementKind::Submit => &self.submit,
            ElementKind::Response => &self.response,
        }
    }

    pub fn pool(&self, kind: ElementKind) -> &str {
        match kind {
            ElementKind::Input => &self.input_pool,
            ElementKind::Submit => &self.submit_pool,
            ElementKind::Response => &self.response_pool,
        }
    }

    /// Put `extra` rules ahead of the current ones for the same kind.
    pub fn prepend(&mut self, kind: ElementKind, extra: Vec<LocatorRule>) {
        let rules = match kind {
            ElementKind::Input => &mut self.input,
            ElementKind::Submit => &mut self.submit,
            ElementKind::Response => &mut self.response,
        };
        let mut merged = extra;
        merged.append(rules);
        *rules = merged;
    }
}

/// Resolves target kinds against a live page.
pub struct Locator<'a, D: ?Sized> {
    driver: &'a D,
    strategy: &'a LocatorStrategy,
}

impl<'a, D: PageDriver + ?Sized> Locator<'a, D> {
    pub fn new(driver: &'a D, strategy: &'a LocatorStrategy) -> Self {
        Self { driver, strategy }
    }

    /// One pass for the text input. `None` if nothing usable is on the page.
    pub async fn find_input(&self) -> Result<Option<ElementInfo>> {
        for rule in &self.strategy.input {
            let found = self.driver.query(&rule.selector).await?;
            if let Some(el) = found
                .into_iter()
                .find(|el| rule.accepts(el) && scoring::is_usable_input(el))
            {
                debug!("input matched rule {}", rule);
                return Ok(Some(el));
            }
        }
        let pool = self.driver.query(&self.strategy.input_pool).await?;
        let picked = scoring::pick_input(&pool).cloned();
        if let Some(ref el) = picked {
            debug!("input picked by fallback: {}", el.handle);
        }
        Ok(picked)
    }

    /// One pass for the submit control.
    pub async fn find_submit(&self) -> Result<Option<ElementInfo>> {
        let viewport = self.driver.viewport().await?;
        for rule in &self.strategy.submit {
            let found = self.driver.query(&rule.selector).await?;
            if let Some(el) = found.into_iter().find(|el| {
                rule.accepts(el)
                    && scoring::is_usable_control(el)
                    && scoring::submit_score(el, &viewport) > 0
            }) {
                debug!("submit matched rule {}", rule);
                return Ok(Some(el));
            }
        }
        let pool = self.driver.query(&self.strategy.submit_pool).await?;
        let picked = scoring::pick_submit(&pool, &viewport).cloned();
        if let Some(ref el) = picked {
            debug!("submit picked by fallback: {}", el.handle);
        }
        Ok(picked)
    }

    /// Handles of every response container currently on the page.
    /// Taken right before submission to tell old replies from the new one.
    pub async fn response_snapshot(&self) -> Result<HashSet<String>> {
        let mut seen = HashSet::new();
        for rule in &self.strategy.response {
            for el in self.driver.query(&rule.selector).await? {
                seen.insert(el.handle);
            }
        }
        for el in self.driver.query(&self.strategy.response_pool).await? {
            seen.insert(el.handle);
        }
        Ok(seen)
    }

    /// One pass for a response container that was not in `before`.
    pub async fn find_new_response(&self, before: &HashSet<String>) -> Result<Option<ElementInfo>> {
        for rule in &self.strategy.response {
            let fresh: Vec<ElementInfo> = self
                .driver
                .query(&rule.selector)
                .await?
                .into_iter()
                .filter(|el| !before.contains(&el.handle) && rule.accepts(el))
                .collect();
            if let Some(el) = scoring::pick_response(&fresh) {
                debug!("response matched rule {}: {}", rule, el.handle);
                return Ok(Some(el.clone()));
            }
        }
        let fresh: Vec<ElementInfo> = self
            .driver
            .query(&self.strategy.response_pool)
            .await?
            .into_iter()
            .filter(|el| !before.contains(&el.handle) && scoring::is_visible(el, true))
            .collect();
        Ok(scoring::pick_response(&fresh).cloned())
    }

    /// Whether any loading indicator is visible right now.
    pub async fn is_loading(&self) -> Result<bool> {
        for selector in &self.strategy.loading {
            let found = self.driver.query(selector).await?;
            if found.iter().any(|el| scoring::is_visible(el, false)) {
                debug!("loading indicator present: {}", selector);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Poll for `kind` until found or `timeout` elapses.
    pub async fn locate(
        &self,
        kind: ElementKind,
        timeout: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<ElementInfo> {
        let outcome = wait::wait_until(
            WaitOptions::new(poll, timeout),
            self.driver.changes(),
            cancel,
            |_| async move {
                match kind {
                    ElementKind::Input => self.find_input().await,
                    ElementKind::Submit => self.find_submit().await,
                    ElementKind::Response => self.find_new_response(&HashSet::new()).await,
                }
            },
        )
        .await?;
        match outcome {
            WaitOutcome::Ready(el) => Ok(el),
            WaitOutcome::TimedOut { .. } => Err(AgentError::ElementNotFound(kind)),
            WaitOutcome::Cancelled => Err(AgentError::Aborted),
        }
    }
}
