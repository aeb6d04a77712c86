//! [`PageDriver`] for a live browser tab, implemented with injected JavaScript.
//!
//! Queried elements are stamped with a `data-eoka-ref` attribute so later
//! calls can address exactly the same node. A stamp dies with its node,
//! which is how detachment shows up (`measure` returns `None`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eoka::Page;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::driver::{ElementInfo, Extracted, InsertReport, PageDriver, Viewport};
use crate::Result;

const QUERY_JS: &str = r#"
((selector) => {
    let nodes;
    try { nodes = [...document.querySelectorAll(selector)]; } catch (e) { return []; }
    window.__eokaChatRef = window.__eokaChatRef || 0;
    const keep = ['aria-label', 'title', 'type', 'role', 'data-testid', 'placeholder', 'name'];
    const textTypes = ['', 'text', 'search', 'email', 'url'];
    const depthOf = el => { let d = 0; for (let n = el; n.parentElement; n = n.parentElement) d++; return d; };
    return nodes.map((el, i) => {
        if (!el.hasAttribute('data-eoka-ref')) el.setAttribute('data-eoka-ref', String(++window.__eokaChatRef));
        const r = el.getBoundingClientRect();
        const s = getComputedStyle(el);
        const attrs = {};
        for (const a of keep) { const v = el.getAttribute(a); if (v !== null) attrs[a] = v; }
        const tag = el.tagName.toLowerCase();
        const text = (el.innerText || el.value || '').trim();
        const textual = tag === 'textarea' || (tag === 'input' && textTypes.includes((el.getAttribute('type') || '').toLowerCase()));
        return {
            handle: `[data-eoka-ref="${el.getAttribute('data-eoka-ref')}"]`,
            tag,
            id: el.id || null,
            class: typeof el.className === 'string' ? el.className : (el.getAttribute('class') || ''),
            attrs,
            text: text.slice(0, 200),
            text_len: text.length,
            bbox: { x: r.x, y: r.y, width: r.width, height: r.height },
            style_visible: s.display !== 'none' && s.visibility !== 'hidden' && parseFloat(s.opacity || '1') > 0,
            enabled: !el.disabled && el.getAttribute('aria-disabled') !== 'true',
            editable: (el.isContentEditable || textual) && !el.readOnly,
            in_form: !!el.closest('form'),
            has_icon: !!el.querySelector('svg, img, i, [class*="icon" i]'),
            depth: depthOf(el),
            order: i,
        };
    });
})
"#;

const INSERT_JS: &str = r#"
((handle, text) => {
    const el = document.querySelector(handle);
    if (!el) return { method: 'value-assign', verified: false };
    const read = () => el.isContentEditable ? (el.innerText || '') : (el.value || '');
    const probe = text.trim().slice(0, 20);
    el.focus();
    let method = 'insert-text';
    let ok = false;
    try {
        document.execCommand('selectAll', false, null);
        document.execCommand('delete', false, null);
        ok = document.execCommand('insertText', false, text);
    } catch (e) { ok = false; }
    if (!ok || !read().includes(probe)) {
        method = 'value-assign';
        if (el.isContentEditable) {
            el.textContent = text;
        } else {
            const proto = el.tagName === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
            const setter = Object.getOwnPropertyDescriptor(proto, 'value')?.set;
            if (setter) setter.call(el, text); else el.value = text;
        }
        el.dispatchEvent(new InputEvent('input', { bubbles: true, data: text, inputType: 'insertText' }));
        el.dispatchEvent(new Event('change', { bubbles: true }));
    }
    return { method, verified: read().includes(probe) };
})
"#;

const READ_INPUT_JS: &str = r#"
((handle) => {
    const el = document.querySelector(handle);
    if (!el) return null;
    return el.isContentEditable ? (el.innerText || '') : (el.value || '');
})
"#;

const SCROLL_JS: &str = r#"
((handle) => {
    const el = document.querySelector(handle);
    if (el) el.scrollIntoView({ block: 'center', inline: 'center' });
    return !!el;
})
"#;

const CLICK_JS: &str = r#"
((handle) => {
    const el = document.querySelector(handle);
    if (!el) return false;
    el.click();
    return true;
})
"#;

const MEASURE_JS: &str = r#"
((handle) => {
    const el = document.querySelector(handle);
    if (!el || !el.isConnected) return null;
    return (el.innerText || el.textContent || '').trim().length;
})
"#;

const EXTRACT_JS: &str = r#"
((handle) => {
    const el = document.querySelector(handle);
    if (!el) return { html: '', text: '' };
    const clone = el.cloneNode(true);
    clone.querySelectorAll([
        'button', 'nav', 'svg', 'style', 'script', 'form', 'textarea', '[role="button"]',
        '[class*="copy" i]', '[class*="share" i]', '[class*="toolbar" i]',
        '[aria-label*="copy" i]', '[aria-label*="share" i]', '[data-testid*="action" i]'
    ].join(',')).forEach(n => n.remove());
    return { html: clone.innerHTML.trim(), text: (clone.textContent || '').trim() };
})
"#;

const VIEWPORT_JS: &str = "({ width: window.innerWidth, height: window.innerHeight })";

/// Installs the mutation counter on first call (and again after navigation).
const MUTATIONS_JS: &str = r#"
(() => {
    if (!window.__eokaChatObserver) {
        window.__eokaChatMutations = 0;
        window.__eokaChatObserver = new MutationObserver(() => { window.__eokaChatMutations++; });
        window.__eokaChatObserver.observe(document.documentElement, { childList: true, subtree: true, characterData: true });
    }
    return window.__eokaChatMutations;
})()
"#;

fn call(js: &str, args: &[&str]) -> String {
    let args: Vec<String> = args.iter().map(|a| Value::from(*a).to_string()).collect();
    format!("{}({})", js, args.join(","))
}

/// Browser-backed driver.
pub struct EokaDriver {
    page: Arc<Page>,
    changes: Option<Arc<watch::Sender<u64>>>,
    _feed: Option<DropGuard>,
}

impl EokaDriver {
    pub fn new(page: Arc<Page>) -> Self {
        Self {
            page,
            changes: None,
            _feed: None,
        }
    }

    /// Watch the document for mutations, sampling the counter every `interval`.
    /// The sampler stops when the driver is dropped. Needs a tokio runtime.
    pub fn with_change_feed(mut self, interval: Duration) -> Self {
        let tx = Arc::new(watch::channel(0u64).0);
        let feed = tx.clone();
        let cancel = CancellationToken::new();
        let page = self.page.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut last = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match page.evaluate::<u64>(MUTATIONS_JS).await {
                    Ok(count) if last != Some(count) => {
                        last = Some(count);
                        feed.send_modify(|v| *v += 1);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("mutation feed: {}", e),
                }
            }
        });
        self.changes = Some(tx);
        self._feed = Some(cancel.drop_guard());
        self
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

#[async_trait]
impl PageDriver for EokaDriver {
    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>> {
        Ok(self.page.evaluate(&call(QUERY_JS, &[selector])).await?)
    }

    async fn viewport(&self) -> Result<Viewport> {
        Ok(self.page.evaluate(VIEWPORT_JS).await?)
    }

    async fn insert_text(&self, handle: &str, text: &str) -> Result<InsertReport> {
        Ok(self.page.evaluate(&call(INSERT_JS, &[handle, text])).await?)
    }

    async fn read_input(&self, handle: &str) -> Result<Option<String>> {
        Ok(self.page.evaluate(&call(READ_INPUT_JS, &[handle])).await?)
    }

    async fn scroll_into_view(&self, handle: &str) -> Result<()> {
        let found: bool = self.page.evaluate(&call(SCROLL_JS, &[handle])).await?;
        if !found {
            return Err(eoka::Error::ElementNotFound(handle.into()).into());
        }
        Ok(())
    }

    async fn click(&self, handle: &str) -> Result<()> {
        let found: bool = self.page.evaluate(&call(CLICK_JS, &[handle])).await?;
        if !found {
            return Err(eoka::Error::ElementNotFound(handle.into()).into());
        }
        Ok(())
    }

    async fn pointer_click(&self, handle: &str) -> Result<()> {
        Ok(self.page.click(handle).await?)
    }

    async fn measure(&self, handle: &str) -> Result<Option<usize>> {
        Ok(self.page.evaluate(&call(MEASURE_JS, &[handle])).await?)
    }

    async fn extract(&self, handle: &str) -> Result<Extracted> {
        Ok(self.page.evaluate(&call(EXTRACT_JS, &[handle])).await?)
    }

    async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?)
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        self.changes.as_ref().map(|tx| tx.subscribe())
    }
}
