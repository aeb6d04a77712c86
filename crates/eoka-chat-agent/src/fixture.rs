//! Synthetic chat page for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::driver::{
    BBox, ElementInfo, Extracted, InsertMethod, InsertReport, PageDriver, Viewport,
};
use crate::Result;

/// A visible, enabled element with a plausible box and nothing else set.
pub fn el(tag: &str, handle: &str) -> ElementInfo {
    ElementInfo {
        handle: handle.into(),
        tag: tag.into(),
        bbox: BBox {
            x: 10.0,
            y: 10.0,
            width: 120.0,
            height: 40.0,
        },
        style_visible: true,
        enabled: true,
        ..ElementInfo::default()
    }
}

/// How a node's rendered length evolves across `measure` calls.
#[derive(Debug, Clone)]
pub enum Lengths {
    /// One value per call; the last one sticks.
    Fixed(Vec<usize>),
    /// Grows by this step on every call.
    Growing(usize),
}

/// What clicking the submit control does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Click,
    /// Only the pointer fallback has an effect.
    PointerOnly,
    /// Nothing happens.
    Dead,
}

/// A reply the page renders after the next effective submission.
#[derive(Debug, Clone)]
pub struct Reply {
    pub info: ElementInfo,
    pub selectors: Vec<String>,
    pub lengths: Lengths,
    pub html: String,
    pub text: String,
}

impl Reply {
    pub fn new(info: ElementInfo, selectors: &[&str], lengths: Lengths, html: &str) -> Self {
        Self {
            info,
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            lengths,
            html: html.into(),
            text: String::new(),
        }
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.into();
        self
    }
}

struct Node {
    info: ElementInfo,
    selectors: Vec<String>,
    attached: bool,
    submits: bool,
    value: String,
    lengths: Lengths,
    measured: usize,
    html: String,
    text: String,
}

struct State {
    nodes: Vec<Node>,
    url: String,
    viewport: Viewport,
    replies: VecDeque<Reply>,
    submit_mode: SubmitMode,
    submissions: usize,
    clicks: usize,
    pointer_clicks: usize,
    busy_checks: usize,
}

pub struct FakePage {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes: Vec::new(),
                url: "https://chat.example.com/c/1".into(),
                viewport: Viewport::default(),
                replies: VecDeque::new(),
                submit_mode: SubmitMode::Click,
                submissions: 0,
                clicks: 0,
                pointer_clicks: 0,
                busy_checks: 0,
            }),
            changes: watch::channel(0).0,
        }
    }

    /// A chat page with an input, a send button and no history.
    pub fn chat() -> Self {
        let page = Self::new();
        let mut input = el("textarea", "input");
        input.id = Some("prompt-textarea".into());
        input.editable = true;
        input.bbox.width = 600.0;
        input.bbox.height = 60.0;
        page.add(input, &["#prompt-textarea", "textarea"]);

        let mut send = el("button", "send");
        send.attrs.insert("aria-label".into(), "Send prompt".into());
        send.attrs.insert("data-testid".into(), "send-button".into());
        send.has_icon = true;
        page.add_submit(send, &["button[data-testid=\"send-button\"]", "button"]);
        page
    }

    fn node(&self, info: ElementInfo, selectors: &[&str], submits: bool) -> Node {
        Node {
            info,
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            attached: true,
            submits,
            value: String::new(),
            lengths: Lengths::Fixed(vec![0]),
            measured: 0,
            html: String::new(),
            text: String::new(),
        }
    }

    pub fn add(&self, info: ElementInfo, selectors: &[&str]) {
        let node = self.node(info, selectors, false);
        self.state.lock().unwrap().nodes.push(node);
        self.bump();
    }

    /// Add an element whose click submits the input.
    pub fn add_submit(&self, info: ElementInfo, selectors: &[&str]) {
        let node = self.node(info, selectors, true);
        self.state.lock().unwrap().nodes.push(node);
        self.bump();
    }

    /// Add an already-rendered response (an earlier turn).
    pub fn add_response(&self, reply: Reply) {
        self.state.lock().unwrap().nodes.push(reply_node(reply));
        self.bump();
    }

    /// Queue the reply rendered after the next effective submission.
    pub fn push_reply(&self, reply: Reply) {
        self.state.lock().unwrap().replies.push_back(reply);
    }

    pub fn set_url(&self, url: &str) {
        self.state.lock().unwrap().url = url.into();
    }

    pub fn set_submit_mode(&self, mode: SubmitMode) {
        self.state.lock().unwrap().submit_mode = mode;
    }

    /// Report a progress bar for the next `n` loading checks.
    pub fn set_busy(&self, n: usize) {
        self.state.lock().unwrap().busy_checks = n;
    }

    pub fn detach(&self, handle: &str) {
        let mut state = self.state.lock().unwrap();
        for node in state.nodes.iter_mut().filter(|n| n.info.handle == handle) {
            node.attached = false;
        }
        drop(state);
        self.bump();
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    pub fn clicks(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.clicks, state.pointer_clicks)
    }

    pub fn busy_remaining(&self) -> usize {
        self.state.lock().unwrap().busy_checks
    }

    pub fn value(&self, handle: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .find(|n| n.info.handle == handle)
            .map(|n| n.value.clone())
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v += 1);
    }

    fn press(&self, handle: &str, pointer: bool) {
        let mut state = self.state.lock().unwrap();
        if pointer {
            state.pointer_clicks += 1;
        } else {
            state.clicks += 1;
        }
        let is_submit = state
            .nodes
            .iter()
            .any(|n| n.attached && n.submits && n.info.handle == handle);
        let effective = match state.submit_mode {
            SubmitMode::Click => true,
            SubmitMode::PointerOnly => pointer,
            SubmitMode::Dead => false,
        };
        if !is_submit || !effective {
            return;
        }
        state.submissions += 1;
        for node in state.nodes.iter_mut().filter(|n| n.info.editable) {
            node.value.clear();
        }
        if let Some(reply) = state.replies.pop_front() {
            state.nodes.push(reply_node(reply));
        }
        drop(state);
        self.bump();
    }
}

fn reply_node(reply: Reply) -> Node {
    Node {
        info: reply.info,
        selectors: reply.selectors,
        attached: true,
        submits: false,
        value: String::new(),
        lengths: reply.lengths,
        measured: 0,
        html: reply.html,
        text: reply.text,
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>> {
        let mut state = self.state.lock().unwrap();
        if selector == "[role=\"progressbar\"]" && state.busy_checks > 0 {
            state.busy_checks -= 1;
            return Ok(vec![el("div", "progress")]);
        }
        Ok(state
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.attached
                    && (n.info.handle == selector || n.selectors.iter().any(|s| s == selector))
            })
            .map(|(i, n)| ElementInfo {
                order: i,
                ..n.info.clone()
            })
            .collect())
    }

    async fn viewport(&self) -> Result<Viewport> {
        Ok(self.state.lock().unwrap().viewport)
    }

    async fn insert_text(&self, handle: &str, text: &str) -> Result<InsertReport> {
        let mut state = self.state.lock().unwrap();
        let verified = match state
            .nodes
            .iter_mut()
            .find(|n| n.attached && n.info.handle == handle)
        {
            Some(node) => {
                node.value = text.into();
                true
            }
            None => false,
        };
        drop(state);
        self.bump();
        Ok(InsertReport {
            method: InsertMethod::InsertText,
            verified,
        })
    }

    async fn read_input(&self, handle: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .find(|n| n.attached && n.info.handle == handle)
            .map(|n| n.value.clone()))
    }

    async fn scroll_into_view(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    async fn click(&self, handle: &str) -> Result<()> {
        self.press(handle, false);
        Ok(())
    }

    async fn pointer_click(&self, handle: &str) -> Result<()> {
        self.press(handle, true);
        Ok(())
    }

    async fn measure(&self, handle: &str) -> Result<Option<usize>> {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state
            .nodes
            .iter_mut()
            .find(|n| n.attached && n.info.handle == handle)
        else {
            return Ok(None);
        };
        let len = match node.lengths {
            Lengths::Fixed(ref seq) => seq
                .get(node.measured)
                .or(seq.last())
                .copied()
                .unwrap_or(0),
            Lengths::Growing(step) => step * (node.measured + 1),
        };
        node.measured += 1;
        Ok(Some(len))
    }

    async fn extract(&self, handle: &str) -> Result<Extracted> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .find(|n| n.info.handle == handle)
            .map(|n| Extracted {
                html: n.html.clone(),
                text: n.text.clone(),
            })
            .unwrap_or_default())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().url.clone())
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }
}
