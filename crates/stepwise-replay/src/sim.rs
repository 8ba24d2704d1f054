//! Simulated page
//!
//! A fully in-memory [`Environment`] over [`DomTree`] fixtures keyed by URL.
//! Links and form submissions navigate between fixtures, form controls hold
//! values, and every action is recorded so callers can inspect what happened.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use stepwise_core::{
    Document, DomTree, ElementInfo, Environment, Error, ErrorCode, LocatorKind, NodeId, NodeSpec,
    Result, ScrollPosition, Signal, WaitUntil,
};

const LINE_HEIGHT: i64 = 40;
const VIEWPORT_HEIGHT: i64 = 800;
const NAVIGATION_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
enum Fixture {
    Page { spec: NodeSpec, load_delay: Duration },
    Broken { reason: String },
}

#[derive(Default)]
struct PageState {
    url: Option<String>,
    dom: DomTree,
    values: HashMap<NodeId, String>,
    focus: Option<NodeId>,
    scroll: (i64, i64),
    clicks: Vec<NodeId>,
    signals: Vec<(NodeId, Signal)>,
    highlights: Vec<NodeId>,
    navigations: Vec<String>,
    navigation_count: u64,
    stopped: bool,
}

impl PageState {
    fn load(&mut self, url: &str, spec: &NodeSpec) {
        self.dom = DomTree::build(spec.clone());
        self.url = Some(url.to_string());
        self.values.clear();
        self.focus = None;
        self.scroll = (0, 0);
        self.navigations.push(url.to_string());
        self.navigation_count += 1;
    }

    fn max_scroll(&self) -> i64 {
        (self.dom.len() as i64 * LINE_HEIGHT - VIEWPORT_HEIGHT).max(0)
    }

    fn element(&self, node: NodeId) -> Result<ElementInfo> {
        self.dom
            .element(node)
            .ok_or_else(|| Error::action_failed("element lookup", "node is no longer in the document"))
    }

    /// Absolute form of `href` against the current page.
    fn absolute(&self, href: &str) -> String {
        if href.contains("://") {
            return href.to_string();
        }
        let base = self.url.as_deref().unwrap_or_default();
        let origin = base
            .find("://")
            .map(|i| match base[i + 3..].find('/') {
                Some(j) => &base[..i + 3 + j],
                None => base,
            })
            .unwrap_or(base);
        if href.starts_with('/') {
            format!("{}{}", origin, href)
        } else {
            format!("{}/{}", origin, href)
        }
    }

    /// Where activating `node` leads, if anywhere: a link's href, or the
    /// action of the form a submit control belongs to.
    fn navigation_target(&self, node: NodeId) -> Option<String> {
        let element = self.dom.element(node)?;
        if element.tag == "a" {
            return element.attribute("href").map(|h| self.absolute(h));
        }
        let submits = match element.tag.as_str() {
            "button" => element.attribute("type").is_none_or(|t| t == "submit"),
            "input" => element.attribute("type") == Some("submit"),
            _ => false,
        };
        if !submits {
            return None;
        }
        self.form_action(node)
    }

    fn form_action(&self, node: NodeId) -> Option<String> {
        let mut current = Some(node);
        while let Some(id) = current {
            let element = self.dom.element(id)?;
            if element.tag == "form" {
                return element.attribute("action").map(|a| self.absolute(a));
            }
            current = self.dom.parent(id);
        }
        None
    }
}

/// In-memory live page. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct SimulatedPage {
    state: Mutex<PageState>,
    fixtures: Mutex<HashMap<String, Fixture>>,
    fallback: Mutex<Option<NodeSpec>>,
}

impl SimulatedPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, spec: NodeSpec) -> Self {
        self.add_page(url, spec);
        self
    }

    pub fn add_page(&self, url: impl Into<String>, spec: NodeSpec) {
        self.add_slow_page(url, spec, Duration::ZERO);
    }

    /// A page whose load completes only after `load_delay`.
    pub fn add_slow_page(&self, url: impl Into<String>, spec: NodeSpec, load_delay: Duration) {
        self.fixtures
            .lock()
            .insert(url.into(), Fixture::Page { spec, load_delay });
    }

    /// A URL whose navigation always fails.
    pub fn add_broken_page(&self, url: impl Into<String>, reason: impl Into<String>) {
        self.fixtures.lock().insert(
            url.into(),
            Fixture::Broken {
                reason: reason.into(),
            },
        );
    }

    /// Served for any URL without its own fixture.
    pub fn set_fallback(&self, spec: NodeSpec) {
        *self.fallback.lock() = Some(spec);
    }

    fn fixture(&self, url: &str) -> Option<Fixture> {
        if let Some(f) = self.fixtures.lock().get(url) {
            return Some(f.clone());
        }
        self.fallback.lock().clone().map(|spec| Fixture::Page {
            spec,
            load_delay: Duration::ZERO,
        })
    }

    /// Load a page immediately, without any configured delay.
    pub fn open(&self, url: &str) -> Result<()> {
        match self.fixture(url) {
            Some(Fixture::Page { spec, .. }) => {
                self.state.lock().load(url, &spec);
                Ok(())
            }
            Some(Fixture::Broken { reason }) => Err(Error::navigation_failed(url, &reason)),
            None => Err(Error::navigation_failed(url, "no page at this address")),
        }
    }

    /// Change the current document in place, e.g. to make an element appear.
    pub fn mutate(&self, f: impl FnOnce(&mut DomTree)) {
        f(&mut self.state.lock().dom);
    }

    pub fn current_url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }

    pub fn clicks(&self) -> Vec<NodeId> {
        self.state.lock().clicks.clone()
    }

    pub fn signals(&self) -> Vec<(NodeId, Signal)> {
        self.state.lock().signals.clone()
    }

    pub fn highlights(&self) -> Vec<NodeId> {
        self.state.lock().highlights.clone()
    }

    pub fn focused(&self) -> Option<NodeId> {
        self.state.lock().focus
    }

    pub fn scroll_position(&self) -> (i64, i64) {
        self.state.lock().scroll
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().navigations.clone()
    }

    pub fn was_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    // Navigation triggered by an element; loads synchronously.
    fn follow(&self, state: &mut PageState, url: String) {
        match self.fixture(&url) {
            Some(Fixture::Page { spec, .. }) => state.load(&url, &spec),
            _ => tracing::debug!(%url, "activation leads nowhere"),
        }
    }
}

impl Document for SimulatedPage {
    fn root(&self) -> Option<NodeId> {
        self.state.lock().dom.root()
    }

    fn element(&self, node: NodeId) -> Option<ElementInfo> {
        self.state.lock().dom.element(node)
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.state.lock().dom.parent(node)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.state.lock().dom.children(node)
    }

    fn text_content(&self, node: NodeId) -> String {
        self.state.lock().dom.text_content(node)
    }

    fn query(&self, kind: LocatorKind, value: &str) -> Result<Vec<NodeId>> {
        self.state.lock().dom.query(kind, value)
    }
}

#[async_trait]
impl Environment for SimulatedPage {
    fn url(&self) -> Option<String> {
        self.current_url()
    }

    async fn navigate(&self, url: &str, until: WaitUntil) -> Result<()> {
        tracing::debug!(%url, ?until, "navigating");
        let delay = match self.fixture(url) {
            Some(Fixture::Page { load_delay, .. }) => load_delay,
            Some(Fixture::Broken { reason }) => return Err(Error::navigation_failed(url, &reason)),
            None => return Err(Error::navigation_failed(url, "no page at this address")),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.open(url)
    }

    fn navigation_count(&self) -> u64 {
        self.state.lock().navigation_count
    }

    async fn wait_for_navigation(&self, since: u64, _until: WaitUntil) -> Result<()> {
        while self.navigation_count() <= since {
            tokio::time::sleep(NAVIGATION_POLL).await;
        }
        Ok(())
    }

    fn scroll_into_view(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.element(node)?;
        let y = (node.0 as i64 * LINE_HEIGHT - VIEWPORT_HEIGHT / 2).clamp(0, state.max_scroll());
        state.scroll.1 = y;
        Ok(())
    }

    fn highlight(&self, node: NodeId, _duration: Duration) {
        self.state.lock().highlights.push(node);
    }

    fn click(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(node)?;
        if element.attribute("disabled").is_some() {
            return Err(Error::action_failed("click", "element is disabled"));
        }
        state.clicks.push(node);
        if let Some(url) = state.navigation_target(node) {
            self.follow(&mut state, url);
        }
        Ok(())
    }

    fn focus(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.element(node)?;
        state.focus = Some(node);
        Ok(())
    }

    fn value(&self, node: NodeId) -> Option<String> {
        let state = self.state.lock();
        state
            .values
            .get(&node)
            .cloned()
            .or_else(|| state.dom.element(node)?.attribute("value").map(str::to_string))
    }

    fn set_value(&self, node: NodeId, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(node)?;
        let editable = matches!(element.tag.as_str(), "input" | "textarea" | "select")
            || element.attribute("contenteditable").is_some();
        if !editable {
            return Err(Error::new(
                ErrorCode::ActionFailed,
                format!("<{}> does not accept text", element.tag),
            ));
        }
        if element.attribute("disabled").is_some() || element.attribute("readonly").is_some() {
            return Err(Error::action_failed("type", "element is not editable"));
        }
        state.values.insert(node, value.to_string());
        Ok(())
    }

    fn dispatch(&self, node: NodeId, signal: Signal) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(node)?;
        let submits = matches!(&signal, Signal::KeyDown { key } if key == "Enter") && element.tag == "input";
        state.signals.push((node, signal));
        if submits {
            if let Some(url) = state.form_action(node) {
                self.follow(&mut state, url);
            }
        }
        Ok(())
    }

    fn scroll_by(&self, dx: i64, dy: i64) {
        let mut state = self.state.lock();
        let max = state.max_scroll();
        state.scroll.0 = (state.scroll.0 + dx).max(0);
        state.scroll.1 = (state.scroll.1 + dy).clamp(0, max);
    }

    fn scroll_to(&self, position: ScrollPosition) {
        let mut state = self.state.lock();
        state.scroll.1 = match position {
            ScrollPosition::Top => 0,
            ScrollPosition::Bottom => state.max_scroll(),
        };
    }

    fn screenshot(&self) -> Option<String> {
        let state = self.state.lock();
        let url = state.url.as_deref()?;
        Some(format!("sim:{}#y={}", url, state.scroll.1))
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn shop() -> SimulatedPage {
        SimulatedPage::new()
            .with_page(
                "https://shop.test/",
                NodeSpec::new("html").child(
                    NodeSpec::new("body")
                        .child(NodeSpec::new("a").attr("id", "cart-link").attr("href", "/cart").text("Cart"))
                        .child(
                            NodeSpec::new("form").attr("action", "/search").child(
                                NodeSpec::new("input").attr("id", "q").attr("name", "q"),
                            ),
                        )
                        .child(NodeSpec::new("button").attr("id", "off").attr("disabled", "").text("Off"))
                        .child(
                            NodeSpec::new("ul")
                                .child(NodeSpec::new("li").attr("class", "item").attr("data-price", "3").text(" Apple "))
                                .child(NodeSpec::new("li").attr("class", "item").attr("data-price", "5").text("Pear"))
                                .child(NodeSpec::new("li").attr("class", "item").text("  ")),
                        ),
                ),
            )
            .with_page(
                "https://shop.test/cart",
                NodeSpec::new("html").child(NodeSpec::new("body").child(NodeSpec::new("h1").text("Your cart"))),
            )
            .with_page(
                "https://shop.test/search",
                NodeSpec::new("html").child(NodeSpec::new("body").child(NodeSpec::new("h1").text("Results"))),
            )
    }

    #[test]
    fn links_and_forms_navigate() {
        let page = shop();
        page.open("https://shop.test/").unwrap();
        let link = page.query(LocatorKind::Css, "#cart-link").unwrap()[0];
        page.click(link).unwrap();
        assert_eq!(page.current_url().as_deref(), Some("https://shop.test/cart"));

        page.open("https://shop.test/").unwrap();
        let input = page.query(LocatorKind::Css, "#q").unwrap()[0];
        page.set_value(input, "pear").unwrap();
        assert_eq!(page.value(input).as_deref(), Some("pear"));
        page.dispatch(input, Signal::KeyDown { key: "Enter".into() }).unwrap();
        assert_eq!(page.current_url().as_deref(), Some("https://shop.test/search"));
    }

    #[test]
    fn refuses_impossible_actions() {
        let page = shop();
        page.open("https://shop.test/").unwrap();
        let off = page.query(LocatorKind::Css, "#off").unwrap()[0];
        assert_eq!(page.click(off).unwrap_err().code, ErrorCode::ActionFailed);
        assert_eq!(page.set_value(off, "x").unwrap_err().code, ErrorCode::ActionFailed);
        assert!(page.open("https://elsewhere.test/").is_err());
    }

    #[test]
    fn scrolling_is_clamped() {
        let page = shop();
        page.open("https://shop.test/").unwrap();
        page.scroll_by(0, -100);
        assert_eq!(page.scroll_position(), (0, 0));
        page.scroll_to(ScrollPosition::Bottom);
        let bottom = page.scroll_position().1;
        page.scroll_by(0, 10_000);
        assert_eq!(page.scroll_position().1, bottom);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_and_broken_pages() {
        let page = shop();
        page.add_slow_page("https://slow.test/", NodeSpec::new("html"), Duration::from_secs(3));
        page.add_broken_page("https://down.test/", "connection refused");

        let started = tokio::time::Instant::now();
        page.navigate("https://slow.test/", WaitUntil::Load).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));

        let err = page.navigate("https://down.test/", WaitUntil::Load).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NavigationFailed);
    }
}
