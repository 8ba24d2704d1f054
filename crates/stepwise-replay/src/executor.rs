//! Step executor: runs exactly one step against a live environment
//!
//! The executor never touches run state. It returns the variables the step
//! produced, or a typed [`Error`] for the controller to apply policy to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::locator::{self, Locator};
use stepwise_core::step::{
    ClickStep, Condition, ConditionKind, ExtractStep, GotoStep, LoopStep, ScrollDirection, ScrollStep,
    TypeStep, WaitStep, WaitType, WaitValue, DEFAULT_SCROLL_AMOUNT, DEFAULT_WAIT_MS,
};
use stepwise_core::{Environment, Error, ErrorCode, NodeId, Result, ScrollPosition, Signal, Step, Variables, WaitUntil};
use tokio::time::{sleep, timeout, Instant};

/// Executor timing
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Pause after scrolling a target into view, before acting on it
    pub settle_delay: Duration,
    /// Interval between resolution attempts in selector waits
    pub poll_interval: Duration,
    /// How long a target stays highlighted
    pub highlight: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            poll_interval: Duration::from_millis(100),
            highlight: Duration::from_millis(1000),
        }
    }
}

/// What a successful step hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    /// Variables written by the step (and any steps it ran inline)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

pub struct StepExecutor<E: ?Sized> {
    env: Arc<E>,
    config: ExecutorConfig,
}

impl<E: Environment + ?Sized> StepExecutor<E> {
    pub fn new(env: Arc<E>) -> Self {
        Self::with_config(env, ExecutorConfig::default())
    }

    pub fn with_config(env: Arc<E>, config: ExecutorConfig) -> Self {
        Self { env, config }
    }

    pub fn environment(&self) -> &Arc<E> {
        &self.env
    }

    /// Execute `step`. `scope` holds the steps a conditional or loop runs
    /// inline; `variables` is the run's bag at dispatch time.
    pub async fn execute(&self, step: &Step, scope: &[Step], variables: &Variables) -> Result<StepOutput> {
        let mut bag = variables.clone();
        let mut written = Variables::new();
        self.run(step, scope, &mut bag, &mut written).await?;
        let screenshot = if step.meta().screenshot {
            self.env.screenshot()
        } else {
            None
        };
        Ok(StepOutput {
            variables: written,
            screenshot,
        })
    }

    fn run<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a [Step],
        bag: &'a mut Variables,
        written: &'a mut Variables,
    ) -> StepFuture<'a> {
        Box::pin(async move {
            let step = step.render(bag);
            tracing::debug!(step = step.id(), kind = step.kind(), "executing");
            match &step {
                Step::Goto(s) => self.goto(s).await,
                Step::Click(s) => self.click(s).await,
                Step::Type(s) => self.type_text(s).await,
                Step::Wait(s) => self.wait(s).await,
                Step::Scroll(s) => self.scroll(s).await,
                Step::Extract(s) => {
                    let value = self.extract(s)?;
                    bag.insert(s.store_as.clone(), value.clone());
                    written.insert(s.store_as.clone(), value);
                    Ok(())
                }
                Step::Conditional(s) => {
                    let taken = if self.evaluate(&s.condition, bag)? {
                        &s.then_steps
                    } else {
                        &s.else_steps
                    };
                    tracing::debug!(step = s.meta.id, branch = taken.len(), "condition evaluated");
                    for id in taken {
                        let inner = find(scope, id)?;
                        self.run(inner, scope, bag, written).await?;
                    }
                    Ok(())
                }
                Step::Loop(s) => self.run_loop(s, scope, bag, written).await,
            }
        })
    }

    async fn goto(&self, s: &GotoStep) -> Result<()> {
        match timeout(ms(s.meta.timeout), self.env.navigate(&s.url, s.wait_until)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(&format!("navigation to {}", s.url), s.meta.timeout)),
        }
    }

    /// Resolve, scroll into view, settle and highlight.
    async fn prepare(&self, target: &Locator) -> Result<NodeId> {
        let node = locator::resolve(self.env.as_ref(), target)?;
        self.env.scroll_into_view(node)?;
        sleep(self.config.settle_delay).await;
        self.env.highlight(node, self.config.highlight);
        Ok(node)
    }

    async fn click(&self, s: &ClickStep) -> Result<()> {
        let node = self.prepare(&s.selector).await?;
        let since = self.env.navigation_count();
        for _ in 0..s.click_count.max(1) {
            self.env.click(node)?;
        }
        if s.wait_for_navigation {
            self.navigation(since, s.meta.timeout).await?;
        }
        Ok(())
    }

    async fn type_text(&self, s: &TypeStep) -> Result<()> {
        let node = self.prepare(&s.selector).await?;
        if s.clear_first {
            self.env.set_value(node, "")?;
        }
        self.env.focus(node)?;
        let text = if s.clear_first {
            s.text.clone()
        } else {
            format!("{}{}", self.env.value(node).unwrap_or_default(), s.text)
        };
        self.env.set_value(node, &text)?;
        self.env.dispatch(node, Signal::Input)?;
        self.env.dispatch(node, Signal::Change)?;
        if s.press_enter {
            self.env.dispatch(node, Signal::KeyDown { key: "Enter".into() })?;
        }
        Ok(())
    }

    async fn wait(&self, s: &WaitStep) -> Result<()> {
        match (s.wait_type, &s.value) {
            (WaitType::Time, value) => {
                let millis = match value {
                    Some(WaitValue::Millis(m)) => *m,
                    _ => DEFAULT_WAIT_MS,
                };
                sleep(ms(millis)).await;
                Ok(())
            }
            (WaitType::Selector, Some(WaitValue::Locator(target))) => {
                self.poll(target, s.meta.timeout).await.map(|_| ())
            }
            (WaitType::Selector, _) => Err(Error::new(
                ErrorCode::Validation,
                "selector wait without a locator",
            )),
            (WaitType::Navigation, _) => {
                let since = self.env.navigation_count();
                self.navigation(since, s.meta.timeout).await
            }
        }
    }

    /// Wait for a navigation completed after the `since` snapshot.
    async fn navigation(&self, since: u64, timeout_ms: u64) -> Result<()> {
        let until = WaitUntil::Load;
        match timeout(ms(timeout_ms), self.env.wait_for_navigation(since, until)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("navigation", timeout_ms)),
        }
    }

    /// Resolve `target` every poll interval until it appears or the deadline passes.
    async fn poll(&self, target: &Locator, timeout_ms: u64) -> Result<NodeId> {
        let deadline = Instant::now() + ms(timeout_ms);
        loop {
            match locator::resolve(self.env.as_ref(), target) {
                Ok(node) => return Ok(node),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(&target.to_string(), timeout_ms));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    async fn scroll(&self, s: &ScrollStep) -> Result<()> {
        let amount = i64::from(s.amount.unwrap_or(DEFAULT_SCROLL_AMOUNT));
        match s.direction {
            ScrollDirection::Up => self.env.scroll_by(0, -amount),
            ScrollDirection::Down => self.env.scroll_by(0, amount),
            ScrollDirection::Top => self.env.scroll_to(ScrollPosition::Top),
            ScrollDirection::Bottom => self.env.scroll_to(ScrollPosition::Bottom),
        }
        sleep(self.config.settle_delay).await;
        Ok(())
    }

    fn extract(&self, s: &ExtractStep) -> Result<Value> {
        let nodes = if s.multiple {
            locator::resolve_all(self.env.as_ref(), &s.selector)?
        } else {
            vec![locator::resolve(self.env.as_ref(), &s.selector)?]
        };
        let mut values: Vec<String> = nodes
            .into_iter()
            .filter_map(|node| self.read(node, s.attribute.as_deref()))
            .filter(|v| !v.is_empty())
            .collect();
        tracing::debug!(store_as = %s.store_as, count = values.len(), "extracted");
        Ok(if s.multiple {
            Value::from(values)
        } else if values.is_empty() {
            Value::Null
        } else {
            Value::String(values.swap_remove(0))
        })
    }

    fn read(&self, node: NodeId, attribute: Option<&str>) -> Option<String> {
        match attribute {
            Some("value") => self.env.value(node),
            Some(name) => self.env.element(node)?.attribute(name).map(str::to_string),
            None => Some(self.env.text_content(node).trim().to_string()),
        }
    }

    fn evaluate(&self, condition: &Condition, bag: &Variables) -> Result<bool> {
        let bad = |what: &str| {
            Error::new(
                ErrorCode::Validation,
                format!("{:?} condition needs {}", condition.kind, what),
            )
        };
        match condition.kind {
            ConditionKind::ElementExists => {
                let target = condition_locator(&condition.value).ok_or_else(|| bad("a locator"))?;
                match locator::resolve(self.env.as_ref(), &target) {
                    Ok(_) => Ok(true),
                    Err(e) if e.code == ErrorCode::TargetNotFound => Ok(false),
                    Err(e) => Err(e),
                }
            }
            ConditionKind::TextContains => {
                let (scope, needle) = match &condition.value {
                    Value::String(text) => (None, text.clone()),
                    Value::Object(map) => {
                        let text = map.get("text").and_then(Value::as_str).ok_or_else(|| bad("`text`"))?;
                        (map.get("selector").and_then(condition_locator), text.to_string())
                    }
                    _ => return Err(bad("a string or {selector, text}")),
                };
                let haystack = match scope {
                    Some(target) => match locator::resolve(self.env.as_ref(), &target) {
                        Ok(node) => self.env.text_content(node),
                        Err(_) => return Ok(false),
                    },
                    None => self
                        .env
                        .root()
                        .map(|root| self.env.text_content(root))
                        .unwrap_or_default(),
                };
                Ok(haystack.contains(&needle))
            }
            ConditionKind::VariableEquals => {
                let name = condition
                    .value
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad("`name`"))?;
                let expected = condition.value.get("value").unwrap_or(&Value::Null);
                Ok(bag.get(name).unwrap_or(&Value::Null) == expected)
            }
        }
    }

    async fn run_loop(
        &self,
        s: &LoopStep,
        scope: &[Step],
        bag: &mut Variables,
        written: &mut Variables,
    ) -> Result<()> {
        let rounds = match (&s.selector, s.iterations) {
            (Some(target), limit) => {
                let found = match locator::resolve_all(self.env.as_ref(), target) {
                    Ok(nodes) => nodes.len(),
                    Err(e) if e.code == ErrorCode::TargetNotFound => 0,
                    Err(e) => return Err(e),
                };
                limit.map_or(found, |l| found.min(l as usize))
            }
            (None, Some(n)) => n as usize,
            (None, None) => 0,
        };
        tracing::debug!(step = s.meta.id, rounds, "loop");
        let body = s
            .steps
            .iter()
            .map(|id| find(scope, id))
            .collect::<Result<Vec<_>>>()?;
        for i in 0..rounds {
            bag.insert("loopIndex".into(), Value::from(i));
            for inner in &body {
                self.run(inner, scope, bag, written).await?;
            }
        }
        bag.remove("loopIndex");
        Ok(())
    }
}

fn find<'a>(scope: &'a [Step], id: &str) -> Result<&'a Step> {
    scope
        .iter()
        .find(|s| s.id() == id)
        .ok_or_else(|| Error::protocol_violation(format!("step '{}' missing from scope", id)))
}

/// A condition target: a locator object or a bare CSS string.
fn condition_locator(value: &Value) -> Option<Locator> {
    match value {
        Value::String(css) => Some(Locator::css(css.clone())),
        Value::Object(_) => serde_json::from_value(value.clone()).ok(),
        _ => None,
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
