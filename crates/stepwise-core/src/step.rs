//! Step vocabulary
//!
//! One variant per step kind, tagged by `type` on the wire. [`Step::parse`]
//! checks a raw JSON value against the schema before deserializing, so a bad
//! document is reported by field instead of by serde's position.

use crate::error::ValidationError;
use crate::locator::{Locator, LocatorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WAIT_MS: u64 = 1000;
pub const DEFAULT_SCROLL_AMOUNT: u32 = 500;

/// Variable bag shared by extract steps and `{{name}}` placeholders.
pub type Variables = serde_json::Map<String, Value>;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

fn default_click_count() -> u32 {
    1
}

/// Fields every step carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub screenshot: bool,
}

impl StepMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            timeout: DEFAULT_TIMEOUT_MS,
            screenshot: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitUntil {
    #[default]
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "domcontentloaded", alias = "content-loaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle", alias = "network-idle")]
    NetworkIdle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub url: String,
    #[serde(default)]
    pub wait_until: WaitUntil,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub selector: Locator,
    #[serde(default)]
    pub wait_for_navigation: bool,
    #[serde(default = "default_click_count")]
    pub click_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub selector: Locator,
    pub text: String,
    #[serde(default = "default_true")]
    pub clear_first: bool,
    #[serde(default)]
    pub press_enter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitType {
    Time,
    Selector,
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitValue {
    Millis(u64),
    Locator(Locator),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub wait_type: WaitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WaitValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub direction: ScrollDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub selector: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    pub store_as: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    ElementExists,
    TextContains,
    VariableEquals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    pub condition: Condition,
    pub then_steps: Vec<String>,
    #[serde(default)]
    pub else_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    #[serde(flatten)]
    pub meta: StepMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Locator>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Goto(GotoStep),
    Click(ClickStep),
    Type(TypeStep),
    Wait(WaitStep),
    Scroll(ScrollStep),
    #[serde(alias = "scrape")]
    Extract(ExtractStep),
    #[serde(alias = "branch")]
    Conditional(ConditionalStep),
    Loop(LoopStep),
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Clone, Copy)]
enum Shape {
    Str,
    Bool,
    Millis,
    Count,
    Locator,
    StrList,
    OneOf(&'static [&'static str]),
    Object,
}

struct Field {
    name: &'static str,
    shape: Shape,
    required: bool,
}

const fn req(name: &'static str, shape: Shape) -> Field {
    Field { name, shape, required: true }
}

const fn opt(name: &'static str, shape: Shape) -> Field {
    Field { name, shape, required: false }
}

const COMMON: &[Field] = &[
    req("id", Shape::Str),
    opt("description", Shape::Str),
    opt("timeout", Shape::Millis),
    opt("screenshot", Shape::Bool),
];

const WAIT_UNTIL: &[&str] = &["load", "domcontentloaded", "networkidle", "content-loaded", "network-idle"];

const GOTO: &[Field] = &[req("url", Shape::Str), opt("waitUntil", Shape::OneOf(WAIT_UNTIL))];

const CLICK: &[Field] = &[
    req("selector", Shape::Locator),
    opt("waitForNavigation", Shape::Bool),
    opt("clickCount", Shape::Count),
];

const TYPE: &[Field] = &[
    req("selector", Shape::Locator),
    req("text", Shape::Str),
    opt("clearFirst", Shape::Bool),
    opt("pressEnter", Shape::Bool),
];

const WAIT: &[Field] = &[req("waitType", Shape::OneOf(&["time", "selector", "navigation"]))];

const SCROLL: &[Field] = &[
    req("direction", Shape::OneOf(&["up", "down", "top", "bottom"])),
    opt("amount", Shape::Count),
];

const EXTRACT: &[Field] = &[
    req("selector", Shape::Locator),
    opt("attribute", Shape::Str),
    opt("multiple", Shape::Bool),
    req("storeAs", Shape::Str),
];

const CONDITIONAL: &[Field] = &[
    req("condition", Shape::Object),
    req("thenSteps", Shape::StrList),
    opt("elseSteps", Shape::StrList),
];

const LOOP: &[Field] = &[
    opt("iterations", Shape::Count),
    opt("selector", Shape::Locator),
    req("steps", Shape::StrList),
];

fn schema(kind: &str) -> Option<&'static [Field]> {
    Some(match kind {
        "goto" => GOTO,
        "click" => CLICK,
        "type" => TYPE,
        "wait" => WAIT,
        "scroll" => SCROLL,
        "extract" | "scrape" => EXTRACT,
        "conditional" | "branch" => CONDITIONAL,
        "loop" => LOOP,
        _ => return None,
    })
}

fn check_shape(field: &str, shape: Shape, value: &Value) -> Result<(), ValidationError> {
    let bad = |reason: &str| Err(ValidationError::workflow(field, reason));
    match shape {
        Shape::Str => {
            if !value.is_string() {
                return bad("must be a string");
            }
        }
        Shape::Bool => {
            if !value.is_boolean() {
                return bad("must be a boolean");
            }
        }
        Shape::Millis => {
            if value.as_u64().is_none() {
                return bad("must be a non-negative integer (milliseconds)");
            }
        }
        Shape::Count => {
            if value.as_u64().is_none_or(|n| n == 0 || n > u32::MAX as u64) {
                return bad("must be a positive integer");
            }
        }
        Shape::StrList => {
            let ok = value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !ok {
                return bad("must be an array of strings");
            }
        }
        Shape::OneOf(allowed) => {
            if !value.as_str().is_some_and(|s| allowed.contains(&s)) {
                return bad(&format!("must be one of: {}", allowed.join(", ")));
            }
        }
        Shape::Object => {
            if !value.is_object() {
                return bad("must be an object");
            }
        }
        Shape::Locator => check_locator(field, value)?,
    }
    Ok(())
}

fn check_locator(field: &str, value: &Value) -> Result<(), ValidationError> {
    let Some(obj) = value.as_object() else {
        return Err(ValidationError::workflow(field, "must be a locator object"));
    };
    let kind = obj.get("type").and_then(Value::as_str);
    if !matches!(kind, Some("css" | "xpath" | "text" | "semantic" | "ai")) {
        return Err(ValidationError::workflow(
            format!("{}.type", field),
            "must be one of: css, xpath, text, semantic",
        ));
    }
    if !obj.get("value").and_then(Value::as_str).is_some_and(|v| !v.trim().is_empty()) {
        return Err(ValidationError::workflow(
            format!("{}.value", field),
            "must be a non-empty string",
        ));
    }
    if let Some(fallbacks) = obj.get("fallbacks") {
        check_shape(&format!("{}.fallbacks", field), Shape::StrList, fallbacks)?;
    }
    Ok(())
}

/// Absolute `scheme://host...` URL. Placeholders are allowed since they are
/// filled in at run time.
fn check_url(url: &str) -> Result<(), ValidationError> {
    let bad = || Err(ValidationError::workflow("url", "must be an absolute URL"));
    let Some((scheme, rest)) = url.split_once("://") else {
        return bad();
    };
    let scheme_ok = scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
    if !scheme_ok || rest.is_empty() || rest.starts_with('/') || url.contains(char::is_whitespace) {
        return bad();
    }
    Ok(())
}

impl Step {
    /// Validate and deserialize one step, filling defaults.
    pub fn parse(value: &Value) -> Result<Step, ValidationError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::workflow("step", "must be an object"))?;

        let kind = obj
            .get("type")
            .ok_or_else(|| ValidationError::workflow("type", "is required"))?
            .as_str()
            .ok_or_else(|| ValidationError::workflow("type", "must be a string"))?;
        let fields = schema(kind)
            .ok_or_else(|| ValidationError::workflow("type", format!("unknown step type '{}'", kind)))?;

        for field in COMMON.iter().chain(fields) {
            match obj.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(ValidationError::workflow(field.name, "is required"));
                }
                None | Some(Value::Null) => {}
                Some(v) => check_shape(field.name, field.shape, v)?,
            }
        }
        if obj["id"].as_str().is_some_and(|id| id.trim().is_empty()) {
            return Err(ValidationError::workflow("id", "must not be empty"));
        }

        let mut step: Step = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::workflow("step", e.to_string()))?;

        match &mut step {
            Step::Goto(s) => check_url(&s.url)?,
            Step::Wait(s) => match (s.wait_type, &s.value) {
                (WaitType::Time, None) => s.value = Some(WaitValue::Millis(DEFAULT_WAIT_MS)),
                (WaitType::Time, Some(WaitValue::Millis(_))) => {}
                (WaitType::Time, Some(_)) => {
                    return Err(ValidationError::workflow("value", "must be a duration in milliseconds"));
                }
                (WaitType::Selector, Some(WaitValue::Locator(_))) => {
                    check_locator("value", &obj["value"])?;
                }
                (WaitType::Selector, _) => {
                    return Err(ValidationError::workflow("value", "must be a locator for a selector wait"));
                }
                (WaitType::Navigation, _) => {}
            },
            Step::Scroll(s) => {
                if matches!(s.direction, ScrollDirection::Up | ScrollDirection::Down) && s.amount.is_none() {
                    s.amount = Some(DEFAULT_SCROLL_AMOUNT);
                }
            }
            Step::Extract(s) => {
                if s.store_as.trim().is_empty() {
                    return Err(ValidationError::workflow("storeAs", "must not be empty"));
                }
            }
            Step::Conditional(s) => {
                if s.condition.value.is_null() {
                    return Err(ValidationError::workflow("condition.value", "is required"));
                }
            }
            Step::Loop(s) => {
                if s.iterations.is_none() && s.selector.is_none() {
                    return Err(ValidationError::workflow("iterations", "or `selector` is required"));
                }
            }
            Step::Click(_) | Step::Type(_) => {}
        }
        Ok(step)
    }

    pub fn meta(&self) -> &StepMeta {
        match self {
            Step::Goto(s) => &s.meta,
            Step::Click(s) => &s.meta,
            Step::Type(s) => &s.meta,
            Step::Wait(s) => &s.meta,
            Step::Scroll(s) => &s.meta,
            Step::Extract(s) => &s.meta,
            Step::Conditional(s) => &s.meta,
            Step::Loop(s) => &s.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Goto(_) => "goto",
            Step::Click(_) => "click",
            Step::Type(_) => "type",
            Step::Wait(_) => "wait",
            Step::Scroll(_) => "scroll",
            Step::Extract(_) => "extract",
            Step::Conditional(_) => "conditional",
            Step::Loop(_) => "loop",
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.meta().timeout
    }

    /// Step ids this step owns and runs itself.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Step::Conditional(s) => s
                .then_steps
                .iter()
                .chain(&s.else_steps)
                .map(String::as_str)
                .collect(),
            Step::Loop(s) => s.steps.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Short human label for logs.
    pub fn describe(&self) -> String {
        if let Some(d) = &self.meta().description {
            return d.clone();
        }
        match self {
            Step::Goto(s) => format!("goto {}", s.url),
            Step::Click(s) => format!("click {}", s.selector.value),
            Step::Type(s) => format!("type into {}", s.selector.value),
            Step::Wait(s) => match &s.value {
                Some(WaitValue::Millis(ms)) => format!("wait {}ms", ms),
                Some(WaitValue::Locator(l)) => format!("wait for {}", l.value),
                None => "wait for navigation".to_string(),
            },
            Step::Scroll(s) => format!("scroll {:?}", s.direction).to_lowercase(),
            Step::Extract(s) => format!("extract {} into {}", s.selector.value, s.store_as),
            Step::Conditional(s) => format!("if {:?}", s.condition.kind),
            Step::Loop(s) => format!("loop over {} steps", s.steps.len()),
        }
    }

    /// Copy of the step with `{{name}}` placeholders filled from `vars`.
    pub fn render(&self, vars: &Variables) -> Step {
        let mut step = self.clone();
        match &mut step {
            Step::Goto(s) => s.url = interpolate(&s.url, vars),
            Step::Type(s) => s.text = interpolate(&s.text, vars),
            Step::Click(s) => render_locator(&mut s.selector, vars),
            Step::Extract(s) => render_locator(&mut s.selector, vars),
            Step::Wait(WaitStep { value: Some(WaitValue::Locator(l)), .. }) => render_locator(l, vars),
            _ => {}
        }
        step
    }
}

fn render_locator(locator: &mut Locator, vars: &Variables) {
    // XPath values are used verbatim
    if matches!(locator.kind, LocatorKind::Text | LocatorKind::Semantic | LocatorKind::Css) {
        locator.value = interpolate(&locator.value, vars);
    }
}

/// Replace `{{ name }}` with the variable's value. Unknown names stay as written.
pub fn interpolate(template: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        match vars.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_on_parse() {
        let step = Step::parse(&json!({
            "id": "s1", "type": "type",
            "selector": {"type": "css", "value": "#q"},
            "text": "rust"
        }))
        .unwrap();
        let Step::Type(t) = &step else { panic!("expected type step") };
        assert_eq!(t.meta.timeout, 5000);
        assert!(!t.meta.screenshot);
        assert!(t.clear_first);
        assert!(!t.press_enter);

        let goto = Step::parse(&json!({"id": "g", "type": "goto", "url": "https://x"})).unwrap();
        let Step::Goto(g) = goto else { panic!("expected goto") };
        assert_eq!(g.wait_until, WaitUntil::Load);
    }

    #[test]
    fn missing_field_is_named() {
        let err = Step::parse(&json!({"id": "g", "type": "goto"})).unwrap_err();
        assert_eq!(err.field, "url");
        let err = Step::parse(&json!({"type": "goto", "url": "https://x"})).unwrap_err();
        assert_eq!(err.field, "id");
        let err = Step::parse(&json!({"id": "c", "type": "click", "selector": {"type": "css"}})).unwrap_err();
        assert_eq!(err.field, "selector.value");
    }

    #[test]
    fn wrong_shapes_are_rejected() {
        let err = Step::parse(&json!({"id": "w", "type": "wait", "waitType": "time", "timeout": "5s"})).unwrap_err();
        assert_eq!(err.field, "timeout");
        let err = Step::parse(&json!({"id": "w", "type": "wait", "waitType": "selector", "value": 10})).unwrap_err();
        assert_eq!(err.field, "value");
        let err = Step::parse(&json!({"id": "x", "type": "hover"})).unwrap_err();
        assert_eq!(err.field, "type");
        let err = Step::parse(&json!({"id": "g", "type": "goto", "url": "not a url"})).unwrap_err();
        assert_eq!(err.field, "url");
        let err = Step::parse(&json!({"id": "l", "type": "loop", "steps": []})).unwrap_err();
        assert_eq!(err.field, "iterations");
    }

    #[test]
    fn aliases_and_kind_defaults() {
        let step = Step::parse(&json!({
            "id": "e", "type": "scrape",
            "selector": {"type": "css", "value": "li"},
            "multiple": true, "storeAs": "items"
        }))
        .unwrap();
        assert_eq!(step.kind(), "extract");

        let step = Step::parse(&json!({"id": "s", "type": "scroll", "direction": "down"})).unwrap();
        let Step::Scroll(s) = step else { panic!("expected scroll") };
        assert_eq!(s.amount, Some(DEFAULT_SCROLL_AMOUNT));

        let step = Step::parse(&json!({"id": "w", "type": "wait", "waitType": "time"})).unwrap();
        let Step::Wait(w) = step else { panic!("expected wait") };
        assert_eq!(w.value, Some(WaitValue::Millis(DEFAULT_WAIT_MS)));

        let step = Step::parse(&json!({"id": "g", "type": "goto", "url": "https://x", "waitUntil": "network-idle"})).unwrap();
        let Step::Goto(g) = step else { panic!("expected goto") };
        assert_eq!(g.wait_until, WaitUntil::NetworkIdle);
    }

    #[test]
    fn serialize_then_parse_is_stable() {
        let raw = json!({
            "id": "c1", "type": "click",
            "selector": {"type": "css", "value": "#go", "fallbacks": ["button"]},
            "clickCount": 2
        });
        let step = Step::parse(&raw).unwrap();
        let out = serde_json::to_value(&step).unwrap();
        assert_eq!(out["type"], "click");
        assert_eq!(out["timeout"], 5000);
        assert_eq!(out["waitForNavigation"], false);
        assert_eq!(Step::parse(&out).unwrap(), step);
    }

    #[test]
    fn interpolation() {
        let mut vars = Variables::new();
        vars.insert("name".into(), json!("Ada"));
        vars.insert("count".into(), json!(3));
        assert_eq!(interpolate("hi {{ name }} x{{count}}", &vars), "hi Ada x3");
        assert_eq!(interpolate("{{missing}} {{name", &vars), "{{missing}} {{name");

        let step = Step::parse(&json!({
            "id": "t", "type": "type",
            "selector": {"type": "css", "value": "#q"}, "text": "{{name}}"
        }))
        .unwrap();
        let Step::Type(t) = step.render(&vars) else { panic!("expected type") };
        assert_eq!(t.text, "Ada");
    }

    #[test]
    fn locator_placeholders_skip_xpath() {
        let mut vars = Variables::new();
        vars.insert("sku".into(), json!("A1"));
        let render = |selector: Value| {
            let step = Step::parse(&json!({"id": "c", "type": "click", "selector": selector})).unwrap();
            let Step::Click(c) = step.render(&vars) else { panic!("expected click") };
            c.selector.value
        };
        assert_eq!(render(json!({"type": "css", "value": "[data-sku='{{sku}}']"})), "[data-sku='A1']");
        assert_eq!(render(json!({"type": "text", "value": "Buy {{sku}}"})), "Buy A1");
        assert_eq!(render(json!({"type": "xpath", "value": "//a[@id='{{sku}}']"})), "//a[@id='{{sku}}']");
    }

    #[test]
    fn references_of_compound_steps() {
        let step = Step::parse(&json!({
            "id": "if", "type": "branch",
            "condition": {"type": "variable_equals", "value": {"name": "x", "value": 1}},
            "thenSteps": ["a"], "elseSteps": ["b"]
        }))
        .unwrap();
        assert_eq!(step.references(), vec!["a", "b"]);
    }
}
