//! Workflow documents: an ordered list of steps plus run settings

use crate::error::ValidationError;
use crate::step::{Step, Variables};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Pause after every successful step until the operator approves the next one.
    #[serde(default = "default_true")]
    pub supervised_mode: bool,
    #[serde(default = "default_true")]
    pub pause_on_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub screenshot_on_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            supervised_mode: true,
            pause_on_error: true,
            max_retries: default_max_retries(),
            screenshot_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            tags: Vec::new(),
            steps,
            variables: Variables::new(),
            settings: Settings::default(),
            created_at: Some(Utc::now()),
            updated_at: None,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| ValidationError::workflow("document", e.to_string()))?;
        Self::parse(&value)
    }

    /// Validate a raw document and build the workflow, filling defaults.
    /// A missing `id` gets a fresh one.
    pub fn parse(value: &Value) -> Result<Self, ValidationError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ValidationError::workflow("document", "must be an object"))?;

        let id = match obj.get("id") {
            None | Some(Value::Null) => uuid::Uuid::new_v4().to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => return Err(ValidationError::workflow("id", "must be a non-empty string")),
        };

        let name = match obj.get("name") {
            None | Some(Value::Null) => return Err(ValidationError::workflow("name", "is required")),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => return Err(ValidationError::workflow("name", "must not be empty")),
            Some(_) => return Err(ValidationError::workflow("name", "must be a string")),
        };

        let description = match obj.get("description") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(ValidationError::workflow("description", "must be a string")),
        };

        let tags = match obj.get("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                .map_err(|_| ValidationError::workflow("tags", "must be an array of strings"))?,
        };

        let variables = match obj.get("variables") {
            None | Some(Value::Null) => Variables::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(ValidationError::workflow("variables", "must be an object")),
        };

        let settings = match obj.get("settings") {
            None | Some(Value::Null) => Settings::default(),
            Some(v @ Value::Object(map)) => {
                for (field, ok) in [
                    ("supervisedMode", map.get("supervisedMode").is_none_or(Value::is_boolean)),
                    ("pauseOnError", map.get("pauseOnError").is_none_or(Value::is_boolean)),
                    ("screenshotOnError", map.get("screenshotOnError").is_none_or(Value::is_boolean)),
                    ("maxRetries", map.get("maxRetries").is_none_or(|n| n.as_u64().is_some())),
                ] {
                    if !ok {
                        return Err(ValidationError::workflow(
                            format!("settings.{}", field),
                            "has the wrong type",
                        ));
                    }
                }
                serde_json::from_value(v.clone())
                    .map_err(|e| ValidationError::workflow("settings", e.to_string()))?
            }
            Some(_) => return Err(ValidationError::workflow("settings", "must be an object")),
        };

        let created_at = timestamp(obj, "createdAt")?;
        let updated_at = timestamp(obj, "updatedAt")?;

        let raw_steps = obj
            .get("steps")
            .ok_or_else(|| ValidationError::workflow("steps", "is required"))?
            .as_array()
            .ok_or_else(|| ValidationError::workflow("steps", "must be an array"))?;
        let steps = raw_steps
            .iter()
            .enumerate()
            .map(|(i, raw)| Step::parse(raw).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()?;

        let workflow = Self {
            id,
            name,
            description,
            tags,
            steps,
            variables,
            settings,
            created_at,
            updated_at,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// Cross-step invariants: unique ids, references that exist, are not the
    /// referencing step itself, and never form a cycle.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index_of.insert(step.id(), i).is_some() {
                return Err(ValidationError::step(
                    i,
                    "id",
                    format!("duplicates step id '{}'", step.id()),
                ));
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            let field = match step {
                Step::Loop(_) => "steps",
                _ => "thenSteps",
            };
            for reference in step.references() {
                if reference == step.id() {
                    return Err(ValidationError::step(i, field, "must not reference the step itself"));
                }
                if !index_of.contains_key(reference) {
                    return Err(ValidationError::step(
                        i,
                        field,
                        format!("references unknown step '{}'", reference),
                    ));
                }
            }
        }

        // Depth-first walk over the reference graph; grey nodes are on the stack
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }
        let mut marks = vec![Mark::White; self.steps.len()];
        for start in 0..self.steps.len() {
            if marks[start] != Mark::White {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Grey;
            while let Some((node, edge)) = stack.last().copied() {
                let refs = self.steps[node].references();
                if edge == refs.len() {
                    marks[node] = Mark::Black;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = index_of[refs[edge]];
                match marks[next] {
                    Mark::Grey => {
                        return Err(ValidationError::step(
                            start,
                            "steps",
                            format!("reference cycle through step '{}'", self.steps[next].id()),
                        ));
                    }
                    Mark::White => {
                        marks[next] = Mark::Grey;
                        stack.push((next, 0));
                    }
                    Mark::Black => {}
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    /// Replace the step with the same id in place. Returns the old step.
    pub fn replace_step(&mut self, step: Step) -> Result<Step, ValidationError> {
        let index = self
            .steps
            .iter()
            .position(|s| s.id() == step.id())
            .ok_or_else(|| ValidationError::workflow("id", format!("no step with id '{}'", step.id())))?;
        let old = std::mem::replace(&mut self.steps[index], step);
        if let Err(e) = self.validate() {
            self.steps[index] = old;
            return Err(e);
        }
        self.updated_at = Some(Utc::now());
        Ok(old)
    }

    /// Ids of steps run by a conditional or loop rather than by the main sequence.
    pub fn owned_ids(&self) -> HashSet<&str> {
        self.steps.iter().flat_map(|s| s.references()).collect()
    }

    /// Every step reachable through the references of `steps[index]`, in
    /// workflow order. Shipped with the step so it can run its body inline.
    pub fn scope(&self, index: usize) -> Vec<Step> {
        let Some(root) = self.steps.get(index) else {
            return Vec::new();
        };
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = root.references();
        while let Some(id) = pending.pop() {
            if seen.insert(id) {
                if let Some(step) = self.step(id) {
                    pending.extend(step.references());
                }
            }
        }
        self.steps
            .iter()
            .filter(|s| seen.contains(s.id()))
            .cloned()
            .collect()
    }
}

fn timestamp(
    obj: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ValidationError::workflow(field, "must be an RFC 3339 timestamp")),
        Some(_) => Err(ValidationError::workflow(field, "must be a string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(steps: Value) -> Value {
        json!({ "id": "wf-1", "name": "Search", "steps": steps })
    }

    #[test]
    fn parse_fills_workflow_defaults() {
        let wf = Workflow::parse(&doc(json!([
            {"id": "a", "type": "goto", "url": "https://example.com"}
        ])))
        .unwrap();
        assert_eq!(wf.settings, Settings::default());
        assert!(wf.settings.supervised_mode);
        assert_eq!(wf.settings.max_retries, 3);
        assert!(wf.tags.is_empty());
        assert!(wf.variables.is_empty());
    }

    #[test]
    fn bad_step_reports_its_index() {
        let err = Workflow::parse(&doc(json!([
            {"id": "a", "type": "goto", "url": "https://example.com"},
            {"id": "b", "type": "click"}
        ])))
        .unwrap_err();
        assert_eq!(err.step_index, Some(1));
        assert_eq!(err.field, "selector");
    }

    #[test]
    fn workflow_level_fields_are_checked() {
        let err = Workflow::parse(&json!({"name": "", "steps": []})).unwrap_err();
        assert_eq!(err.field, "name");
        let err = Workflow::parse(&json!({"name": "x"})).unwrap_err();
        assert_eq!(err.field, "steps");
        let err = Workflow::parse(&json!({"name": "x", "steps": [], "settings": {"maxRetries": "3"}})).unwrap_err();
        assert_eq!(err.field, "settings.maxRetries");
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = Workflow::parse(&doc(json!([
            {"id": "a", "type": "wait", "waitType": "time", "value": 1},
            {"id": "a", "type": "wait", "waitType": "time", "value": 1}
        ])))
        .unwrap_err();
        assert_eq!(err.step_index, Some(1));
        assert_eq!(err.field, "id");
    }

    #[test]
    fn references_must_exist_and_not_loop() {
        let dangling = doc(json!([
            {"id": "l", "type": "loop", "iterations": 2, "steps": ["nope"]}
        ]));
        assert_eq!(Workflow::parse(&dangling).unwrap_err().field, "steps");

        let own = doc(json!([
            {"id": "l", "type": "loop", "iterations": 2, "steps": ["l"]}
        ]));
        assert!(Workflow::parse(&own).unwrap_err().reason.contains("itself"));

        let cycle = doc(json!([
            {"id": "l1", "type": "loop", "iterations": 1, "steps": ["l2"]},
            {"id": "l2", "type": "loop", "iterations": 1, "steps": ["l1"]}
        ]));
        assert!(Workflow::parse(&cycle).unwrap_err().reason.contains("cycle"));
    }

    #[test]
    fn scope_and_owned_ids() {
        let wf = Workflow::parse(&doc(json!([
            {"id": "if", "type": "branch",
             "condition": {"type": "element_exists", "value": "#promo"},
             "thenSteps": ["close"], "elseSteps": []},
            {"id": "close", "type": "click", "selector": {"type": "css", "value": "#promo .x"}},
            {"id": "after", "type": "scroll", "direction": "bottom"}
        ])))
        .unwrap();
        assert_eq!(wf.owned_ids(), HashSet::from(["close"]));
        let scope = wf.scope(0);
        assert_eq!(scope.len(), 1);
        assert_eq!(scope[0].id(), "close");
        assert!(wf.scope(2).is_empty());
    }

    #[test]
    fn round_trip_is_structurally_stable() {
        let wf = Workflow::parse(&json!({
            "id": "wf", "name": "n", "tags": ["t"],
            "variables": {"q": "rust"},
            "settings": {"supervisedMode": false},
            "createdAt": "2024-01-02T03:04:05Z",
            "steps": [
                {"id": "a", "type": "goto", "url": "https://example.com/?q={{q}}"},
                {"id": "b", "type": "extract", "selector": {"type": "css", "value": "h1"}, "storeAs": "title"}
            ]
        }))
        .unwrap();
        let once = serde_json::to_value(&wf).unwrap();
        let again = Workflow::parse(&once).unwrap();
        assert_eq!(again, wf);
        assert_eq!(serde_json::to_value(&again).unwrap(), once);
    }

    #[test]
    fn replace_step_keeps_position_and_invariants() {
        let mut wf = Workflow::parse(&doc(json!([
            {"id": "a", "type": "scroll", "direction": "top"},
            {"id": "b", "type": "scroll", "direction": "top"}
        ])))
        .unwrap();
        let new = Step::parse(&json!({"id": "a", "type": "scroll", "direction": "bottom"})).unwrap();
        wf.replace_step(new.clone()).unwrap();
        assert_eq!(wf.steps[0], new);

        let looping = Step::parse(&json!({"id": "b", "type": "loop", "iterations": 1, "steps": ["b"]})).unwrap();
        assert!(wf.replace_step(looping).is_err());
        assert_eq!(wf.steps[1].kind(), "scroll");

        let unknown = Step::parse(&json!({"id": "z", "type": "scroll", "direction": "top"})).unwrap();
        assert!(wf.replace_step(unknown).is_err());
    }
}
