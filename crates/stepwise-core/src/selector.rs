//! Selector parsing and matching for locating elements in a [`Document`]
//!
//! CSS subset:
//!   button                      - tag
//!   #submit-btn                 - id
//!   button.btn.primary          - classes
//!   input[data-test="email"]    - attribute (presence or exact value)
//!   li:nth-of-type(2)           - position among same-tag siblings
//!   a:contains("Sign in")       - text content contains
//!   form > div input            - child and descendant combinators
//!   a, button                   - selector list
//!
//! XPath subset:
//!   /html/body/div[2]           - child steps with positions
//!   //input[@name='q']          - descendant steps with attribute tests
//!   //button[text()='Go']       - text tests

use crate::element::NodeId;
use crate::environment::Document;
use crate::error::{Error, Result};
use crate::locator::LocatorKind;
use std::fmt;

/// Evaluate `value` as `kind` against `doc`, returning matches in document order.
pub fn select<D: Document + ?Sized>(doc: &D, kind: LocatorKind, value: &str) -> Result<Vec<NodeId>> {
    match kind {
        LocatorKind::Css => Ok(CssSelector::parse(value)?.select(doc)),
        LocatorKind::Xpath => Ok(XPath::parse(value)?.select(doc)),
        LocatorKind::Text => {
            let wanted = value.trim();
            Ok(preorder(doc)
                .into_iter()
                .filter(|n| doc.text_content(*n).trim() == wanted)
                .collect())
        }
        LocatorKind::Semantic => Ok(select_semantic(doc, value)),
    }
}

/// All nodes in document order.
pub fn preorder<D: Document + ?Sized>(doc: &D) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack: Vec<NodeId> = doc.root().into_iter().collect();
    while let Some(node) = stack.pop() {
        out.push(node);
        let children = doc.children(node);
        stack.extend(children.into_iter().rev());
    }
    out
}

const SEMANTIC_ATTRIBUTES: [&str; 5] = ["aria-label", "placeholder", "title", "alt", "name"];

fn select_semantic<D: Document + ?Sized>(doc: &D, value: &str) -> Vec<NodeId> {
    let wanted = value.trim().to_lowercase();
    if wanted.is_empty() {
        return Vec::new();
    }
    let nodes = preorder(doc);

    let by_attribute: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|n| {
            doc.element(*n).is_some_and(|e| {
                SEMANTIC_ATTRIBUTES
                    .iter()
                    .filter_map(|a| e.attribute(a))
                    .any(|v| v.to_lowercase() == wanted)
            })
        })
        .collect();
    if !by_attribute.is_empty() {
        return by_attribute;
    }

    // Innermost elements whose text mentions the phrase
    nodes
        .iter()
        .copied()
        .filter(|n| doc.text_content(*n).to_lowercase().contains(&wanted))
        .filter(|n| {
            !doc.children(*n)
                .iter()
                .any(|c| doc.text_content(*c).to_lowercase().contains(&wanted))
        })
        .collect()
}

// ============================================================================
// CSS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CssSelector {
    pub alternatives: Vec<Complex>,
}

/// Compound selectors joined by combinators, left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct Complex {
    pub parts: Vec<(Combinator, Compound)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compound {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: Vec<AttributeTest>,
    pub nth_of_type: Option<usize>,
    pub contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeTest {
    pub name: String,
    pub value: Option<String>,
}

impl CssSelector {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::selector_invalid(s, "empty selector"));
        }
        let mut parser = CssParser { src: s, chars: s.chars().collect(), pos: 0 };
        let mut alternatives = vec![parser.complex()?];
        while parser.eat(',') {
            alternatives.push(parser.complex()?);
        }
        parser.skip_ws();
        if parser.pos < parser.chars.len() {
            return Err(parser.error(&format!("unexpected '{}'", parser.chars[parser.pos])));
        }
        Ok(Self { alternatives })
    }

    pub fn select<D: Document + ?Sized>(&self, doc: &D) -> Vec<NodeId> {
        preorder(doc)
            .into_iter()
            .filter(|n| self.matches(doc, *n))
            .collect()
    }

    pub fn matches<D: Document + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        self.alternatives.iter().any(|c| c.matches(doc, node))
    }
}

impl Complex {
    fn matches<D: Document + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        match_from(doc, &self.parts, self.parts.len() - 1, node)
    }
}

// Right-to-left match with backtracking over descendant combinators.
fn match_from<D: Document + ?Sized>(
    doc: &D,
    parts: &[(Combinator, Compound)],
    idx: usize,
    node: NodeId,
) -> bool {
    let (combinator, compound) = &parts[idx];
    if !compound.matches(doc, node) {
        return false;
    }
    if idx == 0 {
        return true;
    }
    match combinator {
        Combinator::Child => doc
            .parent(node)
            .is_some_and(|p| match_from(doc, parts, idx - 1, p)),
        Combinator::Descendant => {
            let mut current = doc.parent(node);
            while let Some(ancestor) = current {
                if match_from(doc, parts, idx - 1, ancestor) {
                    return true;
                }
                current = doc.parent(ancestor);
            }
            false
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        *self == Compound::default()
    }

    pub fn matches<D: Document + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        let Some(element) = doc.element(node) else {
            return false;
        };
        if let Some(tag) = &self.tag {
            if !element.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.attribute("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let classes = element.classes();
            if !self.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }
        for test in &self.attributes {
            match (element.attribute(&test.name), &test.value) {
                (None, _) => return false,
                (Some(actual), Some(expected)) if actual != expected => return false,
                _ => {}
            }
        }
        if let Some(k) = self.nth_of_type {
            if nth_of_type(doc, node, &element.tag) != k {
                return false;
            }
        }
        if let Some(text) = &self.contains {
            if !doc.text_content(node).contains(text.as_str()) {
                return false;
            }
        }
        true
    }
}

/// 1-based position of `node` among its parent's children sharing `tag`.
pub fn nth_of_type<D: Document + ?Sized>(doc: &D, node: NodeId, tag: &str) -> usize {
    let Some(parent) = doc.parent(node) else {
        return 1;
    };
    doc.children(parent)
        .into_iter()
        .filter(|c| doc.element(*c).is_some_and(|e| e.tag == tag))
        .position(|c| c == node)
        .map(|i| i + 1)
        .unwrap_or(1)
}

struct CssParser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl CssParser<'_> {
    fn error(&self, reason: &str) -> Error {
        Error::selector_invalid(self.src, reason)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn complex(&mut self) -> Result<Complex> {
        self.skip_ws();
        let mut parts = vec![(Combinator::Descendant, self.compound()?)];
        loop {
            let had_ws = self.skip_ws();
            match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    parts.push((Combinator::Child, self.compound()?));
                }
                Some(_) if had_ws => parts.push((Combinator::Descendant, self.compound()?)),
                Some(c) => return Err(self.error(&format!("unexpected '{}'", c))),
            }
        }
        Ok(Complex { parts })
    }

    fn compound(&mut self) -> Result<Compound> {
        let mut compound = Compound::default();
        if self.peek() == Some('*') {
            self.pos += 1;
        } else if self.peek().is_some_and(is_ident_char) {
            compound.tag = Some(self.ident()?.to_ascii_lowercase());
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.attribute()?);
                }
                Some(':') => {
                    self.pos += 1;
                    self.pseudo(&mut compound)?;
                }
                _ => break,
            }
        }
        if compound.is_empty() && self.chars.get(self.pos.wrapping_sub(1)) != Some(&'*') {
            return Err(self.error("expected a selector"));
        }
        Ok(compound)
    }

    fn ident(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                let escaped = self.chars.get(self.pos + 1).copied().ok_or_else(|| self.error("dangling escape"))?;
                out.push(escaped);
                self.pos += 2;
            } else if is_ident_char(c) {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(out)
    }

    fn quoted(&mut self) -> Result<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    let escaped = self.chars.get(self.pos + 1).copied().ok_or_else(|| self.error("dangling escape"))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn attribute(&mut self) -> Result<AttributeTest> {
        self.skip_ws();
        let name = self.ident()?;
        self.skip_ws();
        let value = if self.peek() == Some('=') {
            self.pos += 1;
            self.skip_ws();
            Some(match self.peek() {
                Some('"' | '\'') => self.quoted()?,
                _ => self.ident()?,
            })
        } else {
            None
        };
        if !self.eat(']') {
            return Err(self.error("expected ']'"));
        }
        Ok(AttributeTest { name, value })
    }

    fn pseudo(&mut self, compound: &mut Compound) -> Result<()> {
        let name = self.ident()?;
        if !self.eat('(') {
            return Err(self.error(&format!("expected '(' after :{}", name)));
        }
        self.skip_ws();
        match name.as_str() {
            "nth-of-type" => {
                let digits = self.ident()?;
                let k = digits
                    .parse::<usize>()
                    .ok()
                    .filter(|k| *k > 0)
                    .ok_or_else(|| self.error(&format!("bad :nth-of-type index '{}'", digits)))?;
                compound.nth_of_type = Some(k);
            }
            "contains" => compound.contains = Some(self.quoted()?),
            other => return Err(self.error(&format!("unsupported pseudo-class ':{}'", other))),
        }
        if !self.eat(')') {
            return Err(self.error("expected ')'"));
        }
        Ok(())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Escape an identifier so it survives [`CssSelector::parse`].
pub fn escape_ident(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if !is_ident_char(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Double-quoted CSS string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}", tag)?,
            None if self.id.is_none() && self.classes.is_empty() && self.attributes.is_empty() => {
                write!(f, "*")?
            }
            None => {}
        }
        if let Some(id) = &self.id {
            write!(f, "#{}", escape_ident(id))?;
        }
        for class in &self.classes {
            write!(f, ".{}", escape_ident(class))?;
        }
        for attr in &self.attributes {
            match &attr.value {
                Some(v) => write!(f, "[{}={}]", attr.name, quote(v))?,
                None => write!(f, "[{}]", attr.name)?,
            }
        }
        if let Some(k) = self.nth_of_type {
            write!(f, ":nth-of-type({})", k)?;
        }
        if let Some(text) = &self.contains {
            write!(f, ":contains({})", quote(text))?;
        }
        Ok(())
    }
}

impl fmt::Display for CssSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alternatives: Vec<String> = self
            .alternatives
            .iter()
            .map(|c| {
                c.parts
                    .iter()
                    .enumerate()
                    .map(|(i, (comb, compound))| match (i, comb) {
                        (0, _) => compound.to_string(),
                        (_, Combinator::Child) => format!(" > {}", compound),
                        (_, Combinator::Descendant) => format!(" {}", compound),
                    })
                    .collect::<String>()
            })
            .collect();
        write!(f, "{}", alternatives.join(", "))
    }
}

// ============================================================================
// XPath
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct XPath {
    pub steps: Vec<XStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XStep {
    pub descendant: bool,
    pub tag: Option<String>,
    pub predicates: Vec<XPredicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XPredicate {
    Position(usize),
    HasAttribute(String),
    AttributeEquals(String, String),
    TextEquals(String),
    TextContains(String),
}

impl XPath {
    pub fn parse(s: &str) -> Result<Self> {
        let src = s.trim();
        let invalid = |reason: &str| Error::selector_invalid(src, reason);
        if !src.starts_with('/') {
            return Err(invalid("expression must start with '/' or '//'"));
        }
        let mut rest = src;
        let mut steps = Vec::new();
        while !rest.is_empty() {
            let descendant = if let Some(r) = rest.strip_prefix("//") {
                rest = r;
                true
            } else if let Some(r) = rest.strip_prefix('/') {
                rest = r;
                false
            } else {
                return Err(invalid("expected '/'"));
            };
            let name_len = rest
                .find(|c: char| c == '/' || c == '[')
                .unwrap_or(rest.len());
            let name = &rest[..name_len];
            rest = &rest[name_len..];
            let tag = match name {
                "" => return Err(invalid("empty step")),
                "*" => None,
                n if n.chars().all(is_ident_char) => Some(n.to_ascii_lowercase()),
                n => return Err(invalid(&format!("unsupported step '{}'", n))),
            };
            let mut predicates = Vec::new();
            while let Some(r) = rest.strip_prefix('[') {
                let end = find_predicate_end(r).ok_or_else(|| invalid("unterminated predicate"))?;
                predicates.push(XPredicate::parse(&r[..end]).ok_or_else(|| {
                    invalid(&format!("unsupported predicate '[{}]'", &r[..end]))
                })?);
                rest = &r[end + 1..];
            }
            steps.push(XStep { descendant, tag, predicates });
        }
        Ok(Self { steps })
    }

    pub fn select<D: Document + ?Sized>(&self, doc: &D) -> Vec<NodeId> {
        // `None` stands for the document node above the root element
        let mut context: Vec<Option<NodeId>> = vec![None];
        for step in &self.steps {
            let mut next: Vec<NodeId> = Vec::new();
            for ctx in &context {
                let parents: Vec<Option<NodeId>> = if step.descendant {
                    let mut all = vec![*ctx];
                    all.extend(descendants(doc, *ctx).into_iter().map(Some));
                    all
                } else {
                    vec![*ctx]
                };
                for parent in parents {
                    next.extend(step.apply(doc, child_nodes(doc, parent)));
                }
            }
            next.sort();
            next.dedup();
            context = next.into_iter().map(Some).collect();
        }
        context.into_iter().flatten().collect()
    }
}

impl XStep {
    fn apply<D: Document + ?Sized>(&self, doc: &D, candidates: Vec<NodeId>) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = candidates
            .into_iter()
            .filter(|n| match &self.tag {
                Some(tag) => doc.element(*n).is_some_and(|e| &e.tag == tag),
                None => true,
            })
            .collect();
        for predicate in &self.predicates {
            nodes = match predicate {
                XPredicate::Position(k) => nodes.get(k - 1).copied().into_iter().collect(),
                other => nodes.into_iter().filter(|n| other.test(doc, *n)).collect(),
            };
        }
        nodes
    }
}

impl XPredicate {
    fn parse(body: &str) -> Option<Self> {
        let body = body.trim();
        if let Ok(k) = body.parse::<usize>() {
            return (k > 0).then_some(XPredicate::Position(k));
        }
        if let Some(inner) = body
            .strip_prefix("contains(text(),")
            .and_then(|r| r.strip_suffix(')'))
        {
            return unquote(inner.trim()).map(XPredicate::TextContains);
        }
        if let Some(value) = body.strip_prefix("text()") {
            let value = value.trim_start().strip_prefix('=')?;
            return unquote(value.trim()).map(XPredicate::TextEquals);
        }
        let attr = body.strip_prefix('@')?;
        match attr.split_once('=') {
            Some((name, value)) => {
                let value = unquote(value.trim())?;
                Some(XPredicate::AttributeEquals(name.trim().to_string(), value))
            }
            None => Some(XPredicate::HasAttribute(attr.trim().to_string())),
        }
    }

    fn test<D: Document + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        match self {
            XPredicate::Position(_) => true,
            XPredicate::HasAttribute(name) => doc
                .element(node)
                .is_some_and(|e| e.attribute(name).is_some()),
            XPredicate::AttributeEquals(name, value) => doc
                .element(node)
                .is_some_and(|e| e.attribute(name) == Some(value.as_str())),
            XPredicate::TextEquals(value) => doc.text_content(node).trim() == value,
            XPredicate::TextContains(value) => doc.text_content(node).contains(value.as_str()),
        }
    }
}

fn find_predicate_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn unquote(s: &str) -> Option<String> {
    let first = s.chars().next()?;
    if (first == '"' || first == '\'') && s.len() >= 2 && s.ends_with(first) {
        Some(s[1..s.len() - 1].to_string())
    } else {
        None
    }
}

fn child_nodes<D: Document + ?Sized>(doc: &D, parent: Option<NodeId>) -> Vec<NodeId> {
    match parent {
        Some(p) => doc.children(p),
        None => doc.root().into_iter().collect(),
    }
}

fn descendants<D: Document + ?Sized>(doc: &D, node: Option<NodeId>) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = child_nodes(doc, node);
    stack.reverse();
    while let Some(n) = stack.pop() {
        out.push(n);
        let mut children = doc.children(n);
        children.reverse();
        stack.extend(children);
    }
    out
}
