//! stepwise-core - Step model and robust target locators for capture-and-replay
//!
//! Declarative steps in, structured JSON errors out. Everything here is
//! environment-agnostic: a live page is reached only through the
//! [`Document`] and [`Environment`] traits.
//!
//! ## Contents
//!
//! - **Step model**: [`Step`], [`Workflow`], [`Run`]
//! - **Target locator**: [`locator::generate`] and [`locator::resolve`]
//! - **In-memory document**: [`DomTree`] with a CSS/XPath subset query engine

pub mod dom;
pub mod element;
pub mod environment;
pub mod error;
pub mod locator;
pub mod run;
pub mod selector;
pub mod step;
pub mod workflow;

pub use dom::{DomTree, NodeSpec};
pub use element::{ElementInfo, NodeId};
pub use environment::{Document, Environment, ScrollPosition, Signal};
pub use error::{Error, ErrorCode, Result, ValidationError};
pub use locator::{Locator, LocatorKind};
pub use run::{LogEntry, LogLevel, Run, RunError, RunStatus};
pub use step::{Step, Variables, WaitUntil};
pub use workflow::{Settings, Workflow};

pub mod prelude {
    pub use crate::dom::{DomTree, NodeSpec};
    pub use crate::environment::{Document, Environment};
    pub use crate::error::{Error, ErrorCode, Result, ValidationError};
    pub use crate::locator::{Locator, LocatorKind};
    pub use crate::run::{LogEntry, LogLevel, Run, RunStatus};
    pub use crate::step::{Step, Variables};
    pub use crate::workflow::{Settings, Workflow};
}
