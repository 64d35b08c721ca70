//! Domain types shared by every checker component.

pub mod error;

pub use error::{CheckerError, Result, TemplateError};
