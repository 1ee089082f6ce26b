//! Resource hints carried inside job names.
//!
//! Some batch schedulers only accept per-job overrides through the job name.
//! A [`ResourceTag`] is rendered as a self-delimited segment,
//! `__rsrc` + `runtime=30;cores=4;mem=8000` + `rsrc__`, appended to the name
//! and parsed back by the scheduler-facing side with [`decode`].

mod bsub;
mod tag;

pub use tag::{contains_sentinel, decode, encode, strip, ResourceTag};

use thiserror::Error;

/// Opens an annotation segment.
pub const RESOURCES_START_TAG: &str = "__rsrc";
/// Closes an annotation segment.
pub const RESOURCES_CLOSE_TAG: &str = "rsrc__";
/// Separates `key=value` fields inside a segment.
pub const FIELD_SEPARATOR: char = ';';

pub const RUNTIME_KEY: &str = "runtime";
pub const CORES_KEY: &str = "cores";
pub const MEMORY_KEY: &str = "mem";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("name '{name}' already contains the reserved marker '{sentinel}'")]
    ReservedSentinel { name: String, sentinel: &'static str },

    #[error("resource annotation in '{name}' is not terminated by 'rsrc__'")]
    Unterminated { name: String },

    #[error("name '{name}' carries more than one resource annotation")]
    MultipleAnnotations { name: String },

    #[error("resource annotation is empty")]
    Empty,

    #[error("resource field '{field}' is not of the form <key>=<value>")]
    MalformedField { field: String },

    #[error("unknown resource key '{key}'")]
    UnknownKey { key: String },

    #[error("resource key '{key}' appears more than once")]
    DuplicateKey { key: String },

    #[error("resource '{key}' has invalid value '{value}'")]
    InvalidValue { key: String, value: String },
}
