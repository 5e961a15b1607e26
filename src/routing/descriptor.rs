//! Service descriptors.
//!
//! The protocol schema is a JSON document listing services, their methods,
//! each method's input and output messages, its HTTP binding, and per-method
//! options. It is read once at startup.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse schema: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{method}: unknown site role {role:?}")]
    UnknownRole { method: String, role: String },

    #[error("{method}: unsupported HTTP method {verb:?}")]
    UnknownMethod { method: String, verb: String },

    #[error("{method}: unknown cache type {cache:?}")]
    UnknownCache { method: String, cache: String },

    #[error("{method}: path {path:?} must start with /")]
    BadPath { method: String, path: String },

    #[error("{pattern} is declared by both {first} and {second}")]
    DuplicatePattern {
        pattern: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSchema {
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
    pub http: HttpRule,
    #[serde(default)]
    pub options: MethodOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDescriptor {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub no_log: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpRule {
    pub method: String,
    pub path: String,
}

/// Method-level annotations. Everything is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MethodOptions {
    pub site_role: Option<String>,
    pub cache: Option<String>,
    pub cache_duration: u64,
    pub throttle: u32,
    pub multipart_request: bool,
    pub multipart_response: bool,
    pub resets_group: bool,
    pub use_tx: bool,
    pub invalidations: Vec<String>,
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            site_role: None,
            cache: None,
            cache_duration: 0,
            throttle: 0,
            multipart_request: false,
            multipart_response: false,
            resets_group: false,
            use_tx: true,
            invalidations: Vec::new(),
        }
    }
}

impl ServiceSchema {
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Every method with the name of the service declaring it.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodDescriptor)> {
        self.services
            .iter()
            .flat_map(|s| s.methods.iter().map(move |m| (s.name.as_str(), m)))
    }
}
