//! Error types for the cache engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::endpoint::EndpointKind;

/// Errors returned synchronously when the engine API is misused.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No endpoint is registered under this name.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The endpoint exists but is of the other kind.
    #[error("endpoint `{name}` is a {actual}, not a {expected}")]
    WrongKind {
        name: String,
        expected: EndpointKind,
        actual: EndpointKind,
    },

    /// Endpoint names must be non-empty and must not contain `(`.
    #[error("invalid endpoint name: {0:?}")]
    InvalidEndpointName(String),

    /// An endpoint with this name is already registered.
    #[error("endpoint already defined: {0}")]
    DuplicateEndpoint(String),

    /// Arguments could not be converted to JSON.
    #[error("argument serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A patch could not be applied to the cached value.
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
}

/// Failure stored on a cache entry.
///
/// This is the one failure channel consumers see: transport errors, broken
/// endpoint definitions and panics inside user code all end up here.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum QueryError {
    /// The transport (or `query_fn`) returned an error value.
    #[error("transport error: {0}")]
    Transport(Value),

    /// The endpoint definition cannot be executed.
    #[error("invalid endpoint definition: {0}")]
    Definition(String),

    /// User code panicked while the request was running.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    /// The request was aborted before it completed.
    #[error("request aborted")]
    Aborted,

    /// No result exists for this request.
    #[error("query has no result")]
    Uninitialized,
}

/// Errors from applying a structural patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// A path segment does not exist in the target.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// The path traverses a value that cannot contain children.
    #[error("cannot index into {kind} at {path}")]
    NotAContainer { path: String, kind: &'static str },
}
