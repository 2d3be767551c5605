//! Structural patches over JSON values.
//!
//! `diff` produces a forward patch list and an inverse list such that applying
//! the inverse after the forward list restores the original value. Values that
//! are not objects or arrays are replaced wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::engine::Engine;
use crate::error::PatchError;
use crate::key::CacheKey;

/// One step of a path into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(k: &str) -> Self {
        Self::Key(k.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Insert into an array at an index, or set an object key.
    Add { path: Vec<PathSegment>, value: Value },
    /// Remove an array element or object key.
    Remove { path: Vec<PathSegment> },
    /// Overwrite the value at a path (the root when the path is empty).
    Replace { path: Vec<PathSegment>, value: Value },
}

impl Patch {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }

    /// Replace the whole value.
    pub fn replace_root(value: Value) -> Self {
        Self::Replace {
            path: Vec::new(),
            value,
        }
    }
}

/// Whether a value can be diffed structurally.
pub fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

/// Compute `(patches, inverse_patches)` turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> (Vec<Patch>, Vec<Patch>) {
    let mut forward = Vec::new();
    let mut inverse = Vec::new();

    if is_structured(before) && is_structured(after) {
        let mut path = Vec::new();
        diff_into(&mut path, before, after, &mut forward, &mut inverse);
    } else if before != after {
        forward.push(Patch::replace_root(after.clone()));
        inverse.push(Patch::replace_root(before.clone()));
    }

    inverse.reverse();
    (forward, inverse)
}

fn child(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut p = path.to_vec();
    p.push(segment);
    p
}

fn diff_into(
    path: &mut Vec<PathSegment>,
    before: &Value,
    after: &Value,
    forward: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, va) in a {
                match b.get(k) {
                    Some(vb) => {
                        path.push(PathSegment::Key(k.clone()));
                        diff_into(path, va, vb, forward, inverse);
                        path.pop();
                    }
                    None => {
                        let p = child(path, PathSegment::Key(k.clone()));
                        forward.push(Patch::Remove { path: p.clone() });
                        inverse.push(Patch::Add {
                            path: p,
                            value: va.clone(),
                        });
                    }
                }
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    let p = child(path, PathSegment::Key(k.clone()));
                    forward.push(Patch::Add {
                        path: p.clone(),
                        value: vb.clone(),
                    });
                    inverse.push(Patch::Remove { path: p });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                path.push(PathSegment::Index(i));
                diff_into(path, &a[i], &b[i], forward, inverse);
                path.pop();
            }
            // Grow in ascending order, shrink from the tail.
            for (i, vb) in b.iter().enumerate().skip(common) {
                let p = child(path, PathSegment::Index(i));
                forward.push(Patch::Add {
                    path: p.clone(),
                    value: vb.clone(),
                });
                inverse.push(Patch::Remove { path: p });
            }
            for i in (common..a.len()).rev() {
                let p = child(path, PathSegment::Index(i));
                forward.push(Patch::Remove { path: p.clone() });
                inverse.push(Patch::Add {
                    path: p,
                    value: a[i].clone(),
                });
            }
        }
        _ => {
            forward.push(Patch::Replace {
                path: path.clone(),
                value: after.clone(),
            });
            inverse.push(Patch::Replace {
                path: path.clone(),
                value: before.clone(),
            });
        }
    }
}

/// Apply patches in order. On error `target` may be partially patched.
pub fn apply(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(target, patch)?;
    }
    Ok(())
}

/// Apply patches to a copy, leaving `target` untouched on error.
pub fn apply_atomic(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    let mut next = target.clone();
    apply(&mut next, patches)?;
    *target = next;
    Ok(())
}

/// Patches produced by an optimistic update, undoable against the same entry.
#[derive(Clone)]
pub struct PatchCollection {
    pub cache_key: CacheKey,
    pub patches: Vec<Patch>,
    pub inverse_patches: Vec<Patch>,
    pub(crate) engine: Option<Engine>,
}

impl PatchCollection {
    pub(crate) fn empty(cache_key: CacheKey) -> Self {
        Self {
            cache_key,
            patches: Vec::new(),
            inverse_patches: Vec::new(),
            engine: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Reapply the inverse patches to the cached value.
    pub async fn undo(&self) {
        let Some(engine) = &self.engine else {
            return;
        };
        if self.inverse_patches.is_empty() {
            return;
        }
        if let Err(e) = engine
            .patch_key(&self.cache_key, self.inverse_patches.clone())
            .await
        {
            warn!(key = %self.cache_key, error = %e, "failed to undo optimistic update");
        }
    }
}

impl fmt::Debug for PatchCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchCollection")
            .field("cache_key", &self.cache_key)
            .field("patches", &self.patches)
            .field("inverse_patches", &self.inverse_patches)
            .finish_non_exhaustive()
    }
}

fn render(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push('/');
        out.push_str(&segment.to_string());
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn apply_one(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let path = patch.path();
    let Some((last, parents)) = path.split_last() else {
        match patch {
            Patch::Add { value, .. } | Patch::Replace { value, .. } => *target = value.clone(),
            Patch::Remove { .. } => *target = Value::Null,
        }
        return Ok(());
    };

    let mut node = target;
    for (depth, segment) in parents.iter().enumerate() {
        let here = &path[..=depth];
        node = match (node, segment) {
            (Value::Object(map), PathSegment::Key(k)) => map
                .get_mut(k)
                .ok_or_else(|| PatchError::PathNotFound(render(here)))?,
            (Value::Array(items), PathSegment::Index(i)) => items
                .get_mut(*i)
                .ok_or_else(|| PatchError::PathNotFound(render(here)))?,
            (other, _) => {
                return Err(PatchError::NotAContainer {
                    path: render(&path[..depth]),
                    kind: kind_of(other),
                });
            }
        };
    }

    let parent_path = render(parents);
    match (node, last, patch) {
        (Value::Object(map), PathSegment::Key(k), Patch::Add { value, .. })
        | (Value::Object(map), PathSegment::Key(k), Patch::Replace { value, .. }) => {
            map.insert(k.clone(), value.clone());
        }
        (Value::Object(map), PathSegment::Key(k), Patch::Remove { .. }) => {
            map.remove(k)
                .ok_or_else(|| PatchError::PathNotFound(render(path)))?;
        }
        (Value::Array(items), PathSegment::Index(i), Patch::Add { value, .. }) => {
            if *i > items.len() {
                return Err(PatchError::PathNotFound(render(path)));
            }
            items.insert(*i, value.clone());
        }
        (Value::Array(items), PathSegment::Index(i), Patch::Replace { value, .. }) => {
            let slot = items
                .get_mut(*i)
                .ok_or_else(|| PatchError::PathNotFound(render(path)))?;
            *slot = value.clone();
        }
        (Value::Array(items), PathSegment::Index(i), Patch::Remove { .. }) => {
            if *i >= items.len() {
                return Err(PatchError::PathNotFound(render(path)));
            }
            items.remove(*i);
        }
        (Value::Object(_), PathSegment::Index(_), _) | (Value::Array(_), PathSegment::Key(_), _) => {
            return Err(PatchError::PathNotFound(render(path)));
        }
        (other, _, _) => {
            return Err(PatchError::NotAContainer {
                path: parent_path,
                kind: kind_of(other),
            });
        }
    }
    Ok(())
}
