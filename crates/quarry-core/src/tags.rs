//! Invalidation tags and the index from tags to the cache keys providing them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::key::CacheKey;

/// A caller-defined label for the entities a result represents.
///
/// A tag without an id stands for every entity of its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub tag_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Tag {
    /// A type-only tag.
    pub fn new(tag_type: impl Into<String>) -> Self {
        Self {
            tag_type: tag_type.into(),
            id: None,
        }
    }

    pub fn with_id(tag_type: impl Into<String>, id: impl ToString) -> Self {
        Self {
            tag_type: tag_type.into(),
            id: Some(id.to_string()),
        }
    }

    /// Type-only tags match any id of the same type; two ids must be equal.
    pub fn matches(&self, other: &Tag) -> bool {
        self.tag_type == other.tag_type
            && (self.id.is_none() || other.id.is_none() || self.id == other.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.tag_type, id),
            None => f.write_str(&self.tag_type),
        }
    }
}

impl From<&str> for Tag {
    fn from(tag_type: &str) -> Self {
        Tag::new(tag_type)
    }
}

/// Inputs available when computing tags for a finished request.
#[derive(Debug, Clone, Copy)]
pub struct TagContext<'a> {
    pub result: Option<&'a Value>,
    pub error: Option<&'a QueryError>,
    pub args: &'a Value,
}

type TagFn = Arc<dyn Fn(TagContext<'_>) -> Vec<Tag> + Send + Sync>;

/// Declarative `provides` / `invalidates` description.
#[derive(Clone)]
pub enum TagDescription {
    /// A fixed list of tags.
    List(Vec<Tag>),
    /// Tags computed from the result, error and arguments.
    Computed(TagFn),
}

impl TagDescription {
    pub fn list<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        Self::List(tags.into_iter().map(Into::into).collect())
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(TagContext<'_>) -> Vec<Tag> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Evaluate to a sorted, de-duplicated tag list.
    pub fn evaluate(&self, ctx: TagContext<'_>) -> Vec<Tag> {
        let mut tags = match self {
            Self::List(tags) => tags.clone(),
            Self::Computed(f) => f(ctx),
        };
        tags.sort();
        tags.dedup();
        tags
    }
}

impl fmt::Debug for TagDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(tags) => f.debug_tuple("List").field(tags).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl<T: Into<Tag>> From<Vec<T>> for TagDescription {
    fn from(tags: Vec<T>) -> Self {
        Self::list(tags)
    }
}

/// Tag type -> tag id (`None` for type-only) -> keys providing it.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    by_type: HashMap<String, HashMap<Option<String>, BTreeSet<CacheKey>>>,
    by_key: HashMap<CacheKey, Vec<Tag>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every association of `key` with `tags`.
    pub fn replace(&mut self, key: &CacheKey, tags: &[Tag]) {
        self.remove(key);
        if tags.is_empty() {
            return;
        }
        for tag in tags {
            self.by_type
                .entry(tag.tag_type.clone())
                .or_default()
                .entry(tag.id.clone())
                .or_default()
                .insert(key.clone());
        }
        self.by_key.insert(key.clone(), tags.to_vec());
    }

    /// Drop every association of `key`, returning the tags it provided.
    pub fn remove(&mut self, key: &CacheKey) -> Vec<Tag> {
        let Some(tags) = self.by_key.remove(key) else {
            return Vec::new();
        };
        for tag in &tags {
            let Some(ids) = self.by_type.get_mut(&tag.tag_type) else {
                continue;
            };
            if let Some(keys) = ids.get_mut(&tag.id) {
                keys.remove(key);
                if keys.is_empty() {
                    ids.remove(&tag.id);
                }
            }
            if ids.is_empty() {
                self.by_type.remove(&tag.tag_type);
            }
        }
        tags
    }

    /// Tags currently provided by `key`.
    pub fn provided_by(&self, key: &CacheKey) -> &[Tag] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every key whose provided tags intersect `tags`, in key order.
    pub fn keys_for(&self, tags: &[Tag]) -> BTreeSet<CacheKey> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            let Some(ids) = self.by_type.get(&tag.tag_type) else {
                continue;
            };
            match &tag.id {
                None => {
                    for providers in ids.values() {
                        keys.extend(providers.iter().cloned());
                    }
                }
                Some(_) => {
                    for id in [&tag.id, &None] {
                        if let Some(providers) = ids.get(id) {
                            keys.extend(providers.iter().cloned());
                        }
                    }
                }
            }
        }
        keys
    }

    /// Number of keys with at least one tag.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
        self.by_key.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    #[test]
    fn test_tag_matching() {
        let any_post = Tag::new("Post");
        let post_1 = Tag::with_id("Post", 1);
        let post_2 = Tag::with_id("Post", 2);

        assert!(any_post.matches(&post_1));
        assert!(post_1.matches(&any_post));
        assert!(post_1.matches(&Tag::with_id("Post", "1")));
        assert!(!post_1.matches(&post_2));
        assert!(!Tag::new("User").matches(&any_post));
    }

    #[test]
    fn test_replace_drops_old_associations() {
        let mut index = TagIndex::new();
        index.replace(&key("a"), &[Tag::with_id("Post", 1), Tag::new("List")]);
        index.replace(&key("a"), &[Tag::with_id("Post", 2)]);

        assert!(index.keys_for(&[Tag::with_id("Post", 1)]).is_empty());
        assert!(index.keys_for(&[Tag::new("List")]).is_empty());
        assert_eq!(
            index.keys_for(&[Tag::with_id("Post", 2)]).into_iter().collect::<Vec<_>>(),
            vec![key("a")]
        );
        assert_eq!(index.provided_by(&key("a")), &[Tag::with_id("Post", 2)]);
    }

    #[test]
    fn test_keys_for_matching_rules() {
        let mut index = TagIndex::new();
        index.replace(&key("list"), &[Tag::new("Post")]);
        index.replace(&key("one"), &[Tag::with_id("Post", 1)]);
        index.replace(&key("two"), &[Tag::with_id("Post", 2)]);
        index.replace(&key("user"), &[Tag::with_id("User", 1)]);

        let by_type: Vec<_> = index.keys_for(&[Tag::new("Post")]).into_iter().collect();
        assert_eq!(by_type, vec![key("list"), key("one"), key("two")]);

        let by_id: Vec<_> = index.keys_for(&[Tag::with_id("Post", 1)]).into_iter().collect();
        assert_eq!(by_id, vec![key("list"), key("one")]);

        assert!(index.keys_for(&[Tag::new("Comment")]).is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_buckets() {
        let mut index = TagIndex::new();
        index.replace(&key("a"), &[Tag::new("Counter")]);
        assert_eq!(index.remove(&key("a")), vec![Tag::new("Counter")]);
        assert!(index.is_empty());
        assert!(index.by_type.is_empty());
        assert!(index.remove(&key("a")).is_empty());
    }

    #[test]
    fn test_description_evaluation() {
        let listed = TagDescription::from(vec!["Counter", "Counter"]);
        let ctx = TagContext {
            result: None,
            error: None,
            args: &Value::Null,
        };
        assert_eq!(listed.evaluate(ctx), vec![Tag::new("Counter")]);

        let computed = TagDescription::computed(|ctx| match ctx.result {
            Some(Value::Array(posts)) => posts
                .iter()
                .map(|p| Tag::with_id("Post", &p["id"]))
                .chain(std::iter::once(Tag::new("Post")))
                .collect(),
            _ => vec![],
        });
        let result = json!([{"id": 2}, {"id": 1}]);
        let tags = computed.evaluate(TagContext {
            result: Some(&result),
            error: None,
            args: &Value::Null,
        });
        assert_eq!(
            tags,
            vec![Tag::new("Post"), Tag::with_id("Post", 1), Tag::with_id("Post", 2)]
        );
    }
}
