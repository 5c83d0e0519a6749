use std::{
    hash::{Hash, Hasher},
    rc::Rc,
};

use serde::Serialize;
use serde_json::Value;

/// Identity of a cache entry.
///
/// A key is an ordered sequence of JSON values. Two keys are equal if and only if
/// their canonical JSON representations are equal, so `["workspaces", {"b": 1, "a": 2}]`
/// and `["workspaces", {"a": 2, "b": 1}]` address the same entry.
#[derive(Clone)]
pub struct QueryKey {
    parts: Rc<[Value]>,
    canonical: Rc<str>,
}

impl QueryKey {
    /// Creates a key from its parts.
    ///
    /// ```
    /// use fme_query::QueryKey;
    ///
    /// let key = QueryKey::new(["fme", "repositories"]);
    /// assert_eq!(key.canonical(), r#"["fme","repositories"]"#);
    /// ```
    pub fn new<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Self::from_values(parts.into_iter().map(Into::into).collect())
    }

    /// Creates a key from already converted JSON values.
    pub fn from_values(parts: Vec<Value>) -> Self {
        // Maps are ordered by key, so the string form is canonical.
        let canonical = Value::Array(parts.clone()).to_string();
        Self {
            parts: parts.into(),
            canonical: canonical.into(),
        }
    }

    /// Creates a key from any serializable sequence.
    ///
    /// A value that does not serialize to a JSON array becomes a single-part key.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Array(parts) => Ok(Self::from_values(parts)),
            single => Ok(Self::from_values(vec![single])),
        }
    }

    /// The ordered key parts.
    pub fn parts(&self) -> &[Value] {
        &self.parts
    }

    /// The canonical JSON string used as the key identity.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Returns true if this key begins with all parts of `prefix`.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.parts.len() <= self.parts.len()
            && prefix
                .parts
                .iter()
                .zip(self.parts.iter())
                .all(|(a, b)| a.to_string() == b.to_string())
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl std::fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueryKey").field(&&*self.canonical).finish()
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Builds a [`QueryKey`] from a list of values convertible into JSON.
///
/// ```
/// use fme_query::query_key;
///
/// let key = query_key!["fme", "workspace", 42];
/// assert_eq!(key.canonical(), r#"["fme","workspace",42]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::QueryKey::from_values(vec![$($crate::__private::Value::from($part)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_by_canonical_json() {
        let a = QueryKey::new([json!("ws"), json!({"b": 1, "a": 2})]);
        let b = QueryKey::new([json!("ws"), json!({"a": 2, "b": 1})]);
        assert_eq!(a, b);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn order_of_parts_matters() {
        let a = QueryKey::new(["a", "b"]);
        let b = QueryKey::new(["b", "a"]);
        assert_ne!(a, b);
    }

    #[test]
    fn number_and_string_are_distinct() {
        assert_ne!(query_key!["id", 1], query_key!["id", "1"]);
    }

    #[test]
    fn from_serialize_tuple() {
        let key = QueryKey::from_serialize(&("repos", 3, true)).expect("serializable");
        assert_eq!(key.canonical(), r#"["repos",3,true]"#);

        let single = QueryKey::from_serialize("health").expect("serializable");
        assert_eq!(single.parts().len(), 1);
    }

    #[test]
    fn prefix_matching() {
        let key = query_key!["fme", "workspaces", "repo"];
        assert!(key.starts_with(&query_key!["fme"]));
        assert!(key.starts_with(&query_key!["fme", "workspaces"]));
        assert!(!key.starts_with(&query_key!["fme", "repositories"]));
    }
}
