//! Write operations, queries and document paths.
//!
//! A [`WriteOp`] batch is the store's only mutation primitive; the batch is
//! applied inside one SQLite transaction, preconditions included, so callers
//! get all-or-nothing semantics for mirrored-pair writes.

use serde_json::Value;

use crate::error::{Result, StoreError};

/// Maximum number of values an [`Filter::In`] filter accepts per query.
/// Callers with wider membership sets must shard and merge themselves.
pub const MAX_IN_ARITY: usize = 10;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// A validated document path: an even number of non-empty segments,
/// alternating collection and id (`users/alice/connections/bob`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let segments: Vec<&str> = path.split('/').collect();

        if segments.len() < 2 || segments.len() % 2 != 0 {
            return Err(StoreError::InvalidPath(format!(
                "expected an even number of segments, got '{path}'"
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidPath(format!(
                "empty segment in '{path}'"
            )));
        }

        Ok(Self(path))
    }

    /// Build a `collection/id` path from parts.
    pub fn doc(collection: &str, id: &str) -> Result<Self> {
        Self::new(format!("{collection}/{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything up to the final id segment.
    pub fn collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// The final id segment.
    pub fn id(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// A single mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new document; fails the batch with a conflict if the path
    /// already exists. The store assigns `createdAt` (field and column).
    Create { path: DocPath, data: Value },

    /// Insert or fully replace. An existing document keeps its original
    /// `createdAt`.
    Set { path: DocPath, data: Value },

    /// Merge the given top-level fields into an existing document; fails
    /// the batch if the document is absent.
    Update {
        path: DocPath,
        fields: serde_json::Map<String, Value>,
    },

    /// Delete a document. With `must_exist`, an absent document fails the
    /// batch; otherwise absence is a no-op.
    Delete { path: DocPath, must_exist: bool },

    /// Compare-and-set on one top-level field. Current value `to` is a
    /// no-op success (idempotent re-application); current value `from`
    /// performs the write; anything else fails the batch with a conflict.
    FieldTransition {
        path: DocPath,
        field: String,
        from: Value,
        to: Value,
    },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Create { path, .. }
            | Self::Set { path, .. }
            | Self::Update { path, .. }
            | Self::Delete { path, .. }
            | Self::FieldTransition { path, .. } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A predicate over a top-level JSON field.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    /// Membership test, bounded by [`MAX_IN_ARITY`].
    In(String, Vec<Value>),
    /// `field <= value` (lexicographic for strings, numeric for numbers).
    Le(String, Value),
    /// `field >= value`.
    Ge(String, Value),
}

impl Filter {
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _) | Self::In(f, _) | Self::Le(f, _) | Self::Ge(f, _) => f,
        }
    }
}

/// Result ordering. `CreatedAt*` uses the store-assigned column; `Field*`
/// orders by a top-level JSON field.
#[derive(Debug, Clone)]
pub enum OrderBy {
    CreatedAtDesc,
    CreatedAtAsc,
    FieldDesc(String),
    FieldAsc(String),
}

/// An ordered range query over one collection.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) collection: String,
    pub(crate) filters: Vec<Filter>,
    pub(crate) order: OrderBy,
    pub(crate) limit: Option<u32>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order: OrderBy::CreatedAtDesc,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collection_path(&self) -> &str {
        &self.collection
    }

    /// Reject queries the store cannot execute.
    pub(crate) fn validate(&self) -> Result<()> {
        for f in &self.filters {
            validate_field_name(f.field())?;
            if let Filter::In(field, values) = f {
                if values.len() > MAX_IN_ARITY {
                    return Err(StoreError::InvalidQuery(format!(
                        "In filter on '{field}' has {} values, limit is {MAX_IN_ARITY}",
                        values.len()
                    )));
                }
            }
        }
        if let OrderBy::FieldAsc(field) | OrderBy::FieldDesc(field) = &self.order {
            validate_field_name(field)?;
        }
        Ok(())
    }
}

/// Field names are interpolated into `json_extract` paths, so keep them to
/// a safe character set.
pub(crate) fn validate_field_name(field: &str) -> Result<()> {
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidQuery(format!(
            "invalid field name '{field}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_parsing() {
        let p = DocPath::new("users/alice/connections/bob").unwrap();
        assert_eq!(p.collection(), "users/alice/connections");
        assert_eq!(p.id(), "bob");

        let p = DocPath::doc("timeCapsules", "abc").unwrap();
        assert_eq!(p.collection(), "timeCapsules");
        assert_eq!(p.id(), "abc");
    }

    #[test]
    fn path_rejects_odd_or_empty_segments() {
        assert!(DocPath::new("users").is_err());
        assert!(DocPath::new("users/alice/connections").is_err());
        assert!(DocPath::new("users//bob").is_err());
        assert!(DocPath::new("").is_err());
    }

    #[test]
    fn in_filter_arity_limit() {
        let wide: Vec<_> = (0..11).map(|i| json!(i.to_string())).collect();
        let q = Query::collection("journalEntries").filter(Filter::In("userId".into(), wide));
        assert!(matches!(q.validate(), Err(StoreError::InvalidQuery(_))));

        let ok: Vec<_> = (0..10).map(|i| json!(i.to_string())).collect();
        let q = Query::collection("journalEntries").filter(Filter::In("userId".into(), ok));
        assert!(q.validate().is_ok());
    }

    #[test]
    fn field_names_are_restricted() {
        assert!(validate_field_name("deliveryDate").is_ok());
        assert!(validate_field_name("is_delivered").is_ok());
        assert!(validate_field_name("x'); DROP TABLE documents; --").is_err());
    }
}
