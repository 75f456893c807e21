//! Secondary index definitions and key derivation (§3, §4.7, §4.13).

pub mod geo;
pub mod text;
pub mod ttl;

use lauradb_core::value::{Document, Value};
use serde::{Deserialize, Serialize};

/// What kind of structure backs an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Ordered B+tree over the encoded field value(s).
    BTree,
    /// Inverted posting-list index over tokenized text.
    Text,
    /// Planar grid, Euclidean distance.
    Geo2d,
    /// Spherical grid, Haversine distance.
    Geo2dSphere,
    /// B+tree keyed by expiry timestamp, swept by a background task.
    Ttl,
}

/// An index's definition, as named in `create_index`/`list_indexes`
/// (§6) and persisted in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub kind: IndexKind,
    /// Field paths, in order; for `BTree` this is the compound-key field
    /// list, for `Text`/`Geo*` it's the single field holding the text or
    /// coordinate to index, for `Ttl` the field holding the expiry
    /// timestamp.
    pub field_paths: Vec<String>,
    pub unique: bool,
    /// Sparse: omit an entry when the indexed field is entirely absent.
    pub sparse: bool,
    /// Partial filter: an entry exists only when the document satisfies
    /// this filter (evaluated against the post-image). `None` means
    /// every document is eligible (subject to `sparse`).
    pub partial_filter: Option<serde_json::Value>,
    /// TTL expiry, for `Ttl` indexes: documents are deleted once
    /// `now - indexed_timestamp >= ttl_seconds`.
    pub ttl_seconds: Option<i64>,
    /// Grid cell size in degrees, for `Geo2d`/`Geo2dSphere` indexes.
    pub geo_cell_size: Option<f64>,
}

impl IndexDefinition {
    pub fn btree(name: impl Into<String>, field_paths: Vec<String>, unique: bool) -> Self {
        IndexDefinition {
            name: name.into(),
            kind: IndexKind::BTree,
            field_paths,
            unique,
            sparse: false,
            partial_filter: None,
            ttl_seconds: None,
            geo_cell_size: None,
        }
    }

    pub fn text(name: impl Into<String>, field_path: impl Into<String>) -> Self {
        IndexDefinition {
            name: name.into(),
            kind: IndexKind::Text,
            field_paths: vec![field_path.into()],
            unique: false,
            sparse: false,
            partial_filter: None,
            ttl_seconds: None,
            geo_cell_size: None,
        }
    }

    fn geo(kind: IndexKind, name: impl Into<String>, field_path: impl Into<String>, cell_size: Option<f64>) -> Self {
        IndexDefinition {
            name: name.into(),
            kind,
            field_paths: vec![field_path.into()],
            unique: false,
            sparse: false,
            partial_filter: None,
            ttl_seconds: None,
            geo_cell_size: cell_size,
        }
    }

    pub fn geo_2d(name: impl Into<String>, field_path: impl Into<String>, cell_size: Option<f64>) -> Self {
        Self::geo(IndexKind::Geo2d, name, field_path, cell_size)
    }

    pub fn geo_2d_sphere(name: impl Into<String>, field_path: impl Into<String>, cell_size: Option<f64>) -> Self {
        Self::geo(IndexKind::Geo2dSphere, name, field_path, cell_size)
    }

    pub fn ttl(name: impl Into<String>, field_path: impl Into<String>, ttl_seconds: i64) -> Self {
        IndexDefinition {
            name: name.into(),
            kind: IndexKind::Ttl,
            field_paths: vec![field_path.into()],
            unique: false,
            sparse: false,
            partial_filter: None,
            ttl_seconds: Some(ttl_seconds),
            geo_cell_size: None,
        }
    }

    /// Whether `field_paths` resolve to at least one array field in
    /// `doc`, which makes this a multi-key index for that document
    /// (§4.7: "one key per element for array fields").
    fn is_multikey_for(&self, doc: &Document) -> bool {
        self.field_paths
            .iter()
            .any(|p| matches!(doc.get_path(p), Some(Value::Array(_))))
    }

    /// Whether the indexed field(s) are present at all in `doc`, used by
    /// sparse-index entry suppression.
    fn fields_present(&self, doc: &Document) -> bool {
        self.field_paths.iter().any(|p| doc.get_path(p).is_some())
    }

    /// Derive the set of index key tuples this document contributes,
    /// expanding array fields into one tuple per element (§4.7
    /// multi-key indexing). Returns an empty vec when the document is
    /// not eligible (sparse omission, no non-array path resolves, or the
    /// indexed field doesn't hold the shape this index kind expects).
    ///
    /// `Text` and `Geo2d`/`Geo2dSphere` derive their keys through
    /// `text::tokenize_unique` and `geo::cell_id` respectively; `Ttl`
    /// keys on the raw expiry value like a plain `BTree` index does.
    pub fn key_tuples(&self, doc: &Document) -> Vec<Vec<Value>> {
        if self.sparse && !self.fields_present(doc) {
            return Vec::new();
        }
        match self.kind {
            IndexKind::Text => return self.text_key_tuples(doc),
            IndexKind::Geo2d | IndexKind::Geo2dSphere => return self.geo_key_tuples(doc),
            IndexKind::BTree | IndexKind::Ttl => {}
        }
        if !self.is_multikey_for(doc) {
            let tuple: Vec<Value> = self
                .field_paths
                .iter()
                .map(|p| doc.get_path(p).cloned().unwrap_or(Value::Null))
                .collect();
            return vec![tuple];
        }
        // Multi-key: only single-field array indexes are supported, per
        // §4.7's "one key per element" wording (compound multi-key
        // indexes across two array fields are intentionally rejected at
        // `create_index` time, see `Collection::create_index`).
        let path = &self.field_paths[0];
        match doc.get_path(path) {
            Some(Value::Array(items)) => items.iter().cloned().map(|v| vec![v]).collect(),
            other => vec![vec![other.cloned().unwrap_or(Value::Null)]],
        }
    }

    /// One tuple per distinct term, keyed `Value::String(term)` so the
    /// backing tree is a plain ordered posting list.
    fn text_key_tuples(&self, doc: &Document) -> Vec<Vec<Value>> {
        let Some(path) = self.field_paths.first() else { return Vec::new() };
        match doc.get_path(path) {
            Some(Value::String(s)) => text::tokenize_unique(s).into_iter().map(|t| vec![Value::String(t)]).collect(),
            _ => Vec::new(),
        }
    }

    /// One tuple keyed by the point's grid cell id. The field is
    /// expected to hold a `[longitude, latitude]` pair (GeoJSON order).
    fn geo_key_tuples(&self, doc: &Document) -> Vec<Vec<Value>> {
        let Some(path) = self.field_paths.first() else { return Vec::new() };
        let cell_size = self.geo_cell_size.unwrap_or(geo::DEFAULT_CELL_SIZE_DEGREES);
        match doc.get_path(path) {
            Some(Value::Array(items)) if items.len() == 2 => match (items[0].as_f64(), items[1].as_f64()) {
                (Some(lng), Some(lat)) => vec![vec![Value::String(geo::cell_id(lng, lat, cell_size))]],
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}
