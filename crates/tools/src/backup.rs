//! JSON backup (§6, §9): a single self-contained file holding every
//! collection's documents and index definitions, restorable through the
//! public insert/create-index API rather than any page-level format.

use lauradb_api::{Database, FindOptions, IndexDefinition, IndexKind};
use lauradb_core::Result;
use lauradb_engine::json::document_to_json;
use serde::{Deserialize, Serialize};

/// The backup format version this tool writes and the only version
/// `restore` accepts.
pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub version: String,
    pub timestamp: i64,
    pub database_name: String,
    pub collections: Vec<BackupCollection>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCollection {
    pub name: String,
    pub documents: Vec<BackupDocument>,
    pub indexes: Vec<BackupIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupIndex {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub field_paths: Vec<String>,
    pub unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

fn index_kind_name(kind: IndexKind) -> &'static str {
    match kind {
        IndexKind::BTree => "btree",
        IndexKind::Text => "text",
        IndexKind::Geo2d => "geo2d",
        IndexKind::Geo2dSphere => "geo2dsphere",
        IndexKind::Ttl => "ttl",
    }
}

fn index_kind_from_name(name: &str) -> Result<IndexKind> {
    Ok(match name {
        "btree" => IndexKind::BTree,
        "text" => IndexKind::Text,
        "geo2d" => IndexKind::Geo2d,
        "geo2dsphere" => IndexKind::Geo2dSphere,
        "ttl" => IndexKind::Ttl,
        other => return Err(lauradb_core::Error::unsupported(format!("unknown index type in backup: {other}"))),
    })
}

fn to_backup_index(def: &IndexDefinition) -> BackupIndex {
    BackupIndex {
        name: def.name.clone(),
        kind: index_kind_name(def.kind).to_string(),
        field_paths: def.field_paths.clone(),
        unique: def.unique,
        sparse: def.sparse.then_some(true),
        ttl_duration: def.ttl_seconds,
        geo_type: def.geo_cell_size.map(|s| s.to_string()),
        filter: def.partial_filter.clone(),
    }
}

fn from_backup_index(b: &BackupIndex) -> Result<IndexDefinition> {
    Ok(IndexDefinition {
        name: b.name.clone(),
        kind: index_kind_from_name(&b.kind)?,
        field_paths: b.field_paths.clone(),
        unique: b.unique,
        sparse: b.sparse.unwrap_or(false),
        partial_filter: b.filter.clone(),
        ttl_seconds: b.ttl_duration,
        geo_cell_size: b.geo_type.as_ref().and_then(|s| s.parse().ok()),
    })
}

/// Export every collection in `db` into a single in-memory backup,
/// `timestamp_ms` stamped by the caller (the core never reads the
/// clock itself, see [`lauradb_engine::Catalog`]'s own `now_ms`).
pub fn export(db: &Database, database_name: &str, timestamp_ms: i64) -> Result<BackupFile> {
    let mut collections = Vec::new();
    for name in db.list_collections() {
        let handle = db.collection(name.as_str());
        let session = db.start_session();
        let docs = handle.find(&session, &serde_json::json!({}), &FindOptions::default())?;
        let mut documents = Vec::with_capacity(docs.len());
        for doc in &docs {
            let mut json = document_to_json(doc);
            let id = match json.as_object_mut().and_then(|m| m.remove("_id")) {
                Some(serde_json::Value::Object(m)) => m.get("$oid").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                _ => String::new(),
            };
            documents.push(BackupDocument { id, fields: json });
        }
        let indexes = handle.list_indexes()?.iter().map(to_backup_index).collect();
        collections.push(BackupCollection { name, documents, indexes });
    }

    let metadata = serde_json::json!({ "collection_count": collections.len() });
    Ok(BackupFile {
        version: BACKUP_VERSION.to_string(),
        timestamp: timestamp_ms,
        database_name: database_name.to_string(),
        collections,
        metadata,
    })
}

/// Re-derive an importable document from a backup entry: the `_id`
/// rejoined with its sibling fields, ready for [`crate::restore::import`].
pub(crate) fn document_json(entry: &BackupDocument) -> serde_json::Value {
    let mut out = entry.fields.clone();
    if let Some(map) = out.as_object_mut() {
        if !entry.id.is_empty() {
            map.insert("_id".to_string(), serde_json::json!({ "$oid": entry.id }));
        }
    }
    out
}

pub(crate) fn index_definition(b: &BackupIndex) -> Result<IndexDefinition> {
    from_backup_index(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lauradb_api::Config;
    use lauradb_core::value::{Document, Value};
    use tempfile::tempdir;

    #[test]
    fn export_round_trips_document_fields() {
        let dir = tempdir().unwrap();
        let db = Database::open(Config::new(dir.path())).unwrap();
        db.create_collection("users").unwrap();
        let users = db.collection("users");
        let session = db.start_session();
        let mut doc = Document::new();
        doc.set("name", Value::String("Alice".into()));
        let id = users.insert_one(&session, doc).unwrap();

        let backup = export(&db, "test", 0).unwrap();
        assert_eq!(backup.version, BACKUP_VERSION);
        assert_eq!(backup.collections.len(), 1);
        let coll = &backup.collections[0];
        assert_eq!(coll.name, "users");
        assert_eq!(coll.documents[0].id, id.to_string());
        assert_eq!(coll.documents[0].fields["name"], serde_json::json!("Alice"));
    }
}
