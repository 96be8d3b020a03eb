//! File and directory documents.
//!
//! Both kinds live in the `io.cozy.files` doctype, distinguished by the
//! `type` field. The typed structs here round-trip losslessly through
//! [`JsonDoc`] so they can cross the replication path like any other
//! document.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use nimbus_core::{Error, JsonDoc, Result};

/// Identifier of the root directory.
pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";

/// Identifier of the trash directory.
pub const TRASH_DIR_ID: &str = "io.cozy.files.trash-dir";

/// Path of the trash directory.
pub const TRASH_DIR_PATH: &str = "/.cozy_trash";

/// A back-reference from another document to a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefBy {
    #[serde(rename = "type")]
    pub doc_type: String,
    pub id: String,
}

/// A file document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub dir_id: String,
    pub name: String,
    pub size: u64,
    /// Lowercase hex MD5 of the content.
    pub md5: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub referenced_by: Vec<RefBy>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_path: Option<String>,
}

impl FileDoc {
    /// Build a fresh file document under the given parent.
    pub fn new(
        id: impl Into<String>,
        dir_id: impl Into<String>,
        name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            rev: None,
            kind: "file".to_string(),
            dir_id: dir_id.into(),
            name: name.into(),
            size: 0,
            md5: String::new(),
            mime: String::new(),
            class: String::new(),
            executable: false,
            trashed: false,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            referenced_by: Vec::new(),
            metadata: Map::new(),
            restore_path: None,
        }
    }

    pub fn to_json(&self) -> Result<JsonDoc> {
        JsonDoc::from_serialize(self).map_err(Error::from)
    }

    pub fn from_json(doc: &JsonDoc) -> Result<Self> {
        doc.deserialize().map_err(Error::from)
    }
}

/// A directory document. `fullpath` always equals the parent's path plus
/// `/name` and is unique within the instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub dir_id: String,
    pub name: String,
    pub fullpath: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_path: Option<String>,
}

impl DirDoc {
    pub fn new(
        id: impl Into<String>,
        dir_id: impl Into<String>,
        name: impl Into<String>,
        fullpath: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            rev: None,
            kind: "directory".to_string(),
            dir_id: dir_id.into(),
            name: name.into(),
            fullpath: fullpath.into(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            restore_path: None,
        }
    }

    /// The root directory of a fresh instance.
    pub fn root(now: DateTime<Utc>) -> Self {
        let mut dir = Self::new(ROOT_DIR_ID, "", "", "/", now);
        dir.rev = None;
        dir
    }

    /// The trash directory of a fresh instance.
    pub fn trash(now: DateTime<Utc>) -> Self {
        Self::new(TRASH_DIR_ID, ROOT_DIR_ID, ".cozy_trash", TRASH_DIR_PATH, now)
    }

    pub fn to_json(&self) -> Result<JsonDoc> {
        JsonDoc::from_serialize(self).map_err(Error::from)
    }

    pub fn from_json(doc: &JsonDoc) -> Result<Self> {
        doc.deserialize().map_err(Error::from)
    }
}

/// A file or directory, as found in the index.
#[derive(Clone, Debug, PartialEq)]
pub enum DocKind {
    File(FileDoc),
    Dir(DirDoc),
}

impl DocKind {
    pub fn id(&self) -> &str {
        match self {
            DocKind::File(f) => &f.id,
            DocKind::Dir(d) => &d.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DocKind::File(f) => &f.name,
            DocKind::Dir(d) => &d.name,
        }
    }

    pub fn dir_id(&self) -> &str {
        match self {
            DocKind::File(f) => &f.dir_id,
            DocKind::Dir(d) => &d.dir_id,
        }
    }

    /// Dispatch on the `type` field of a raw document.
    pub fn from_json(doc: &JsonDoc) -> Result<Self> {
        match doc.get_str("type") {
            Some("file") => Ok(DocKind::File(FileDoc::from_json(doc)?)),
            Some("directory") => Ok(DocKind::Dir(DirDoc::from_json(doc)?)),
            other => Err(Error::Store(format!(
                "not a vfs document (type = {:?})",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> Result<JsonDoc> {
        match self {
            DocKind::File(f) => f.to_json(),
            DocKind::Dir(d) => d.to_json(),
        }
    }
}

/// Derive the deterministic name a losing file takes after a conflict.
///
/// The extension survives: `photo.jpg` becomes
/// `photo - conflict - 2024-05-01T12:00:00Z.jpg`.
pub fn conflict_name(name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            format!("{} - conflict - {}.{}", stem, stamp, ext)
        }
        _ => format!("{} - conflict - {}", name, stamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_file_doc_round_trip() {
        let mut file = FileDoc::new("f1", ROOT_DIR_ID, "photo.jpg", at());
        file.rev = Some("1-aaa".to_string());
        file.md5 = "d41d8cd98f00b204e9800998ecf8427e".to_string();
        file.mime = "image/jpeg".to_string();

        let json = file.to_json().unwrap();
        assert_eq!(json.id(), "f1");
        assert_eq!(json.rev(), Some("1-aaa"));
        assert_eq!(json.get_str("type"), Some("file"));
        assert_eq!(json.get_str("dirId"), Some(ROOT_DIR_ID));

        let back = FileDoc::from_json(&json).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn test_dir_doc_round_trip() {
        let dir = DirDoc::new("d1", ROOT_DIR_ID, "Photos", "/Photos", at());
        let json = dir.to_json().unwrap();
        assert_eq!(json.get_str("fullpath"), Some("/Photos"));
        let back = DirDoc::from_json(&json).unwrap();
        assert_eq!(back, dir);
    }

    #[test]
    fn test_doc_kind_dispatch() {
        let file = FileDoc::new("f1", ROOT_DIR_ID, "a.txt", at());
        let kind = DocKind::from_json(&file.to_json().unwrap()).unwrap();
        assert!(matches!(kind, DocKind::File(_)));

        let dir = DirDoc::new("d1", ROOT_DIR_ID, "A", "/A", at());
        let kind = DocKind::from_json(&dir.to_json().unwrap()).unwrap();
        assert!(matches!(kind, DocKind::Dir(_)));

        let mut bogus = JsonDoc::with_id("x");
        bogus.insert("type", serde_json::json!("symlink"));
        assert!(DocKind::from_json(&bogus).is_err());
    }

    #[test]
    fn test_conflict_name() {
        assert_eq!(
            conflict_name("photo.jpg", at()),
            "photo - conflict - 2024-05-01T12:00:00Z.jpg"
        );
        assert_eq!(
            conflict_name("notes", at()),
            "notes - conflict - 2024-05-01T12:00:00Z"
        );
        // A leading dot is a hidden file, not an extension.
        assert_eq!(
            conflict_name(".env", at()),
            ".env - conflict - 2024-05-01T12:00:00Z"
        );
    }
}
