use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Dir,
    Link,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Dir => "dir",
            FileType::Link => "link",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Some(FileType::File),
            "dir" | "folder" | "directory" => Some(FileType::Dir),
            "link" | "symlink" => Some(FileType::Link),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaDataError {
    #[error("file entry is not a JSON object")]
    NotAnObject,
    /// Absent and present-with-the-wrong-type are reported the same way.
    #[error("file entry is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("file entry has unrecognized {field} `{value}`")]
    InvalidField { field: &'static str, value: String },
}

/// One remote file or directory entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FileMetaData {
    /// Absolute remote path, including the entry name.
    pub path: String,
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl FileMetaData {
    /// Entry synthesized from what a request already knows (used when the
    /// gateway answers a mutation without a full listing record).
    pub fn new(path: impl Into<String>, file_type: FileType) -> Self {
        let path = path.into();
        let name = file_name_of(&path).to_string();
        Self {
            path,
            name,
            file_type,
            size: 0,
            last_modified: None,
            mime_type: None,
            permissions: None,
            format: None,
            system: None,
        }
    }

    /// Parses one listing record. `name`, `type` and `length` are required;
    /// `path` falls back to `parent_dir` joined with the name.
    pub fn from_json(entry: &Value, parent_dir: &str) -> Result<Self, MetaDataError> {
        let obj = entry.as_object().ok_or(MetaDataError::NotAnObject)?;

        let name = required_str(obj, "name")?.to_string();
        let raw_type = required_str(obj, "type")?;
        let file_type = FileType::from_slug(raw_type).ok_or_else(|| MetaDataError::InvalidField {
            field: "type",
            value: raw_type.to_string(),
        })?;
        let size = obj
            .get("length")
            .and_then(Value::as_u64)
            .ok_or(MetaDataError::MissingField("length"))?;

        let path = match optional_str(obj, "path") {
            Some(p) if !p.is_empty() => ensure_leading_slash(p),
            _ => join_remote(parent_dir, &name),
        };
        let last_modified = optional_str(obj, "lastModified")
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(Self {
            path,
            name,
            file_type,
            size,
            last_modified,
            mime_type: optional_str(obj, "mimeType").map(str::to_string),
            permissions: optional_str(obj, "permissions").map(str::to_string),
            format: optional_str(obj, "format").map(str::to_string),
            system: optional_str(obj, "system").map(str::to_string),
        })
    }

    /// Overlays whatever optional attributes a mutation result carried.
    pub fn merge_result(&mut self, result: &Value) {
        let Some(obj) = result.as_object() else {
            return;
        };
        if let Some(size) = obj.get("length").and_then(Value::as_u64) {
            self.size = size;
        }
        if let Some(ts) = optional_str(obj, "lastModified")
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        {
            self.last_modified = Some(ts.with_timezone(&Utc));
        }
        if let Some(mime) = optional_str(obj, "mimeType") {
            self.mime_type = Some(mime.to_string());
        }
        if let Some(system) = optional_str(obj, "systemId").or_else(|| optional_str(obj, "system"))
        {
            self.system = Some(system.to_string());
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, MetaDataError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or(MetaDataError::MissingField(key))
}

fn optional_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

fn file_name_of(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}
