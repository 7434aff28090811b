//! Namespace and index definitions sent as JSON on open and index changes.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    pub enabled: bool,
    pub drop_on_file_format_error: bool,
    pub create_if_missing: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            drop_on_file_format_error: false,
            create_if_missing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    pub storage: StorageOptions,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageOptions::default(),
        }
    }

    pub fn with_storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub json_paths: Vec<String>,
    /// `hash`, `tree`, `text`, `-` and friends.
    pub index_type: String,
    /// `int`, `int64`, `double`, `string`, `bool`, `composite`...
    pub field_type: String,
    pub is_pk: bool,
    pub is_array: bool,
    pub is_dense: bool,
    pub is_sparse: bool,
    pub is_linear: bool,
    pub is_appendable: bool,
    pub is_uuid: bool,
    pub collate_mode: String,
    pub sort_order: String,
    /// Index-type specific settings, e.g. full text tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl IndexDefinition {
    /// A plain index on the field of the same name.
    pub fn new(name: impl Into<String>, index_type: &str, field_type: &str) -> Self {
        let name = name.into();
        Self {
            json_paths: vec![name.clone()],
            name,
            index_type: index_type.to_string(),
            field_type: field_type.to_string(),
            is_pk: false,
            is_array: false,
            is_dense: false,
            is_sparse: false,
            is_linear: false,
            is_appendable: false,
            is_uuid: false,
            collate_mode: "none".to_string(),
            sort_order: String::new(),
            config: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_pk = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn json_paths(mut self, paths: &[&str]) -> Self {
        self.json_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }
}

/// Supplies the definitions a namespace is opened with.
///
/// Application types implement this by hand; nothing here inspects types to
/// derive it.
pub trait NamespaceDescriptor {
    fn namespace() -> NamespaceDefinition;

    fn indexes() -> Vec<IndexDefinition> {
        Vec::new()
    }
}
