//! Layer Registry YAML Format
//!
//! A registry declares the layers served by this process: the table each
//! layer reads from, the fields writers may push, and one or more views
//! projecting those fields as vector tiles. The registry is parsed and
//! validated once at startup and is immutable afterwards, so it can be
//! shared across request handlers without synchronization.
//!
//! Every identifier-shaped name in the registry ends up verbatim inside
//! constructed SQL, which is why all of them are held to a restricted
//! identifier grammar at load time. Join clauses are operator-authored SQL
//! fragments and are carried as-is.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{ConfigError, Error};

static IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// The name a rendered feature's key column is exposed under. View fields
/// must not collide with it.
pub const FEATURE_ID: &str = "id";

fn default_cache_duration() -> u64 {
    3600
}

/// The full layer registry, as loaded from one YAML document.
#[derive(Clone, Deserialize, Debug)]
pub struct LayerSet {
    pub name: String,
    pub layers: Vec<Layer>,
}

/// One table of geo-referenced railway objects and its views.
#[derive(Clone, Deserialize, Debug)]
pub struct Layer {
    pub name: String,
    pub table_name: String,
    /// Column holding the searchable key of each object, surfaced to map
    /// clients as the feature id.
    pub id_field: String,
    pub attribution: Option<String>,
    pub fields: Vec<Field>,
    pub views: Vec<View>,
}

/// A field writers may push for a layer, with its storage kind.
#[derive(Clone, Deserialize, Debug)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Geom,
    Text,
    Integer,
    Json,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Geom => "geom",
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Json => "json",
        }
    }
}

/// A named projection of a layer: the geometry column it indexes, the fields
/// it renders, and how long its tiles may be cached.
#[derive(Clone, Deserialize, Debug)]
pub struct View {
    pub name: String,
    pub on_field: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub joins: Vec<String>,
    #[serde(default = "default_cache_duration")]
    pub cache_duration: u64,
}

impl LayerSet {
    /// Constructs a validated registry from a YAML string.
    pub fn from_yaml(data: &str) -> Result<LayerSet, ConfigError> {
        let result: LayerSet = serde_yaml::from_str(data)?;
        result.validate()?;
        Ok(result)
    }

    /// Reads and validates a registry from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<LayerSet, ConfigError> {
        let data = fs::read_to_string(path)?;
        LayerSet::from_yaml(&data)
    }

    /// Looks up a layer by name. Unknown names are a 404, never a crash.
    pub fn layer(&self, name: &str) -> Result<&Layer, Error> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::LayerNotFound(name.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut layer_names = HashSet::new();
        for layer in &self.layers {
            check_ident("layer name", &layer.name)?;
            check_ident("table name", &layer.table_name)?;
            check_ident("id_field", &layer.id_field)?;
            if !layer_names.insert(layer.name.as_str()) {
                return Err(ConfigError::DuplicateLayer(layer.name.clone()));
            }
            layer.validate()?;
        }
        Ok(())
    }
}

impl Layer {
    /// Looks up a view by name.
    pub fn view(&self, name: &str) -> Result<&View, Error> {
        self.views
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::ViewNotFound {
                layer: self.name.clone(),
                view: name.to_string(),
            })
    }

    /// Looks up a declared field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The fields every pushed record must carry: the union of the views'
    /// indexed geometry columns.
    pub fn mandatory_fields(&self) -> HashSet<&str> {
        self.views.iter().map(|v| v.on_field.as_str()).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut field_names = HashSet::new();
        for field in &self.fields {
            check_ident("field name", &field.name)?;
            if !field_names.insert(field.name.as_str()) {
                return Err(ConfigError::DuplicateField {
                    scope: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        if self.field(&self.id_field).is_none() {
            return Err(ConfigError::UnknownIdField {
                layer: self.name.clone(),
                field: self.id_field.clone(),
            });
        }

        let mut view_names = HashSet::new();
        for view in &self.views {
            check_ident("view name", &view.name)?;
            if !view_names.insert(view.name.as_str()) {
                return Err(ConfigError::DuplicateView {
                    layer: self.name.clone(),
                    view: view.name.clone(),
                });
            }
            view.validate(self)?;
        }
        Ok(())
    }
}

impl View {
    fn validate(&self, layer: &Layer) -> Result<(), ConfigError> {
        match layer.field(&self.on_field) {
            Some(f) if f.kind == FieldKind::Geom => {}
            Some(_) => {
                return Err(ConfigError::NotGeometry {
                    view: self.name.clone(),
                    field: self.on_field.clone(),
                })
            }
            None => {
                return Err(ConfigError::UndeclaredField {
                    view: self.name.clone(),
                    field: self.on_field.clone(),
                })
            }
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            check_ident("view field", field)?;
            if field == FEATURE_ID {
                return Err(ConfigError::ReservedField(self.name.clone()));
            }
            if layer.field(field).is_none() {
                return Err(ConfigError::UndeclaredField {
                    view: self.name.clone(),
                    field: field.clone(),
                });
            }
            if !seen.insert(field.as_str()) {
                return Err(ConfigError::DuplicateField {
                    scope: self.name.clone(),
                    field: field.clone(),
                });
            }
        }

        if self.cache_duration == 0 {
            return Err(ConfigError::ZeroCacheDuration(self.name.clone()));
        }
        Ok(())
    }
}

fn check_ident(context: &str, name: &str) -> Result<(), ConfigError> {
    if IDENT.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            context: context.to_string(),
            name: name.to_string(),
        })
    }
}
