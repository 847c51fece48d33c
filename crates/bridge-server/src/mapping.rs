//! Per-form mapping registry
//!
//! Loads and validates the mapping file that tells the pipeline which CRM
//! fields each form field feeds, which files belong to which participation
//! label, and which fields identify an existing deal or contact. The registry
//! is loaded once at startup; a malformed entry fails the whole load rather
//! than leaving a partially valid table that would silently drop fields at
//! request time.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Which pipeline variant a form runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Primary,
    Secondary,
}

/// Named groups of form-field names used to build search queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchKeys {
    pub inn: Vec<String>,
    pub company: Vec<String>,
    pub phone: Vec<String>,
    pub email: Vec<String>,
}

/// One form's mapping configuration
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Form identifier this entry is keyed by
    pub name: String,
    pub kind: MappingKind,
    /// form-field name -> CRM deal-field code, in declaration order
    pub deal_fields: Vec<(String, String)>,
    /// form-field name -> CRM contact-field code; PHONE/EMAIL get multifield formatting
    pub contact_fields: Vec<(String, String)>,
    /// participation-type label -> CRM UF-field code, in declaration order
    pub file_fields: Vec<(String, String)>,
    /// Form field holding the delimited participation-label list
    pub participation_field: String,
    pub search: SearchKeys,
}

impl MappingEntry {
    pub fn is_primary(&self) -> bool {
        self.kind == MappingKind::Primary
    }

    /// Form fields mapped onto one CRM deal-field code
    fn deal_fields_for_code(&self, code: &str) -> Vec<String> {
        self.deal_fields
            .iter()
            .filter(|(_, c)| c == code)
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Form fields mapped onto one CRM contact-field code
    fn contact_fields_for_code(&self, code: &str) -> Vec<String> {
        self.contact_fields
            .iter()
            .filter(|(_, c)| c == code)
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// UF-field code configured for a participation label
    pub fn file_field_code(&self, label: &str) -> Option<&str> {
        self.file_fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, code)| code.as_str())
    }
}

/// Registry of all configured form mappings, read-only after load
#[derive(Debug, Default)]
pub struct MappingRegistry {
    entries: HashMap<String, MappingEntry>,
}

impl MappingRegistry {
    /// Load the registry from a JSON file; any malformed entry is fatal
    pub fn load(path: &Path, config: &ServerConfig) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ServerError::MappingError(format!("Cannot read mapping file {}: {}", path.display(), e))
        })?;
        let data: Value = serde_json::from_str(&raw)
            .map_err(|e| ServerError::MappingError(format!("Mapping file is not valid JSON: {}", e)))?;

        let registry = Self::from_value(data, config)?;
        info!(forms = registry.entries.len(), "Loaded form mapping registry");
        Ok(registry)
    }

    /// Build the registry from an already parsed JSON document
    pub fn from_value(data: Value, config: &ServerConfig) -> ServerResult<Self> {
        let Value::Object(forms) = data else {
            return Err(ServerError::MappingError(
                "Mapping file must contain an object at the top level".to_string(),
            ));
        };

        let mut entries = HashMap::new();
        for (name, raw) in forms {
            let entry = parse_entry(&name, raw, config)?;
            entries.insert(name, entry);
        }
        Ok(Self { entries })
    }

    /// Resolve a form identifier to its mapping entry
    pub fn resolve(&self, form_id: &str) -> Option<&MappingEntry> {
        self.entries.get(form_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one form entry.
///
/// Two accepted shapes: a flat object of string pairs (shorthand for the
/// deal fields of a primary entry) or the full structured form.
fn parse_entry(name: &str, raw: Value, config: &ServerConfig) -> ServerResult<MappingEntry> {
    let Value::Object(raw) = raw else {
        return Err(ServerError::MappingError(format!(
            "Form '{}': entry must be an object",
            name
        )));
    };

    let is_shorthand = !raw.is_empty() && raw.values().all(Value::is_string);
    if is_shorthand {
        let deal_fields = string_pairs(name, "deal_fields", &Value::Object(raw))?;
        let mut entry = MappingEntry {
            name: name.to_string(),
            kind: MappingKind::Primary,
            deal_fields,
            contact_fields: Vec::new(),
            file_fields: Vec::new(),
            participation_field: "format".to_string(),
            search: SearchKeys::default(),
        };
        entry.search = build_search_keys(&entry, None, config)?;
        validate_search_keys(&entry)?;
        return Ok(entry);
    }

    let kind = match raw.get("kind").and_then(Value::as_str).unwrap_or("primary") {
        "primary" => MappingKind::Primary,
        "secondary" => MappingKind::Secondary,
        other => {
            return Err(ServerError::MappingError(format!(
                "Form '{}': unknown kind '{}'",
                name, other
            )))
        }
    };

    let deal_fields = raw
        .get("deal_fields")
        .or_else(|| raw.get("fields"))
        .map(|v| string_pairs(name, "deal_fields", v))
        .transpose()?
        .unwrap_or_default();
    let contact_fields = raw
        .get("contact_fields")
        .or_else(|| raw.get("contact"))
        .map(|v| string_pairs(name, "contact_fields", v))
        .transpose()?
        .unwrap_or_default();
    let file_fields = raw
        .get("file_fields")
        .or_else(|| raw.get("attachments"))
        .map(|v| string_pairs(name, "file_fields", v))
        .transpose()?
        .unwrap_or_default();
    let participation_field = raw
        .get("participation_field")
        .and_then(Value::as_str)
        .unwrap_or("format")
        .to_string();

    let mut entry = MappingEntry {
        name: name.to_string(),
        kind,
        deal_fields,
        contact_fields,
        file_fields,
        participation_field,
        search: SearchKeys::default(),
    };
    entry.search = build_search_keys(&entry, raw.get("search"), config)?;
    validate_search_keys(&entry)?;
    Ok(entry)
}

/// Extract an ordered list of string pairs from an object value
fn string_pairs(form: &str, section: &str, value: &Value) -> ServerResult<Vec<(String, String)>> {
    let Value::Object(map) = value else {
        return Err(ServerError::MappingError(format!(
            "Form '{}': {} must be an object",
            form, section
        )));
    };

    let mut pairs = Vec::with_capacity(map.len());
    for (key, value) in map {
        let Some(value) = value.as_str() else {
            return Err(ServerError::MappingError(format!(
                "Form '{}': {}.{} must be a string",
                form, section, key
            )));
        };
        pairs.push((key.clone(), value.to_string()));
    }
    Ok(pairs)
}

/// A search group is a single string or an array of strings
fn key_list(form: &str, group: &str, value: &Value) -> ServerResult<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    ServerError::MappingError(format!(
                        "Form '{}': search.{} must contain only strings",
                        form, group
                    ))
                })
            })
            .collect(),
        _ => Err(ServerError::MappingError(format!(
            "Form '{}': search.{} must be a string or an array of strings",
            form, group
        ))),
    }
}

/// Build the search keys, falling back to the fields mapped onto the
/// well-known CRM codes when a group is not configured explicitly.
fn build_search_keys(
    entry: &MappingEntry,
    search: Option<&Value>,
    config: &ServerConfig,
) -> ServerResult<SearchKeys> {
    let empty = serde_json::Map::new();
    let search = match search {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ServerError::MappingError(format!(
                "Form '{}': search must be an object",
                entry.name
            )))
        }
    };

    let group = |name: &str, fallback: Vec<String>| -> ServerResult<Vec<String>> {
        match search.get(name) {
            Some(value) => key_list(&entry.name, name, value),
            None => Ok(fallback),
        }
    };

    Ok(SearchKeys {
        inn: group("inn", entry.deal_fields_for_code(&config.inn_field))?,
        company: group("company", entry.deal_fields_for_code(&config.title_field))?,
        phone: group("phone", entry.contact_fields_for_code("PHONE"))?,
        email: group("email", entry.contact_fields_for_code("EMAIL"))?,
    })
}

/// Every search key must be a mapped form field, otherwise the search would
/// silently never match anything.
fn validate_search_keys(entry: &MappingEntry) -> ServerResult<()> {
    let known = |field: &String| {
        entry.deal_fields.iter().any(|(f, _)| f == field)
            || entry.contact_fields.iter().any(|(f, _)| f == field)
    };

    for (group, keys) in [
        ("inn", &entry.search.inn),
        ("company", &entry.search.company),
        ("phone", &entry.search.phone),
        ("email", &entry.search.email),
    ] {
        if let Some(unknown) = keys.iter().find(|k| !known(k)) {
            return Err(ServerError::MappingError(format!(
                "Form '{}': search.{} references unmapped field '{}'",
                entry.name, group, unknown
            )));
        }
    }
    Ok(())
}
