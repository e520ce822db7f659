//! Catalog of recognised device models.
//!
//! The catalog maps an image file name or a probed device signature to a
//! `(model, type)` pair. Entries are kept in file order and the first
//! matching entry wins, regardless of any later entry being more
//! specific.

use std::path::Path;

use ini::Ini;

use crate::{
    error::{Error, Result},
    pattern,
};

/// One catalog row. The section name carries the device model; the three
/// remaining fields are all required and nothing else is allowed in the
/// section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub device_model: String,
    pub device_type: String,
    pub device_regex: String,
    pub file_name_regex: String,
}

/// Ordered set of [`CatalogEntry`], loaded once from disk.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

enum SearchKey {
    DeviceRegex,
    FileNameRegex,
}

impl Catalog {
    /// Load the catalog. A malformed file, a missing field or an unknown
    /// field fails the whole load; there is no partial catalog.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).map_err(|e| Error::config(path, e.to_string()))?;

        let mut entries = Vec::new();
        for (section, props) in ini.iter() {
            let Some(model) = section else { continue };
            let mut field = |key: &str| -> Result<String> {
                match props.get(key) {
                    Some(v) if !v.is_empty() => Ok(v.to_owned()),
                    Some(_) => Err(Error::config(
                        path,
                        format!("empty {key:?} in catalog entry {model:?}"),
                    )),
                    None => Err(Error::config(
                        path,
                        format!("missing {key:?} in catalog entry {model:?}"),
                    )),
                }
            };
            let entry = CatalogEntry {
                device_model: model.to_owned(),
                device_type: field("device_type")?,
                device_regex: field("device_regex")?,
                file_name_regex: field("file_name_regex")?,
            };
            if let Some((unknown, _)) = props
                .iter()
                .find(|(k, _)| !matches!(*k, "device_type" | "device_regex" | "file_name_regex"))
            {
                return Err(Error::config(
                    path,
                    format!("unknown field {unknown:?} in catalog entry {model:?}"),
                ));
            }
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// First entry whose `device_model` equals `model`.
    pub fn entry_for_model(&self, model: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.device_model == model)
    }

    fn search(&self, key: SearchKey, value: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| {
            let regex = match key {
                SearchKey::DeviceRegex => &entry.device_regex,
                SearchKey::FileNameRegex => &entry.file_name_regex,
            };
            match pattern::matches_start(regex, value) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::warn!("Skipping catalog entry {}: {e}", entry.device_model);
                    false
                }
            }
        })
    }

    /// Resolve `(model, type)` from an image file name. `None` means the
    /// image is not recognised, which callers may treat as "unsupported"
    /// rather than an error.
    pub fn model_and_type_by_file_name(&self, file_name: &str) -> Option<(String, String)> {
        self.search(SearchKey::FileNameRegex, file_name)
            .map(|e| (e.device_model.clone(), e.device_type.clone()))
    }

    /// Resolve `(model, type)` from a probed device signature. Multiple
    /// fragments are concatenated, without separators, into the string
    /// the entry patterns run against.
    pub fn model_and_type_by_signature<S: AsRef<str>>(
        &self,
        fragments: &[S],
    ) -> Option<(String, String)> {
        let signature: String = fragments.iter().map(AsRef::as_ref).collect();
        self.search(SearchKey::DeviceRegex, &signature)
            .map(|e| (e.device_model.clone(), e.device_type.clone()))
    }
}
