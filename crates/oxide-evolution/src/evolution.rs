//! Authored evolutions.
//!
//! An evolution is a labelled, ordered list of mutations. On disk each one
//! is a JSON file at `<evolutions_dir>/<app>/<label>.json`; file-name order
//! is sequence order, so labels are usually numbered (`0001_initial`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EvolutionError, Result};
use crate::mutations::MutationSpec;

/// A named mutation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evolution {
    /// Label, unique within its application.
    #[serde(default)]
    pub label: String,
    /// Mutations, applied in order.
    #[serde(default)]
    pub mutations: Vec<MutationSpec>,
    /// Free-form notes, such as review markers from the hint generator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Evolution {
    /// Creates an empty evolution.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            mutations: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Appends a mutation.
    #[must_use]
    pub fn mutation(mut self, mutation: MutationSpec) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Appends mutations.
    #[must_use]
    pub fn mutations(mut self, mutations: impl IntoIterator<Item = MutationSpec>) -> Self {
        self.mutations.extend(mutations);
        self
    }

    /// Appends a note.
    #[must_use]
    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Returns true if this evolution removes `app` entirely.
    #[must_use]
    pub fn deletes_application(&self, app: &str) -> bool {
        self.mutations
            .iter()
            .any(|m| matches!(m, MutationSpec::DeleteApplication { app: a } if a == app))
    }

    /// Serializes the evolution to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads an evolution file; the label defaults to the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut evolution: Self =
            serde_json::from_str(&content).map_err(|e| EvolutionError::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if evolution.label.is_empty() {
            evolution.label = label_of(path).ok_or_else(|| EvolutionError::ParseError {
                path: path.to_path_buf(),
                message: "file name is not a valid label".to_string(),
            })?;
        }
        Ok(evolution)
    }
}

fn label_of(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

/// Returns the directory holding the evolutions of `app`.
#[must_use]
pub fn app_dir(dir: &Path, app: &str) -> PathBuf {
    dir.join(app)
}

/// Loads the evolutions of `app` from `dir`, in file-name order.
///
/// A missing application directory means the application has no authored
/// evolutions yet.
pub fn load_evolutions(dir: &Path, app: &str) -> Result<Vec<Evolution>> {
    let app_dir = app_dir(dir, app);
    if !app_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(&app_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let evolutions = paths
        .iter()
        .map(|path| Evolution::from_file(path))
        .collect::<Result<Vec<_>>>()?;
    debug!(app = %app, count = evolutions.len(), "Loaded evolutions");
    Ok(evolutions)
}

/// Writes `evolution` to `<dir>/<app>/<label>.json`, creating directories as
/// needed, and returns the path written.
pub fn write_evolution(dir: &Path, app: &str, evolution: &Evolution) -> Result<PathBuf> {
    let app_dir = app_dir(dir, app);
    fs::create_dir_all(&app_dir)?;
    let path = app_dir.join(format!("{}.json", evolution.label));
    fs::write(&path, evolution.to_json()?)?;
    Ok(path)
}

/// Returns the label following the evolutions already present, such as
/// `0003_auto` after two files.
#[must_use]
pub fn next_label(existing: &[Evolution], name: &str) -> String {
    format!("{:04}_{}", existing.len() + 1, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{FieldSignature, FieldType};
    use tempfile::TempDir;

    fn add_body() -> MutationSpec {
        MutationSpec::add_field("blog", "Post", FieldSignature::new("body", FieldType::Text).null(true))
    }

    #[test]
    fn test_load_in_file_name_order() {
        let dir = TempDir::new().unwrap();
        let first = Evolution::new("0001_body").mutation(add_body());
        let second = Evolution::new("0002_drop").mutation(MutationSpec::delete_field("blog", "Post", "body"));
        write_evolution(dir.path(), "blog", &second).unwrap();
        write_evolution(dir.path(), "blog", &first).unwrap();

        let loaded = load_evolutions(dir.path(), "blog").unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn test_missing_app_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_evolutions(dir.path(), "blog").unwrap().is_empty());
    }

    #[test]
    fn test_label_defaults_to_file_stem() {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("blog");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(
            app_dir.join("0001_initial.json"),
            r#"{"mutations": [{"type": "DeleteModel", "app": "blog", "model": "Draft"}]}"#,
        )
        .unwrap();
        fs::write(app_dir.join("README.txt"), "ignored").unwrap();

        let loaded = load_evolutions(dir.path(), "blog").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].label, "0001_initial");
        assert_eq!(loaded[0].mutations, vec![MutationSpec::delete_model("blog", "Draft")]);
    }

    #[test]
    fn test_parse_error_names_the_file() {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("blog");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(app_dir.join("0001_bad.json"), "{not json").unwrap();

        let err = load_evolutions(dir.path(), "blog").unwrap_err();
        assert!(matches!(err, EvolutionError::ParseError { path, .. } if path.ends_with("0001_bad.json")));
    }

    #[test]
    fn test_deletes_application_and_next_label() {
        let evolution = Evolution::new("0002_remove").mutation(MutationSpec::delete_application("blog"));
        assert!(evolution.deletes_application("blog"));
        assert!(!evolution.deletes_application("auth"));
        assert_eq!(next_label(&[evolution], "auto"), "0002_auto");
    }
}
