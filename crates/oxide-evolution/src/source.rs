//! Sources of the declared project signature.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EvolutionError, Result};
use crate::signature::ProjectSignature;

/// Something that can describe the models the project currently declares.
pub trait SignatureSource {
    /// Returns the declared signature.
    fn current_signature(&self) -> Result<ProjectSignature>;
}

impl SignatureSource for ProjectSignature {
    fn current_signature(&self) -> Result<ProjectSignature> {
        Ok(self.clone())
    }
}

/// Reads the declared signature from a JSON document, such as one exported
/// by the application at build time.
#[derive(Debug, Clone)]
pub struct JsonSignatureSource {
    path: PathBuf,
}

impl JsonSignatureSource {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path read by this source.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SignatureSource for JsonSignatureSource {
    fn current_signature(&self) -> Result<ProjectSignature> {
        let content = fs::read_to_string(&self.path)?;
        ProjectSignature::from_json(&content).map_err(|e| match e {
            EvolutionError::Serialization(e) => EvolutionError::ParseError {
                path: self.path.clone(),
                message: e.to_string(),
            },
            other => other,
        })
    }
}
