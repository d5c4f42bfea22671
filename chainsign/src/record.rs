// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Build records and the store that persists their annotations.
//!
//! A build record is owned by an external control plane. The signing engine only reads it and
//! requests annotation patches; it never replaces or deletes a record.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::RecordStoreError;

/// A completed build whose artifacts should be signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub namespace: String,
    pub name: String,
    /// A unique identifier for this record; the build record's own signature is keyed by it.
    pub uid: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// The task definition this build ran, if known.
    #[serde(default)]
    pub task_ref: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub results: Vec<BuildResult>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// RFC 3339 timestamps.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub completion_time: Option<String>,
}

impl BuildRecord {
    /// Look up a result value by name.
    pub fn result(&self, name: &str) -> Option<&str> {
        self.results
            .iter()
            .find(|result| result.name == name)
            .map(|result| result.value.as_str())
    }

    /// Apply an annotation patch to this in-memory copy of the record.
    pub fn apply_patch(&mut self, patch: &AnnotationPatch) {
        patch.apply(&mut self.annotations);
    }
}

impl std::fmt::Display for BuildRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A named value the build produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub name: String,
    pub value: String,
}

/// A step of the build and the image it ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    /// The digest-qualified image reference, e.g. `registry/image@sha256:...`.
    pub image_id: String,
}

/// A change to a record's annotations.
///
/// Keys in `set` are written, keys in `remove` are deleted. Applying the same patch more than
/// once has the same effect as applying it once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPatch {
    pub set: BTreeMap<String, String>,
    pub remove: BTreeSet<String>,
}

impl AnnotationPatch {
    pub fn apply(&self, annotations: &mut BTreeMap<String, String>) {
        for key in &self.remove {
            annotations.remove(key);
        }
        annotations.extend(
            self.set
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }
}

/// The external store that owns build records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist an annotation patch on the given record.
    async fn patch_annotations(
        &self,
        record: &BuildRecord,
        patch: &AnnotationPatch,
    ) -> Result<(), RecordStoreError>;
}

/// A record store backed by a single JSON-encoded build record on disk.
///
/// Patches are applied by reading the file, updating the annotations, and atomically replacing
/// the file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the record stored in the file.
    pub async fn load(&self) -> Result<BuildRecord, RecordStoreError> {
        let contents = tokio::fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    #[instrument(skip_all, err, fields(path = %self.path.display(), record = %record))]
    async fn patch_annotations(
        &self,
        record: &BuildRecord,
        patch: &AnnotationPatch,
    ) -> Result<(), RecordStoreError> {
        let mut stored = self.load().await?;
        if stored.namespace != record.namespace || stored.name != record.name {
            return Err(RecordStoreError::NotFound {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
            });
        }
        stored.apply_patch(patch);

        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, serde_json::to_vec_pretty(&stored)?).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        tracing::debug!(?patch, "Patched build record annotations");

        Ok(())
    }
}
