// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Store signed payloads as files in a local directory.
//!
//! Each signed object is written beneath `<path>/<namespace>/<name>/` as
//! `<key>.<format>.payload` and `<key>.<format>.sig`, plus `.cert` and `.chain` files when the
//! signer provides them.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    config,
    error::StorageError,
    record::BuildRecord,
    storage::{StorageBackend, StorageOptions},
};

/// The name used to select this backend in the artifact configuration.
pub const NAME: &str = "directory";

#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(config: &config::Directory) -> Self {
        Self {
            root: config.path.clone(),
        }
    }

    /// The directory the given record's signed payloads are written to.
    pub fn record_dir(&self, record: &BuildRecord) -> Result<PathBuf, StorageError> {
        Ok(self
            .root
            .join(path_segment(&record.namespace)?)
            .join(path_segment(&record.name)?))
    }
}

// Every part of the path comes from the build record, so refuse anything that isn't a single
// normal path component.
fn path_segment(segment: &str) -> Result<&Path, StorageError> {
    let path = Path::new(segment);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(path),
        _ => Err(anyhow::anyhow!("{segment:?} cannot be used as a path segment").into()),
    }
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(skip_all, err, fields(record = %record, key = %opts.key))]
    async fn store_payload(
        &self,
        record: &BuildRecord,
        raw_payload: &[u8],
        signature: &[u8],
        opts: &StorageOptions,
    ) -> Result<(), StorageError> {
        let directory = self.record_dir(record)?;
        let stem = path_segment(&opts.key)?;
        let stem = format!("{}.{}", stem.display(), opts.payload_format);
        tokio::fs::create_dir_all(&directory).await?;

        tokio::fs::write(directory.join(format!("{stem}.payload")), raw_payload).await?;
        tokio::fs::write(directory.join(format!("{stem}.sig")), signature).await?;
        if let Some(cert) = &opts.cert {
            tokio::fs::write(directory.join(format!("{stem}.cert")), cert).await?;
        }
        if let Some(chain) = &opts.chain {
            tokio::fs::write(directory.join(format!("{stem}.chain")), chain).await?;
        }
        tracing::debug!(directory = %directory.display(), "Wrote signed payload");

        Ok(())
    }
}
