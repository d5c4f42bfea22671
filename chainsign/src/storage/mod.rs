// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Storage backends for signed payloads.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::{
    config::Config,
    error::{PipelineError, StorageError},
    formats::PayloadType,
    record::BuildRecord,
};

pub mod directory;

/// Metadata stored alongside a signed payload.
///
/// The same options are given to every backend storing a particular signed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// The object's key, unique within its build record.
    pub key: String,
    /// The PEM-encoded signing certificate, if the signer has one.
    pub cert: Option<String>,
    /// The PEM-encoded certificate chain, if the signer has one.
    pub chain: Option<String>,
    pub payload_format: PayloadType,
}

/// Somewhere signed payloads can be stored.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The name used to select this backend in the artifact configuration.
    fn name(&self) -> &str;

    async fn store_payload(
        &self,
        record: &BuildRecord,
        raw_payload: &[u8],
        signature: &[u8],
        opts: &StorageOptions,
    ) -> Result<(), StorageError>;
}

/// The available storage backends, keyed by name.
#[derive(Clone, Default)]
pub struct StorageBackends {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
}

impl StorageBackends {
    /// The built-in backends.
    pub fn new(config: &Config) -> Self {
        [Arc::new(directory::DirectoryBackend::new(&config.storage.directory))
            as Arc<dyn StorageBackend>]
        .into_iter()
        .collect()
    }

    /// Add or replace a backend.
    pub fn insert(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(name).cloned()
    }
}

impl FromIterator<Arc<dyn StorageBackend>> for StorageBackends {
    fn from_iter<T: IntoIterator<Item = Arc<dyn StorageBackend>>>(iter: T) -> Self {
        let mut backends = StorageBackends::default();
        for backend in iter {
            backends.insert(backend);
        }
        backends
    }
}

impl std::fmt::Debug for StorageBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.backends.keys()).finish()
    }
}

/// Store one signed payload in every named backend.
///
/// Backends run concurrently and independently; one failing does not stop the others. Every
/// failure is returned, each naming its backend. Dropping the returned future aborts any
/// backends still running.
pub async fn fan_out(
    backends: &StorageBackends,
    names: &[String],
    record: &Arc<BuildRecord>,
    raw_payload: Bytes,
    signature: Bytes,
    opts: Arc<StorageOptions>,
) -> Vec<PipelineError> {
    let mut errors = vec![];
    let mut tasks = JoinSet::new();
    let mut pending = BTreeSet::new();

    for name in names {
        let Some(backend) = backends.get(name) else {
            tracing::error!(backend = %name, key = %opts.key, "No such storage backend");
            errors.push(PipelineError::UnknownBackend {
                backend: name.clone(),
                key: opts.key.clone(),
            });
            continue;
        };
        pending.insert(name.clone());

        let name = name.clone();
        let record = record.clone();
        let raw_payload = raw_payload.clone();
        let signature = signature.clone();
        let opts = opts.clone();
        let span = tracing::info_span!("store", backend = %name);
        tasks.spawn(
            async move {
                let result = backend
                    .store_payload(&record, &raw_payload, &signature, &opts)
                    .await;
                (name, result)
            }
            .instrument(span),
        );
    }

    let mut task_failures = vec![];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, result)) => {
                pending.remove(&name);
                match result {
                    Ok(()) => {
                        tracing::info!(backend = %name, key = %opts.key, "Stored signed payload");
                    }
                    Err(error) => {
                        tracing::error!(backend = %name, key = %opts.key, %error, "Failed to store signed payload");
                        errors.push(PipelineError::Storage {
                            backend: name,
                            key: opts.key.clone(),
                            source: error,
                        });
                    }
                }
            }
            Err(error) => task_failures.push(error),
        }
    }

    // A task that panicked never reported its name; pair the failures with the backends that
    // never finished.
    for (name, error) in pending.into_iter().zip(task_failures) {
        tracing::error!(backend = %name, key = %opts.key, %error, "Storage task failed");
        errors.push(PipelineError::Storage {
            backend: name,
            key: opts.key.clone(),
            source: error.into(),
        });
    }

    errors
}
