// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the signing pipeline and the backends it drives.

use crate::{formats::PayloadType, signing::SignerType};

/// Errors a [`crate::signing::Signer`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignerError {
    /// An OpenSSL operation failed.
    ///
    /// This usually means the key material is unusable with the requested operation, for
    /// example because the key algorithm is not supported by the system OpenSSL.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Reading key material failed.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The signed envelope could not be serialized.
    #[error("failed to serialize the signature envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking signing task panicked or was cancelled by the runtime.
    #[error("the signing task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Generic error from a signer implementation.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Errors a [`crate::formats::Payloader`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FormatError {
    /// The formatter does not know how to format this kind of object.
    ///
    /// This is a configuration problem: the artifact kind was configured with a format that
    /// cannot represent it.
    #[error("the {format} format cannot represent a {object} object")]
    UnsupportedObject {
        format: PayloadType,
        object: &'static str,
    },

    /// The object was understood but some field is unusable.
    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("failed to serialize the payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors a [`crate::storage::StorageBackend`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize stored metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage task panicked or was aborted.
    #[error("the storage task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Generic error from a storage implementation.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Errors a [`crate::transparency::TransparencyLog`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransparencyError {
    /// Uploading was required for the record but no log client was provided.
    #[error("no transparency log client is configured")]
    NotConfigured,

    /// The log rejected the entry.
    #[error("the transparency log rejected the entry: {0}")]
    Rejected(String),

    /// Generic error from a log client implementation.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Errors a [`crate::record::RecordStore`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RecordStoreError {
    /// The record no longer exists in the store.
    #[error("build record {namespace}/{name} was not found")]
    NotFound { namespace: String, name: String },

    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize the build record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error from a record store implementation.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// The reason an object was abandoned before it reached storage.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SkipReason {
    #[error("no {0} formatter is available")]
    MissingFormatter(PayloadType),

    #[error("payload creation failed: {0}")]
    Format(#[source] FormatError),

    #[error("no {0} signer is available")]
    MissingSigner(SignerType),

    #[error("failed to serialize the payload: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("signing failed: {0}")]
    Signing(#[source] SignerError),
}

/// A single failure recorded while signing one build record.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The object was not signed.
    #[error("object {key} was skipped: {reason}")]
    Skipped {
        key: String,
        #[source]
        reason: SkipReason,
    },

    /// A storage backend failed to store a signed object.
    #[error("storage backend {backend} failed to store {key}: {source}")]
    Storage {
        backend: String,
        key: String,
        #[source]
        source: StorageError,
    },

    /// The artifact configuration references a backend that does not exist.
    #[error("no storage backend named {backend} is available to store {key}")]
    UnknownBackend { backend: String, key: String },

    /// Uploading a signature to the transparency log failed.
    #[error("transparency log upload for {key} failed: {source}")]
    Transparency {
        key: String,
        #[source]
        source: TransparencyError,
    },

    /// Recording the outcome on the build record failed.
    #[error("failed to update the build record annotations: {0}")]
    Patch(#[source] RecordStoreError),
}

/// Every failure from one signing run, in the order they occurred.
#[derive(Debug, Default)]
pub struct Errors(Vec<PipelineError>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: PipelineError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PipelineError> {
        self.0.iter()
    }
}

impl Extend<PipelineError> for Errors {
    fn extend<T: IntoIterator<Item = PipelineError>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Errors {
    type Item = PipelineError;
    type IntoIter = std::vec::IntoIter<PipelineError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Errors {
    type Item = &'a PipelineError;
    type IntoIter = std::slice::Iter<'a, PipelineError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.len() {
            1 => write!(f, "1 error occurred:")?,
            n => write!(f, "{n} errors occurred:")?,
        }
        for error in &self.0 {
            write!(f, "\n\t* {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

/// Errors [`crate::signer::RecordSigner::sign`] may return.
///
/// When this is returned the annotations on the build record are authoritative: a
/// [`Error::Pipeline`] means the record was moved to the retry or failed state (unless the final
/// patch is itself among the errors), while [`Error::Wrap`] and [`Error::Cancelled`] leave the
/// record untouched.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The signer could not be wrapped in a signing envelope.
    ///
    /// This indicates a problem with the signer configuration rather than with any object, so
    /// the run is aborted.
    #[error("failed to wrap the signer in an envelope: {0}")]
    Wrap(#[source] SignerError),

    /// The run was cancelled before the outcome was recorded.
    #[error("signing was cancelled")]
    Cancelled,

    /// One or more objects failed to sign, store, or upload.
    #[error(transparent)]
    Pipeline(#[from] Errors),
}

impl Error {
    /// The individual failures, if the run got far enough to collect any.
    pub fn errors(&self) -> Option<&Errors> {
        match self {
            Error::Pipeline(errors) => Some(errors),
            _ => None,
        }
    }
}
