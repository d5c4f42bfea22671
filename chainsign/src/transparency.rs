// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Transparency log uploads.
//!
//! Uploading is best effort: a failed upload is reported as a pipeline error, but never prevents
//! the signed payload from being stored.

use async_trait::async_trait;

use crate::{
    config::{Config, TransparencyMode},
    error::TransparencyError,
    formats::PayloadType,
    record::BuildRecord,
    signing::Signer,
};

/// Set on a build record to the URL of its transparency log entry.
pub const TRANSPARENCY_ANNOTATION: &str = "chains.tekton.dev/transparency";
/// Set to `"true"` on a build record to request an upload when the mode is
/// [`TransparencyMode::Manual`].
pub const UPLOAD_ANNOTATION: &str = "chains.tekton.dev/transparency-upload";

/// An entry created in the transparency log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub log_index: u64,
    /// The log's identifier for the entry, if it reports one.
    pub uuid: Option<String>,
}

/// A transparency log client.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    async fn upload(
        &self,
        signer: &dyn Signer,
        signature: &[u8],
        raw_payload: &[u8],
        cert: Option<&str>,
        payload_format: PayloadType,
    ) -> Result<LogEntry, TransparencyError>;
}

/// Whether signatures for this record should be uploaded.
pub fn should_upload(config: &Config, record: &BuildRecord) -> bool {
    match config.transparency.mode {
        TransparencyMode::Disabled => false,
        TransparencyMode::Enabled => true,
        TransparencyMode::Manual => record
            .annotations
            .get(UPLOAD_ANNOTATION)
            .is_some_and(|value| value == "true"),
    }
}

/// The URL where an entry can be looked up.
pub fn verification_url(base_url: &str, log_index: u64) -> String {
    format!(
        "{}/api/v1/log/entries?logIndex={log_index}",
        base_url.trim_end_matches('/')
    )
}
