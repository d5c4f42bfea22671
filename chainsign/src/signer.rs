// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing pipeline for a single build record.
//!
//! For every enabled [`Signable`] and every object it extracts, the [`RecordSigner`] formats the
//! object, signs the payload (inside a signing envelope when the format asks for one), stores the
//! result in each configured backend, and optionally uploads the signature to a transparency log.
//! Failures for one object never stop the others; they are collected and, once every object has
//! been attempted, the outcome is written to the record in a single annotation patch.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    artifacts::{self, Signable, SignableObject},
    config::Config,
    error::{Error, Errors, PipelineError, SkipReason, TransparencyError},
    formats::Formatters,
    record::{BuildRecord, RecordStore},
    signing::{envelope, SignerBackends, Signers},
    state::{self, Outcome, SigningState},
    storage::{self, StorageBackends, StorageOptions},
    transparency::{self, TransparencyLog, TRANSPARENCY_ANNOTATION},
};

/// Signs build records.
///
/// A `RecordSigner` holds only shared, read-only state, so a single instance can sign any number
/// of records concurrently.
pub struct RecordSigner {
    config: Arc<Config>,
    formatters: Formatters,
    storage: StorageBackends,
    signer_backends: SignerBackends,
    signables: Vec<Box<dyn Signable>>,
    record_store: Arc<dyn RecordStore>,
    transparency: Option<Arc<dyn TransparencyLog>>,
}

impl RecordSigner {
    /// Create a signer with the built-in formatters, signers, storage backends, and artifact
    /// kinds.
    ///
    /// Outcomes are written to `record_store`. No transparency log client is set; use
    /// [`RecordSigner::with_transparency_log`] if the configuration enables uploads.
    pub fn new(config: Config, record_store: Arc<dyn RecordStore>) -> Self {
        let formatters = Formatters::new(&config);
        let storage = StorageBackends::new(&config);
        Self {
            config: Arc::new(config),
            formatters,
            storage,
            signer_backends: SignerBackends::default(),
            signables: artifacts::all(),
            record_store,
            transparency: None,
        }
    }

    pub fn with_formatters(mut self, formatters: Formatters) -> Self {
        self.formatters = formatters;
        self
    }

    pub fn with_storage(mut self, storage: StorageBackends) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the constructors used to build the signers at the start of each run.
    pub fn with_signer_backends(mut self, signer_backends: SignerBackends) -> Self {
        self.signer_backends = signer_backends;
        self
    }

    /// Replace the artifact kinds; objects are signed in the order the kinds are given.
    pub fn with_signables(mut self, signables: Vec<Box<dyn Signable>>) -> Self {
        self.signables = signables;
        self
    }

    pub fn with_transparency_log(mut self, log: Arc<dyn TransparencyLog>) -> Self {
        self.transparency = Some(log);
        self
    }

    /// Sign every enabled artifact in the record and record the outcome on it.
    ///
    /// Records that are already signed or failed are left alone. Otherwise the record ends the
    /// call as signed (when `Ok(())` is returned), or as retrying or failed according to the
    /// retry policy (when [`Error::Pipeline`] is returned).
    ///
    /// # Errors
    ///
    /// - [`Error::Pipeline`] with every failure from the run, including a failed annotation patch.
    /// - [`Error::Wrap`] if a signer could not be wrapped in a signing envelope. The record is not
    ///   updated.
    /// - [`Error::Cancelled`] if `cancel` fired before the outcome was recorded. The record is not
    ///   updated, although some signed payloads may already have been stored.
    #[instrument(skip_all, err, fields(record = %record, run_id = %uuid::Uuid::now_v7()))]
    pub async fn sign(&self, cancel: &CancellationToken, record: &BuildRecord) -> Result<(), Error> {
        let current = SigningState::from_annotations(&record.annotations);
        if current.is_terminal() {
            tracing::info!(state = %current, "Build record is already in a terminal state; skipping");
            return Ok(());
        }

        let signers = self.build_signers(cancel).await?;
        tracing::debug!(?signers, "Configured signers for this run");
        let shared_record = Arc::new(record.clone());
        let mut run = Run::default();

        for signable in &self.signables {
            if !signable.enabled(&self.config) {
                tracing::debug!(kind = signable.kind(), "Artifact kind has no storage configured; skipping");
                continue;
            }
            let objects = signable.extract_objects(record);
            tracing::debug!(
                kind = signable.kind(),
                objects = objects.len(),
                "Extracted signable objects"
            );
            for object in &objects {
                self.sign_object(
                    cancel,
                    signable.as_ref(),
                    &signers,
                    &shared_record,
                    object,
                    &mut run,
                )
                .await?;
            }
        }

        let outcome = if run.errors.is_empty() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let persisted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = state::persist(
                self.record_store.as_ref(),
                record,
                outcome,
                &self.config.retry,
                &run.annotations,
            ) => result,
        };
        match persisted {
            Ok(SigningState::Signed) => tracing::info!("Build record signed"),
            Ok(state) => {
                tracing::warn!(%state, errors = run.errors.len(), "Build record failed to sign");
            }
            Err(error) => {
                tracing::error!(%error, "Failed to record the signing outcome");
                run.errors.push(PipelineError::Patch(error));
            }
        }

        if run.errors.is_empty() {
            Ok(())
        } else {
            Err(run.errors.into())
        }
    }

    /// Build this run's signers on the blocking pool; constructors may read key material from disk.
    ///
    /// A constructor that panics leaves the run without signers, so every object is skipped.
    async fn build_signers(&self, cancel: &CancellationToken) -> Result<Signers, Error> {
        let config = self.config.clone();
        let backends = self.signer_backends.clone();
        let span = tracing::Span::current();
        let task = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            Signers::new(&config, &backends)
        });

        let signers = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            signers = task => signers,
        };
        Ok(signers.unwrap_or_else(|error| {
            tracing::error!(%error, "Building the signers panicked; continuing without signers");
            Signers::default()
        }))
    }

    /// Format, sign, store, and upload one object.
    ///
    /// Per-object failures are recorded in `run`; only failures that abort the whole run are
    /// returned.
    #[instrument(skip_all, fields(kind = signable.kind(), object = object.kind()))]
    async fn sign_object(
        &self,
        cancel: &CancellationToken,
        signable: &dyn Signable,
        signers: &Signers,
        record: &Arc<BuildRecord>,
        object: &SignableObject<'_>,
        run: &mut Run,
    ) -> Result<(), Error> {
        let key = signable.key(object);
        let payload_type = signable.payload_format(&self.config);

        let Some(payloader) = self.formatters.get(payload_type) else {
            run.skip(key, SkipReason::MissingFormatter(payload_type));
            return Ok(());
        };
        let payload = match payloader.create_payload(object) {
            Ok(payload) => payload,
            Err(error) => {
                run.skip(key, SkipReason::Format(error));
                return Ok(());
            }
        };

        let signer_type = signable.signer(&self.config);
        let Some(mut signer) = signers.get(signer_type) else {
            run.skip(key, SkipReason::MissingSigner(signer_type));
            return Ok(());
        };
        if payloader.wrap() {
            signer = envelope::wrap(signer, payload_type.media_type()).map_err(|error| {
                tracing::error!(%error, %signer_type, "Failed to wrap signer in an envelope");
                Error::Wrap(error)
            })?;
        }

        let raw_payload = match serde_json::to_vec(&payload) {
            Ok(raw_payload) => raw_payload,
            Err(error) => {
                run.skip(key, SkipReason::Serialization(error));
                return Ok(());
            }
        };
        let signature = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            signature = signer.sign_message(&raw_payload) => signature,
        };
        let signature = match signature {
            Ok(signature) => signature,
            Err(error) => {
                run.skip(key, SkipReason::Signing(error));
                return Ok(());
            }
        };
        tracing::debug!(%key, %payload_type, %signer_type, "Signed payload");

        let raw_payload = Bytes::from(raw_payload);
        let signature = Bytes::from(signature);
        let opts = Arc::new(StorageOptions {
            key: key.clone(),
            cert: signer.cert().map(str::to_string),
            chain: signer.chain().map(str::to_string),
            payload_format: payload_type,
        });
        let backends = signable.storage_backends(&self.config);
        let storage_errors = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            errors = storage::fan_out(
                &self.storage,
                &backends,
                record,
                raw_payload.clone(),
                signature.clone(),
                opts,
            ) => errors,
        };
        run.errors.extend(storage_errors);

        if !transparency::should_upload(&self.config, record) {
            return Ok(());
        }
        let Some(log) = &self.transparency else {
            tracing::error!(%key, "Transparency upload is required but no log client is configured");
            run.errors.push(PipelineError::Transparency {
                key,
                source: TransparencyError::NotConfigured,
            });
            return Ok(());
        };
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            entry = log.upload(
                signer.as_ref(),
                &signature,
                &raw_payload,
                signer.cert(),
                payload_type,
            ) => entry,
        };
        match entry {
            Ok(entry) => {
                let url = transparency::verification_url(&self.config.transparency.url, entry.log_index);
                tracing::info!(%key, log_index = entry.log_index, %url, "Uploaded signature to the transparency log");
                run.annotations
                    .insert(TRANSPARENCY_ANNOTATION.to_string(), url);
            }
            Err(error) => {
                tracing::error!(%key, %error, "Failed to upload signature to the transparency log");
                run.errors.push(PipelineError::Transparency { key, source: error });
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSigner")
            .field("formatters", &self.formatters)
            .field("storage", &self.storage)
            .field("signer_backends", &self.signer_backends)
            .field(
                "signables",
                &self.signables.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            )
            .field("transparency", &self.transparency.is_some())
            .finish_non_exhaustive()
    }
}

/// What one signing run has collected so far.
#[derive(Debug, Default)]
struct Run {
    errors: Errors,
    /// Annotations written alongside the state annotations at the end of the run.
    annotations: BTreeMap<String, String>,
}

impl Run {
    fn skip(&mut self, key: String, reason: SkipReason) {
        tracing::warn!(%key, %reason, "Skipping object");
        self.errors.push(PipelineError::Skipped { key, reason });
    }
}
