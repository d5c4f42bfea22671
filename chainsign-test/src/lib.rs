// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Test doubles for the chainsign pipeline: an in-memory record store, storage backends that
//! record or fail, signers and payloaders that work or fail, and a fake transparency log.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chainsign::{
    artifacts::SignableObject,
    config::Config,
    error::{FormatError, RecordStoreError, SignerError, StorageError, TransparencyError},
    formats::{Payload, PayloadType, Payloader},
    record::{AnnotationPatch, BuildRecord, BuildResult, RecordStore, Step},
    signing::{x509::X509Signer, Signer, SignerBackends, SignerType},
    state::SigningState,
    storage::{StorageBackend, StorageOptions},
    transparency::{LogEntry, TransparencyLog},
};
use openssl::pkey::{PKey, Private};
use tokio::sync::Notify;

pub const DIGEST_A: &str =
    "sha256:05f95b26ed10668b7183c1e2da98610e91372fa9f510046d4ce5812addad86b5";
pub const DIGEST_B: &str =
    "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// A completed build record with a single step and no images.
pub fn build_record() -> BuildRecord {
    BuildRecord {
        namespace: "default".to_string(),
        name: "build-1".to_string(),
        uid: "0f6e2a44-92c5-4f3b-9d8e-3b7f1d2c9a10".to_string(),
        task_ref: Some("build-and-push".to_string()),
        params: BTreeMap::from([("revision".to_string(), "main".to_string())]),
        steps: vec![Step {
            name: "build".to_string(),
            image_id: format!("docker-pullable://registry.example.com/builder@{DIGEST_B}"),
        }],
        start_time: Some("2024-05-01T10:00:00Z".to_string()),
        completion_time: Some("2024-05-01T10:05:00Z".to_string()),
        ..Default::default()
    }
}

/// Add `IMAGE_URL`/`IMAGE_DIGEST` style results announcing an image.
pub fn with_image(mut record: BuildRecord, prefix: &str, name: &str, digest: &str) -> BuildRecord {
    record.results.push(BuildResult {
        name: format!("{prefix}IMAGE_URL"),
        value: name.to_string(),
    });
    record.results.push(BuildResult {
        name: format!("{prefix}IMAGE_DIGEST"),
        value: digest.to_string(),
    });
    record
}

/// A configuration that signs the record and its images with the x509 signer and stores them in
/// the given backends.
pub fn config(storage: &[&str]) -> Config {
    let mut config = Config::default();
    let storage = storage.iter().map(|s| s.to_string()).collect();
    config.artifacts.build_record.storage = storage;
    config.artifacts.oci.storage = config.artifacts.build_record.storage.clone();
    config
}

/// Holds a single build record and applies patches to it.
#[derive(Debug)]
pub struct MemoryStore {
    record: Mutex<BuildRecord>,
    patches: Mutex<Vec<AnnotationPatch>>,
}

impl MemoryStore {
    pub fn new(record: BuildRecord) -> Arc<Self> {
        Arc::new(Self {
            record: Mutex::new(record),
            patches: Mutex::new(vec![]),
        })
    }

    /// The record with every patch so far applied.
    pub fn record(&self) -> BuildRecord {
        self.record.lock().unwrap().clone()
    }

    pub fn state(&self) -> SigningState {
        SigningState::from_annotations(&self.record().annotations)
    }

    pub fn patches(&self) -> Vec<AnnotationPatch> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn patch_annotations(
        &self,
        record: &BuildRecord,
        patch: &AnnotationPatch,
    ) -> Result<(), RecordStoreError> {
        let mut stored = self.record.lock().unwrap();
        if stored.uid != record.uid {
            return Err(RecordStoreError::NotFound {
                namespace: record.namespace.clone(),
                name: record.name.clone(),
            });
        }
        stored.apply_patch(patch);
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

/// A record store whose patches always fail.
#[derive(Debug, Default)]
pub struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn patch_annotations(
        &self,
        _record: &BuildRecord,
        _patch: &AnnotationPatch,
    ) -> Result<(), RecordStoreError> {
        Err(anyhow::anyhow!("the API server is unavailable").into())
    }
}

/// A payload stored by a [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub raw_payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub opts: StorageOptions,
}

/// A storage backend that keeps everything it is given.
#[derive(Debug)]
pub struct RecordingBackend {
    name: String,
    stored: Mutex<Vec<Stored>>,
}

impl RecordingBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            stored: Mutex::new(vec![]),
        })
    }

    pub fn stored(&self) -> Vec<Stored> {
        self.stored.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.stored().into_iter().map(|s| s.opts.key).collect()
    }
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store_payload(
        &self,
        _record: &BuildRecord,
        raw_payload: &[u8],
        signature: &[u8],
        opts: &StorageOptions,
    ) -> Result<(), StorageError> {
        self.stored.lock().unwrap().push(Stored {
            raw_payload: raw_payload.to_vec(),
            signature: signature.to_vec(),
            opts: opts.clone(),
        });
        Ok(())
    }
}

/// A storage backend that rejects every payload.
#[derive(Debug)]
pub struct FailingBackend {
    name: String,
}

impl FailingBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store_payload(
        &self,
        _record: &BuildRecord,
        _raw_payload: &[u8],
        _signature: &[u8],
        _opts: &StorageOptions,
    ) -> Result<(), StorageError> {
        Err(anyhow::anyhow!("{} is read-only", self.name).into())
    }
}

/// A storage backend that never finishes, notifying once it has been called.
#[derive(Debug)]
pub struct StalledBackend {
    name: String,
    pub started: Notify,
}

impl StalledBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            started: Notify::new(),
        })
    }
}

#[async_trait]
impl StorageBackend for StalledBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store_payload(
        &self,
        _record: &BuildRecord,
        _raw_payload: &[u8],
        _signature: &[u8],
        _opts: &StorageOptions,
    ) -> Result<(), StorageError> {
        self.started.notify_one();
        std::future::pending().await
    }
}

/// A freshly generated Ed25519 key, with the PEM a signer can be built from.
pub struct TestKey {
    pub key: PKey<Private>,
    pem: Vec<u8>,
}

impl TestKey {
    pub fn generate() -> anyhow::Result<Self> {
        let key = PKey::generate_ed25519()?;
        let pem = key.private_key_to_pem_pkcs8()?;
        Ok(Self { key, pem })
    }

    /// Signer backends that build a signer from this key for each of `signer_types`.
    pub fn backends(&self, signer_types: &[SignerType]) -> SignerBackends {
        signer_types
            .iter()
            .fold(SignerBackends::empty(), |backends, signer_type| {
                let pem = self.pem.clone();
                backends.register(*signer_type, move |_config| {
                    let signer = X509Signer::from_pem(&pem, None, None)?;
                    Ok(Arc::new(signer) as Arc<dyn Signer>)
                })
            })
    }
}

/// A signer that can sign but cannot report its public key, so it can't be put in an envelope.
#[derive(Debug, Default)]
pub struct KeylessSigner;

#[async_trait]
impl Signer for KeylessSigner {
    fn signer_type(&self) -> SignerType {
        SignerType::Kms
    }

    async fn sign_message(&self, _message: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(b"signature".to_vec())
    }

    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        Err(anyhow::anyhow!("the key service is unreachable").into())
    }

    fn cert(&self) -> Option<&str> {
        None
    }

    fn chain(&self) -> Option<&str> {
        None
    }
}

/// A signer whose key service refuses every signing request.
#[derive(Debug, Default)]
pub struct FailingSigner;

#[async_trait]
impl Signer for FailingSigner {
    fn signer_type(&self) -> SignerType {
        SignerType::Kms
    }

    async fn sign_message(&self, _message: &[u8]) -> Result<Vec<u8>, SignerError> {
        Err(anyhow::anyhow!("the key service refused to sign").into())
    }

    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        Ok(b"kms public key".to_vec())
    }

    fn cert(&self) -> Option<&str> {
        None
    }

    fn chain(&self) -> Option<&str> {
        None
    }
}

/// A payloader that claims a format but can't format anything.
#[derive(Debug)]
pub struct FailingPayloader {
    payload_type: PayloadType,
}

impl FailingPayloader {
    pub fn new(payload_type: PayloadType) -> Arc<Self> {
        Arc::new(Self { payload_type })
    }
}

impl Payloader for FailingPayloader {
    fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    fn create_payload(&self, object: &SignableObject<'_>) -> Result<Payload, FormatError> {
        Err(FormatError::Invalid(format!(
            "the {} is missing required fields",
            object.kind()
        )))
    }

    fn wrap(&self) -> bool {
        false
    }
}

/// An upload received by a [`FakeLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub signature: Vec<u8>,
    pub raw_payload: Vec<u8>,
    pub payload_format: PayloadType,
}

/// A transparency log that hands out sequential indices, or rejects everything.
#[derive(Debug)]
pub struct FakeLog {
    next_index: u64,
    reject: bool,
    uploads: Mutex<Vec<Upload>>,
}

impl FakeLog {
    pub fn starting_at(index: u64) -> Arc<Self> {
        Arc::new(Self {
            next_index: index,
            reject: false,
            uploads: Mutex::new(vec![]),
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            next_index: 0,
            reject: true,
            uploads: Mutex::new(vec![]),
        })
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransparencyLog for FakeLog {
    async fn upload(
        &self,
        _signer: &dyn Signer,
        signature: &[u8],
        raw_payload: &[u8],
        _cert: Option<&str>,
        payload_format: PayloadType,
    ) -> Result<LogEntry, TransparencyError> {
        if self.reject {
            return Err(TransparencyError::Rejected("entry already exists".to_string()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(Upload {
            signature: signature.to_vec(),
            raw_payload: raw_payload.to_vec(),
            payload_format,
        });
        let log_index = self.next_index + uploads.len() as u64 - 1;
        tracing::debug!(log_index, "Accepted fake log entry");
        Ok(LogEntry {
            log_index,
            uuid: None,
        })
    }
}
