// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::sync::Arc;

use chainsign::{
    artifacts::{BuildRecordArtifact, ImageReference, OciArtifact, Signable, SignableObject},
    config::{Artifact, Config, TransparencyMode},
    error::{Error, FormatError, PipelineError, SkipReason, TransparencyError},
    formats::{Formatters, PayloadType},
    record::{BuildRecord, JsonFileStore},
    signing::{
        envelope::{pae, Envelope},
        Signer, SignerBackends, SignerType,
    },
    state::{SigningState, RETRY_ANNOTATION, SIGNED_ANNOTATION},
    storage::{StorageBackend, StorageBackends},
    transparency::{TRANSPARENCY_ANNOTATION, UPLOAD_ANNOTATION},
    RecordSigner,
};
use chainsign_test::{
    build_record, config, with_image, BrokenStore, FailingBackend, FailingPayloader,
    FailingSigner, FakeLog, KeylessSigner, MemoryStore, RecordingBackend, StalledBackend, TestKey,
    DIGEST_A, DIGEST_B,
};
use openssl::sign::Verifier;
use tokio_util::sync::CancellationToken;

const DIGEST_C: &str =
    "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

fn storage(backends: Vec<Arc<dyn StorageBackend>>) -> StorageBackends {
    backends.into_iter().collect()
}

/// Signs one fixed image with the given signer type, regardless of the record.
struct FixedImage {
    signer: SignerType,
    image: ImageReference,
}

impl FixedImage {
    fn boxed(signer: SignerType, digest: &str) -> Box<dyn Signable> {
        Box::new(Self {
            signer,
            image: ImageReference::new("registry.example.com/app", digest).unwrap(),
        })
    }
}

impl Signable for FixedImage {
    fn kind(&self) -> &'static str {
        "fixed-image"
    }

    fn artifact<'c>(&self, config: &'c Config) -> &'c Artifact {
        &config.artifacts.oci
    }

    fn extract_objects<'a>(&self, _record: &'a BuildRecord) -> Vec<SignableObject<'a>> {
        vec![SignableObject::Image(self.image.clone())]
    }

    fn key(&self, object: &SignableObject<'_>) -> String {
        OciArtifact.key(object)
    }

    fn signer(&self, _config: &Config) -> SignerType {
        self.signer
    }
}

#[tokio::test]
async fn signs_record_and_images() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = with_image(build_record(), "", "registry.example.com/app", DIGEST_A);
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]));

    signer.sign(&CancellationToken::new(), &record).await?;

    assert_eq!(store.state(), SigningState::Signed);
    assert_eq!(store.patches().len(), 1);
    let annotations = store.record().annotations;
    assert_eq!(annotations.get(SIGNED_ANNOTATION).map(String::as_str), Some("true"));
    assert!(!annotations.contains_key(RETRY_ANNOTATION));
    assert!(!annotations.contains_key(TRANSPARENCY_ANNOTATION));

    let stored = recording.stored();
    assert_eq!(
        recording.keys(),
        vec![format!("taskrun-{}", record.uid), "05f95b26ed10".to_string()]
    );

    // The provenance is wrapped in an envelope signed over the pre-authentication encoding.
    let provenance = &stored[0];
    assert_eq!(provenance.opts.payload_format, PayloadType::InToto);
    let envelope: Envelope = serde_json::from_slice(&provenance.signature)?;
    assert_eq!(envelope.decode_payload()?, provenance.raw_payload);
    let sig = openssl::base64::decode_block(&envelope.signatures[0].sig)?;
    let mut verifier = Verifier::new_without_digest(&key.key)?;
    assert!(verifier.verify_oneshot(&sig, &pae(&envelope.payload_type, &provenance.raw_payload))?);
    let statement: serde_json::Value = serde_json::from_slice(&provenance.raw_payload)?;
    assert_eq!(statement["subject"][0]["name"], "registry.example.com/app");

    // The image signature is a bare signature over the payload.
    let image = &stored[1];
    assert_eq!(image.opts.payload_format, PayloadType::SimpleSigning);
    let mut verifier = Verifier::new_without_digest(&key.key)?;
    assert!(verifier.verify_oneshot(&image.signature, &image.raw_payload)?);
    Ok(())
}

#[tokio::test]
async fn signed_records_are_not_signed_again() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let store = MemoryStore::new(build_record());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]));

    signer.sign(&CancellationToken::new(), &build_record()).await?;
    let signed = store.record();
    signer.sign(&CancellationToken::new(), &signed).await?;

    assert_eq!(store.patches().len(), 1);
    assert_eq!(recording.stored().len(), 1);
    assert_eq!(store.record(), signed);
    Ok(())
}

#[tokio::test]
#[tracing_test::traced_test]
async fn missing_signer_skips_only_that_object() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = build_record();
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]))
        .with_signables(vec![
            FixedImage::boxed(SignerType::X509, DIGEST_A),
            FixedImage::boxed(SignerType::Kms, DIGEST_B),
            FixedImage::boxed(SignerType::X509, DIGEST_C),
        ]);

    let error = signer
        .sign(&CancellationToken::new(), &record)
        .await
        .unwrap_err();

    let errors = error.errors().expect("the run should collect errors");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(PipelineError::Skipped {
            key,
            reason: SkipReason::MissingSigner(SignerType::Kms),
        }) if key == "aaaaaaaaaaaa"
    ));
    assert_eq!(recording.keys(), vec!["05f95b26ed10", "cccccccccccc"]);
    assert_eq!(store.state(), SigningState::Retrying(1));
    assert!(logs_contain("Skipping object"));
    Ok(())
}

#[tokio::test]
async fn unformattable_image_skips_only_that_object() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = with_image(build_record(), "", "registry.example.com/app", DIGEST_A);
    let config = config(&["recording"]);
    let mut formatters = Formatters::new(&config);
    formatters.insert(FailingPayloader::new(PayloadType::SimpleSigning));
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config, store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]))
        .with_formatters(formatters);

    let error = signer
        .sign(&CancellationToken::new(), &record)
        .await
        .unwrap_err();

    let errors = error.errors().expect("the run should collect errors");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(PipelineError::Skipped {
            key,
            reason: SkipReason::Format(FormatError::Invalid(_)),
        }) if key == "05f95b26ed10"
    ));
    assert_eq!(recording.keys(), vec![format!("taskrun-{}", record.uid)]);
    assert_eq!(store.state(), SigningState::Retrying(1));
    Ok(())
}

#[tokio::test]
async fn refused_signature_skips_only_that_object() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = build_record();
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let backends = key
        .backends(&[SignerType::X509])
        .register(SignerType::Kms, |_config| {
            Ok(Arc::new(FailingSigner) as Arc<dyn Signer>)
        });
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(backends)
        .with_storage(storage(vec![recording.clone()]))
        .with_signables(vec![
            FixedImage::boxed(SignerType::X509, DIGEST_A),
            FixedImage::boxed(SignerType::Kms, DIGEST_B),
            FixedImage::boxed(SignerType::Kms, DIGEST_C),
        ]);

    let error = signer
        .sign(&CancellationToken::new(), &record)
        .await
        .unwrap_err();

    let errors = error.errors().expect("the run should collect errors");
    let skipped: Vec<&str> = errors
        .iter()
        .map(|error| match error {
            PipelineError::Skipped {
                key,
                reason: SkipReason::Signing(_),
            } => key.as_str(),
            other => panic!("unexpected error: {other}"),
        })
        .collect();
    assert_eq!(skipped, vec!["aaaaaaaaaaaa", "cccccccccccc"]);
    assert_eq!(recording.keys(), vec!["05f95b26ed10"]);
    assert_eq!(store.state(), SigningState::Retrying(1));
    Ok(())
}

#[tokio::test]
async fn failing_backend_does_not_stop_the_others() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = build_record();
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config(&["recording", "broken"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone(), FailingBackend::new("broken")]));

    let error = signer
        .sign(&CancellationToken::new(), &record)
        .await
        .unwrap_err();

    let errors = error.errors().expect("the run should collect errors");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(PipelineError::Storage { backend, .. }) if backend == "broken"
    ));
    assert_eq!(recording.stored().len(), 1);
    assert_eq!(store.state(), SigningState::Retrying(1));
    Ok(())
}

#[tokio::test]
async fn no_signers_moves_record_to_retrying() -> anyhow::Result<()> {
    let record = with_image(build_record(), "", "registry.example.com/app", DIGEST_A);
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(SignerBackends::empty())
        .with_storage(storage(vec![recording.clone()]));

    let error = signer
        .sign(&CancellationToken::new(), &record)
        .await
        .unwrap_err();

    let errors = error.errors().expect("the run should collect errors");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|error| matches!(
        error,
        PipelineError::Skipped {
            reason: SkipReason::MissingSigner(SignerType::X509),
            ..
        }
    )));
    assert!(recording.stored().is_empty());
    assert_eq!(store.state(), SigningState::Retrying(1));
    let annotations = store.record().annotations;
    assert_eq!(annotations.get(RETRY_ANNOTATION).map(String::as_str), Some("1"));
    assert!(!annotations.contains_key(SIGNED_ANNOTATION));
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_mark_the_record_failed() -> anyhow::Result<()> {
    let mut record = build_record();
    record
        .annotations
        .insert(RETRY_ANNOTATION.to_string(), "3".to_string());
    let store = MemoryStore::new(record.clone());
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(SignerBackends::empty())
        .with_storage(storage(vec![RecordingBackend::new("recording")]));

    let result = signer.sign(&CancellationToken::new(), &record).await;

    assert!(matches!(result, Err(Error::Pipeline(_))));
    assert_eq!(store.state(), SigningState::Failed);
    let annotations = store.record().annotations;
    assert_eq!(annotations.get(SIGNED_ANNOTATION).map(String::as_str), Some("failed"));
    assert!(!annotations.contains_key(RETRY_ANNOTATION));
    Ok(())
}

#[tokio::test]
async fn transparency_url_is_recorded() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let mut config = config(&["recording"]);
    config.transparency.mode = TransparencyMode::Enabled;
    config.transparency.url = "https://log.example/".to_string();
    let store = MemoryStore::new(build_record());
    let log = FakeLog::starting_at(42);
    let signer = RecordSigner::new(config, store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![RecordingBackend::new("recording")]))
        .with_transparency_log(log.clone());

    signer.sign(&CancellationToken::new(), &build_record()).await?;

    let annotations = store.record().annotations;
    assert_eq!(
        annotations.get(TRANSPARENCY_ANNOTATION).map(String::as_str),
        Some("https://log.example/api/v1/log/entries?logIndex=42")
    );
    assert_eq!(store.state(), SigningState::Signed);
    assert_eq!(store.patches().len(), 1);
    let uploads = log.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].payload_format, PayloadType::InToto);
    Ok(())
}

#[tokio::test]
async fn manual_transparency_requires_opt_in() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let mut config = config(&["recording"]);
    config.transparency.mode = TransparencyMode::Manual;
    let log = FakeLog::starting_at(0);

    let store = MemoryStore::new(build_record());
    let signer = RecordSigner::new(config.clone(), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![RecordingBackend::new("recording")]))
        .with_transparency_log(log.clone());
    signer.sign(&CancellationToken::new(), &build_record()).await?;
    assert!(log.uploads().is_empty());

    let mut opted_in = build_record();
    opted_in
        .annotations
        .insert(UPLOAD_ANNOTATION.to_string(), "true".to_string());
    let store = MemoryStore::new(opted_in.clone());
    let signer = RecordSigner::new(config, store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![RecordingBackend::new("recording")]))
        .with_transparency_log(log.clone());
    signer.sign(&CancellationToken::new(), &opted_in).await?;
    assert_eq!(log.uploads().len(), 1);
    assert!(store
        .record()
        .annotations
        .contains_key(TRANSPARENCY_ANNOTATION));
    Ok(())
}

#[tokio::test]
async fn rejected_upload_still_stores_the_payload() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let mut config = config(&["recording"]);
    config.transparency.mode = TransparencyMode::Enabled;
    let store = MemoryStore::new(build_record());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config, store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]))
        .with_transparency_log(FakeLog::rejecting());

    let error = signer
        .sign(&CancellationToken::new(), &build_record())
        .await
        .unwrap_err();

    assert!(matches!(
        error.errors().map(|errors| errors.iter().collect::<Vec<_>>()).as_deref(),
        Some([PipelineError::Transparency {
            source: TransparencyError::Rejected(_),
            ..
        }])
    ));
    assert_eq!(recording.stored().len(), 1);
    assert_eq!(store.state(), SigningState::Retrying(1));
    assert!(!store
        .record()
        .annotations
        .contains_key(TRANSPARENCY_ANNOTATION));
    Ok(())
}

#[tokio::test]
async fn envelope_wrap_failure_aborts_without_patching() -> anyhow::Result<()> {
    let store = MemoryStore::new(build_record());
    let recording = RecordingBackend::new("recording");
    let backends = SignerBackends::empty().register(SignerType::X509, |_config| {
        Ok(Arc::new(KeylessSigner) as Arc<dyn Signer>)
    });
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(backends)
        .with_storage(storage(vec![recording.clone()]));

    let result = signer.sign(&CancellationToken::new(), &build_record()).await;

    assert!(matches!(result, Err(Error::Wrap(_))));
    assert!(store.patches().is_empty());
    assert!(recording.stored().is_empty());
    assert_eq!(store.state(), SigningState::Unset);
    Ok(())
}

#[tokio::test]
async fn cancellation_during_storage_leaves_record_untouched() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let store = MemoryStore::new(build_record());
    let stalled = StalledBackend::new("stalled");
    let signer = RecordSigner::new(config(&["stalled"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![stalled.clone()]));
    let cancel = CancellationToken::new();
    let record = build_record();

    let (result, ()) = tokio::join!(signer.sign(&cancel, &record), async {
        stalled.started.notified().await;
        cancel.cancel();
    });

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(store.patches().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_before_start_leaves_record_untouched() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let store = MemoryStore::new(build_record());
    let signer = RecordSigner::new(config(&["recording"]), store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![RecordingBackend::new("recording")]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = signer.sign(&cancel, &build_record()).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(store.patches().is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_patch_is_reported() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let signer = RecordSigner::new(config(&["recording"]), Arc::new(BrokenStore))
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![RecordingBackend::new("recording")]));

    let error = signer
        .sign(&CancellationToken::new(), &build_record())
        .await
        .unwrap_err();

    assert!(matches!(
        error.errors().map(|errors| errors.iter().collect::<Vec<_>>()).as_deref(),
        Some([PipelineError::Patch(_)])
    ));
    Ok(())
}

#[tokio::test]
async fn disabled_artifacts_are_not_signed() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let record = with_image(build_record(), "", "registry.example.com/app", DIGEST_A);
    let mut config = config(&["recording"]);
    config.artifacts.oci.storage.clear();
    let store = MemoryStore::new(record.clone());
    let recording = RecordingBackend::new("recording");
    let signer = RecordSigner::new(config, store.clone())
        .with_signer_backends(key.backends(&[SignerType::X509]))
        .with_storage(storage(vec![recording.clone()]))
        .with_signables(vec![Box::new(BuildRecordArtifact), Box::new(OciArtifact)]);

    signer.sign(&CancellationToken::new(), &record).await?;

    assert_eq!(recording.keys(), vec![format!("taskrun-{}", record.uid)]);
    assert_eq!(store.state(), SigningState::Signed);
    Ok(())
}

// The configuration the CLI runs with: the directory backend and a build record on disk.
#[tokio::test]
async fn directory_backend_and_json_record() -> anyhow::Result<()> {
    let key = TestKey::generate()?;
    let dir = tempfile::tempdir()?;
    let record_path = dir.path().join("record.json");
    let record = with_image(build_record(), "", "registry.example.com/app", DIGEST_A);
    std::fs::write(&record_path, serde_json::to_vec(&record)?)?;

    let mut config = Config::default();
    config.storage.directory.path = dir.path().join("attestations");
    let store = JsonFileStore::new(&record_path);
    let signer = RecordSigner::new(config, Arc::new(store.clone()))
        .with_signer_backends(key.backends(&[SignerType::X509]));

    signer.sign(&CancellationToken::new(), &store.load().await?).await?;

    let signed = store.load().await?;
    assert_eq!(
        SigningState::from_annotations(&signed.annotations),
        SigningState::Signed
    );
    let output = dir
        .path()
        .join("attestations")
        .join(&record.namespace)
        .join(&record.name);
    assert!(output
        .join(format!("taskrun-{}.in-toto.payload", record.uid))
        .is_file());
    assert!(output.join("05f95b26ed10.simplesigning.sig").is_file());
    Ok(())
}
