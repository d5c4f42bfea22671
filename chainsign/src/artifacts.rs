// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The kinds of artifacts that can be extracted from a build record and signed.

use crate::{
    config::{Artifact, Config},
    formats::PayloadType,
    record::BuildRecord,
    signing::SignerType,
};

/// The result holding a newline or comma-separated list of digest-qualified image references.
pub const IMAGES_RESULT: &str = "IMAGES";
/// Results ending in this suffix hold an image digest, paired with the matching `*IMAGE_URL`.
pub const IMAGE_DIGEST_SUFFIX: &str = "IMAGE_DIGEST";
pub const IMAGE_URL_SUFFIX: &str = "IMAGE_URL";

const SHA256_PREFIX: &str = "sha256:";

/// Something extracted from a build record that gets its own signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignableObject<'a> {
    /// The build record as a whole.
    BuildRecord(&'a BuildRecord),
    /// A container image the build produced.
    Image(ImageReference),
}

impl SignableObject<'_> {
    /// A short name for the kind of object, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SignableObject::BuildRecord(_) => "build record",
            SignableObject::Image(_) => "image",
        }
    }
}

/// A container image identified by name and digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// The repository, e.g. `registry.example.com/team/app`.
    pub name: String,
    /// The manifest digest, always `sha256:` followed by 64 lowercase hex characters.
    pub digest: String,
}

impl ImageReference {
    /// Create a reference, validating the digest.
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let digest = digest.into();
        let hex = digest.strip_prefix(SHA256_PREFIX)?;
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if name.is_empty() || !valid {
            return None;
        }
        Some(Self { name, digest })
    }

    /// The hex-encoded digest without the algorithm prefix.
    pub fn digest_hex(&self) -> &str {
        self.digest
            .strip_prefix(SHA256_PREFIX)
            .unwrap_or(&self.digest)
    }
}

impl std::str::FromStr for ImageReference {
    type Err = String;

    /// Parse a `name@sha256:...` reference.
    fn from_str(reference: &str) -> Result<Self, Self::Err> {
        let (name, digest) = reference
            .trim()
            .rsplit_once('@')
            .ok_or_else(|| format!("{reference} is not digest-qualified"))?;
        ImageReference::new(name, digest)
            .ok_or_else(|| format!("{reference} does not contain a valid sha256 digest"))
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.digest)
    }
}

/// A kind of artifact source within a build record.
pub trait Signable: Send + Sync {
    /// A short name for this kind of artifact, used in logs.
    fn kind(&self) -> &'static str;

    /// The configuration for this kind of artifact.
    fn artifact<'c>(&self, config: &'c Config) -> &'c Artifact;

    /// Enumerate every object of this kind in the record.
    fn extract_objects<'a>(&self, record: &'a BuildRecord) -> Vec<SignableObject<'a>>;

    /// The identifier of an object, unique within its build record.
    fn key(&self, object: &SignableObject<'_>) -> String;

    fn enabled(&self, config: &Config) -> bool {
        self.artifact(config).enabled()
    }

    fn payload_format(&self, config: &Config) -> PayloadType {
        self.artifact(config).format
    }

    fn signer(&self, config: &Config) -> SignerType {
        self.artifact(config).signer
    }

    fn storage_backends(&self, config: &Config) -> Vec<String> {
        self.artifact(config).storage.iter().cloned().collect()
    }
}

/// Every kind of artifact the engine knows how to sign.
pub fn all() -> Vec<Box<dyn Signable>> {
    vec![Box::new(BuildRecordArtifact), Box::new(OciArtifact)]
}

/// The build record itself, which is signed as a single object.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildRecordArtifact;

impl Signable for BuildRecordArtifact {
    fn kind(&self) -> &'static str {
        "build-record"
    }

    fn artifact<'c>(&self, config: &'c Config) -> &'c Artifact {
        &config.artifacts.build_record
    }

    fn extract_objects<'a>(&self, record: &'a BuildRecord) -> Vec<SignableObject<'a>> {
        vec![SignableObject::BuildRecord(record)]
    }

    fn key(&self, object: &SignableObject<'_>) -> String {
        match object {
            SignableObject::BuildRecord(record) => format!("taskrun-{}", record.uid),
            SignableObject::Image(image) => short_digest(image),
        }
    }
}

/// Container images the build announces through its results.
///
/// Images are found in the `IMAGES` result, and in pairs of `<PREFIX>IMAGE_URL` and
/// `<PREFIX>IMAGE_DIGEST` results. References without a valid sha256 digest are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct OciArtifact;

impl Signable for OciArtifact {
    fn kind(&self) -> &'static str {
        "oci"
    }

    fn artifact<'c>(&self, config: &'c Config) -> &'c Artifact {
        &config.artifacts.oci
    }

    fn extract_objects<'a>(&self, record: &'a BuildRecord) -> Vec<SignableObject<'a>> {
        let mut images: Vec<ImageReference> = vec![];
        let mut push = |image: ImageReference| {
            if !images.contains(&image) {
                images.push(image);
            }
        };

        if let Some(list) = record.result(IMAGES_RESULT) {
            for reference in list
                .split([',', '\n'])
                .map(str::trim)
                .filter(|r| !r.is_empty())
            {
                match reference.parse::<ImageReference>() {
                    Ok(image) => push(image),
                    Err(error) => {
                        tracing::warn!(record = %record, %error, "Ignoring image reference");
                    }
                }
            }
        }

        for result in &record.results {
            let Some(prefix) = result.name.strip_suffix(IMAGE_DIGEST_SUFFIX) else {
                continue;
            };
            let url_result = format!("{prefix}{IMAGE_URL_SUFFIX}");
            let Some(name) = record.result(&url_result) else {
                tracing::warn!(record = %record, digest_result = %result.name, "No {url_result} result for image digest");
                continue;
            };
            match ImageReference::new(name.trim(), result.value.trim()) {
                Some(image) => push(image),
                None => {
                    tracing::warn!(record = %record, digest_result = %result.name, "Ignoring invalid image digest");
                }
            }
        }

        images.into_iter().map(SignableObject::Image).collect()
    }

    fn key(&self, object: &SignableObject<'_>) -> String {
        match object {
            SignableObject::Image(image) => short_digest(image),
            SignableObject::BuildRecord(record) => format!("taskrun-{}", record.uid),
        }
    }
}

fn short_digest(image: &ImageReference) -> String {
    image.digest_hex().chars().take(12).collect()
}
