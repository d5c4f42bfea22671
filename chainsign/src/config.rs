// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Configuration for the signing engine.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{formats::PayloadType, signing::SignerType, state::RetryPolicy};

/// Configuration for signing build records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The builder identity recorded in in-toto provenance.
    ///
    /// The in-toto formatter is unavailable if this is empty.
    #[serde(default = "default_builder_id")]
    pub builder_id: String,

    /// How each kind of artifact is formatted, signed, and stored.
    #[serde(default)]
    pub artifacts: Artifacts,

    /// Settings for the signer backends.
    #[serde(default)]
    pub signers: Signers,

    /// Settings for the storage backends.
    #[serde(default)]
    pub storage: Storage,

    #[serde(default)]
    pub transparency: Transparency,

    /// The retry budget for build records that fail to sign.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            builder_id: default_builder_id(),
            artifacts: Artifacts::default(),
            signers: Signers::default(),
            storage: Storage::default(),
            transparency: Transparency::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_builder_id() -> String {
    "https://chainsign.dev/builder".to_string()
}

/// Per-kind artifact settings.
///
/// Keys left out of an `[artifacts.*]` table keep the values from [`Artifacts::default`], so
/// disabling a kind only takes `storage = []`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ArtifactOverrides")]
pub struct Artifacts {
    /// The build record itself.
    pub build_record: Artifact,
    /// Container images the build reports through its results.
    pub oci: Artifact,
}

impl Default for Artifacts {
    fn default() -> Self {
        Self {
            build_record: Artifact {
                format: PayloadType::InToto,
                signer: SignerType::X509,
                storage: BTreeSet::from([crate::storage::directory::NAME.to_string()]),
            },
            oci: Artifact {
                format: PayloadType::SimpleSigning,
                signer: SignerType::X509,
                storage: BTreeSet::from([crate::storage::directory::NAME.to_string()]),
            },
        }
    }
}

/// How one kind of artifact is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The payload format objects of this kind are converted to.
    pub format: PayloadType,
    /// The signer used for objects of this kind.
    pub signer: SignerType,
    /// The names of the storage backends every signed object is stored in.
    ///
    /// An empty set disables this kind of artifact.
    pub storage: BTreeSet<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArtifactOverrides {
    build_record: ArtifactOverride,
    oci: ArtifactOverride,
}

#[derive(Debug, Default, Deserialize)]
struct ArtifactOverride {
    format: Option<PayloadType>,
    signer: Option<SignerType>,
    storage: Option<BTreeSet<String>>,
}

impl ArtifactOverride {
    fn apply(self, base: Artifact) -> Artifact {
        Artifact {
            format: self.format.unwrap_or(base.format),
            signer: self.signer.unwrap_or(base.signer),
            storage: self.storage.unwrap_or(base.storage),
        }
    }
}

impl From<ArtifactOverrides> for Artifacts {
    fn from(overrides: ArtifactOverrides) -> Self {
        let defaults = Artifacts::default();
        Self {
            build_record: overrides.build_record.apply(defaults.build_record),
            oci: overrides.oci.apply(defaults.oci),
        }
    }
}

impl Artifact {
    /// Artifacts are signed only if they have somewhere to be stored.
    pub fn enabled(&self) -> bool {
        !self.storage.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signers {
    #[serde(default)]
    pub x509: X509,
}

/// Settings for the local-key x509 signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X509 {
    /// The directory containing the signing secrets.
    ///
    /// The directory must contain `x509.pem`, a PEM-encoded private key. It may also contain
    /// `cert.pem` and `chain.pem` with the certificate and certificate chain for that key.
    pub secret_path: PathBuf,
}

impl Default for X509 {
    fn default() -> Self {
        Self {
            secret_path: PathBuf::from("/etc/chainsign/signing-secrets"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub directory: Directory,
}

/// Settings for the directory storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    /// The directory signed payloads are written beneath.
    pub path: PathBuf,
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/chainsign/attestations"),
        }
    }
}

/// When signatures are uploaded to the transparency log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransparencyMode {
    /// Never upload.
    #[default]
    Disabled,
    /// Upload every signature.
    Enabled,
    /// Upload signatures only for records annotated with
    /// [`crate::transparency::UPLOAD_ANNOTATION`]` = "true"`.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transparency {
    #[serde(default)]
    pub mode: TransparencyMode,
    /// The base URL of the transparency log.
    ///
    /// This is used to build the verification URL recorded on the build record.
    #[serde(default = "default_transparency_url")]
    pub url: String,
}

impl Default for Transparency {
    fn default() -> Self {
        Self {
            mode: TransparencyMode::default(),
            url: default_transparency_url(),
        }
    }
}

fn default_transparency_url() -> String {
    "https://rekor.sigstore.dev".to_string()
}

/// The path, relative to `$CONFIGURATION_DIRECTORY`, of the configuration file used when none is
/// given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "chainsign/config.toml";

impl Config {
    /// Read and parse a TOML configuration file.
    ///
    /// If the file can't be parsed, the error and an example configuration are printed to stderr.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read the configuration file {path:?}"))?;
        match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(error) => {
                eprintln!("{path:?} is not a valid chainsign configuration:\n{error}");
                eprintln!("Example configuration:\n\n{}", Config::default());
                Err(error).with_context(|| format!("invalid configuration in {path:?}"))
            }
        }
    }
}

fn configuration_directory_file() -> Option<PathBuf> {
    let Some(directory) = std::env::var_os("CONFIGURATION_DIRECTORY") else {
        tracing::debug!("CONFIGURATION_DIRECTORY is not set");
        return None;
    };
    let path = PathBuf::from(directory).join(DEFAULT_CONFIG_FILE);
    path.is_file().then_some(path)
}

/// Load the configuration the CLI runs with.
///
/// An explicit `path` is used as-is. Otherwise [`DEFAULT_CONFIG_FILE`] beneath
/// `$CONFIGURATION_DIRECTORY` is used if it exists, and [`Config::default`] if it doesn't.
///
/// # Errors
///
/// Returns an error if the chosen file can't be read or isn't a valid configuration.
pub fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path.or_else(configuration_directory_file) {
        Some(path) => Config::from_file(&path),
        None => {
            tracing::warn!("No configuration file found; using the defaults");
            Ok(Config::default())
        }
    }
}
