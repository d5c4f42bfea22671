// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A signer using a private key from the signing secrets directory.
//!
//! RSA and ECDSA keys sign the SHA-256 digest of the message; Ed25519 keys sign the message
//! directly.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use openssl::{
    hash::MessageDigest,
    pkey::{Id, PKey, Private},
};
use tracing::instrument;

use crate::{
    config,
    error::SignerError,
    signing::{Signer, SignerType},
};

/// The PEM-encoded private key within the secrets directory.
pub const KEY_FILE: &str = "x509.pem";
/// The optional PEM-encoded certificate for the key.
pub const CERT_FILE: &str = "cert.pem";
/// The optional PEM-encoded certificate chain.
pub const CHAIN_FILE: &str = "chain.pem";

pub struct X509Signer {
    key: PKey<Private>,
    cert: Option<String>,
    chain: Option<String>,
}

impl X509Signer {
    /// Load the signer from its secrets directory.
    ///
    /// This reads the secrets with blocking I/O; async callers should run it on the blocking pool.
    pub fn new(config: &config::X509) -> anyhow::Result<Self> {
        let key_path = config.secret_path.join(KEY_FILE);
        let key = std::fs::read(&key_path)
            .with_context(|| format!("failed to read signing key {}", key_path.display()))?;
        let cert = read_optional(&config.secret_path.join(CERT_FILE))?;
        let chain = read_optional(&config.secret_path.join(CHAIN_FILE))?;

        let signer = Self::from_pem(&key, cert, chain)
            .with_context(|| format!("{} is not a usable private key", key_path.display()))?;
        tracing::debug!(secret_path = %config.secret_path.display(), "Loaded x509 signing key");
        Ok(signer)
    }

    /// Create a signer from a PEM-encoded private key.
    pub fn from_pem(
        key: &[u8],
        cert: Option<String>,
        chain: Option<String>,
    ) -> Result<Self, SignerError> {
        let key = PKey::private_key_from_pem(key)?;
        match key.id() {
            Id::RSA | Id::EC | Id::ED25519 => Ok(Self { key, cert, chain }),
            _ => Err(anyhow::anyhow!("unsupported key type {:?}", key.id()).into()),
        }
    }
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[async_trait]
impl Signer for X509Signer {
    fn signer_type(&self) -> SignerType {
        SignerType::X509
    }

    #[instrument(skip_all, err, fields(message_len = message.len()))]
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        let key = self.key.clone();
        let message = message.to_vec();

        let span = tracing::Span::current();
        let signature = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            let signature = if key.id() == Id::ED25519 {
                openssl::sign::Signer::new_without_digest(&key)?
                    .sign_oneshot_to_vec(&message)?
            } else {
                let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), &key)?;
                signer.update(&message)?;
                signer.sign_to_vec()?
            };
            tracing::trace!("Successfully signed message");
            Ok::<_, SignerError>(signature)
        })
        .await??;

        Ok(signature)
    }

    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        Ok(self.key.public_key_to_der()?)
    }

    fn cert(&self) -> Option<&str> {
        self.cert.as_deref()
    }

    fn chain(&self) -> Option<&str> {
        self.chain.as_deref()
    }
}
