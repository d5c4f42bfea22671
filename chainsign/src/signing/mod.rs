// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signers and the per-run signer registry.
//!
//! Signers are rebuilt for every signing run so that rotated keys and certificates are picked up
//! without restarting the service. Each [`SignerType`] has a constructor registered in
//! [`SignerBackends`]; a constructor that fails only removes that signer from the run.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::SignerError};

pub mod envelope;
pub mod x509;

/// The signer backends the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    /// A private key read from the signing secrets directory.
    X509,
    /// A key held by a key management service.
    Kms,
}

impl SignerType {
    pub const ALL: [SignerType; 2] = [SignerType::X509, SignerType::Kms];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignerType::X509 => "x509",
            SignerType::Kms => "kms",
        }
    }
}

impl std::fmt::Display for SignerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces signatures over payload bytes.
#[async_trait]
pub trait Signer: Send + Sync {
    fn signer_type(&self) -> SignerType;

    /// Sign the message, returning the raw signature.
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// The DER-encoded SubjectPublicKeyInfo of the signing key.
    fn public_key(&self) -> Result<Vec<u8>, SignerError>;

    /// The PEM-encoded certificate for the signing key, if there is one.
    fn cert(&self) -> Option<&str>;

    /// The PEM-encoded certificate chain for [`Signer::cert`], if there is one.
    fn chain(&self) -> Option<&str>;
}

/// Builds a signer from the configuration.
pub type SignerConstructor =
    Arc<dyn Fn(&Config) -> anyhow::Result<Arc<dyn Signer>> + Send + Sync>;

/// The constructors used to build the signers for each run.
#[derive(Clone)]
pub struct SignerBackends {
    constructors: HashMap<SignerType, SignerConstructor>,
}

impl SignerBackends {
    /// No constructors at all; every signer lookup will fail.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register (or replace) the constructor for a signer type.
    pub fn register<F>(mut self, signer_type: SignerType, constructor: F) -> Self
    where
        F: Fn(&Config) -> anyhow::Result<Arc<dyn Signer>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(signer_type, Arc::new(constructor));
        self
    }
}

impl Default for SignerBackends {
    /// The built-in backends; only the x509 signer is available without further registration.
    fn default() -> Self {
        Self::empty().register(SignerType::X509, |config| {
            let signer = x509::X509Signer::new(&config.signers.x509)?;
            Ok(Arc::new(signer) as Arc<dyn Signer>)
        })
    }
}

impl std::fmt::Debug for SignerBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

/// The signers available to one signing run.
#[derive(Clone, Default)]
pub struct Signers {
    signers: HashMap<SignerType, Arc<dyn Signer>>,
}

impl Signers {
    /// Build every known signer.
    ///
    /// This never fails: a signer without a constructor, or whose constructor fails, is logged
    /// and left out.
    pub fn new(config: &Config, backends: &SignerBackends) -> Self {
        let mut signers = HashMap::new();
        for signer_type in SignerType::ALL {
            let Some(constructor) = backends.constructors.get(&signer_type) else {
                tracing::debug!(%signer_type, "No signer backend registered");
                continue;
            };
            match constructor(config) {
                Ok(signer) => {
                    signers.insert(signer_type, signer);
                }
                Err(error) => {
                    tracing::warn!(%signer_type, ?error, "Failed to configure signer");
                }
            }
        }

        Self { signers }
    }

    pub fn get(&self, signer_type: SignerType) -> Option<Arc<dyn Signer>> {
        self.signers.get(&signer_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}

impl std::fmt::Debug for Signers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.signers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_backends_are_omitted() {
        let mut config = Config::default();
        config.signers.x509.secret_path = "/nonexistent/chainsign".into();
        let signers = Signers::new(&config, &SignerBackends::default());

        assert!(signers.is_empty());
        assert!(signers.get(SignerType::X509).is_none());
    }

    #[test]
    fn registered_backends_are_built() {
        let key = openssl::pkey::PKey::generate_ed25519().unwrap();
        let pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        let backends = SignerBackends::empty()
            .register(SignerType::Kms, move |_config| {
                let signer = x509::X509Signer::from_pem(pem.as_bytes(), None, None)?;
                Ok(Arc::new(signer) as Arc<dyn Signer>)
            })
            .register(SignerType::X509, |_config| Err(anyhow::anyhow!("no key")));
        let signers = Signers::new(&Config::default(), &backends);

        assert_eq!(signers.len(), 1);
        assert!(signers.get(SignerType::Kms).is_some());
    }
}
