// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Wrap a signer so its signatures are [DSSE][1] envelopes.
//!
//! The wrapped signer signs the pre-authentication encoding of the message and returns the
//! serialized envelope in place of a bare signature.
//!
//! [1]: https://github.com/secure-systems-lab/dsse/blob/master/protocol.md

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::SignerError,
    signing::{Signer, SignerType},
};

/// A DSSE envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub payload_type: String,
    /// The base64-encoded payload.
    pub payload: String,
    pub signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub keyid: String,
    /// The base64-encoded signature over the pre-authentication encoding.
    pub sig: String,
}

impl Envelope {
    pub fn decode_payload(&self) -> Result<Vec<u8>, SignerError> {
        Ok(openssl::base64::decode_block(&self.payload)?)
    }
}

/// The DSSE pre-authentication encoding of a payload.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(payload_type.len() + payload.len() + 32);
    encoded.extend_from_slice(b"DSSEv1 ");
    encoded.extend_from_slice(payload_type.len().to_string().as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(payload_type.as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(payload.len().to_string().as_bytes());
    encoded.push(b' ');
    encoded.extend_from_slice(payload);
    encoded
}

/// A signer producing DSSE envelopes.
pub struct EnvelopeSigner {
    inner: Arc<dyn Signer>,
    payload_type: String,
    key_id: String,
}

/// Wrap `inner` so that it produces envelopes of the given payload type.
///
/// The envelope key id is the hex SHA-256 digest of the signer's DER public key.
///
/// # Errors
///
/// Fails if the inner signer cannot provide its public key.
pub fn wrap(inner: Arc<dyn Signer>, payload_type: &str) -> Result<Arc<dyn Signer>, SignerError> {
    if payload_type.is_empty() {
        return Err(anyhow::anyhow!("envelopes require a payload type").into());
    }
    let public_key = inner.public_key()?;
    let key_id = hex::encode(openssl::sha::sha256(&public_key));

    Ok(Arc::new(EnvelopeSigner {
        inner,
        payload_type: payload_type.to_string(),
        key_id,
    }))
}

#[async_trait]
impl Signer for EnvelopeSigner {
    fn signer_type(&self) -> SignerType {
        self.inner.signer_type()
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        let signature = self
            .inner
            .sign_message(&pae(&self.payload_type, message))
            .await?;
        let envelope = Envelope {
            payload_type: self.payload_type.clone(),
            payload: openssl::base64::encode_block(message),
            signatures: vec![EnvelopeSignature {
                keyid: self.key_id.clone(),
                sig: openssl::base64::encode_block(&signature),
            }],
        };

        Ok(serde_json::to_vec(&envelope)?)
    }

    fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        self.inner.public_key()
    }

    fn cert(&self) -> Option<&str> {
        self.inner.cert()
    }

    fn chain(&self) -> Option<&str> {
        self.inner.chain()
    }
}
