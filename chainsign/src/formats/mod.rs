// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Payload formats.
//!
//! A [`Payloader`] turns a [`SignableObject`] into the JSON document that gets signed. Formats
//! are registered in [`Formatters`], which is built once and shared by every signing run.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{artifacts::SignableObject, config::Config, error::FormatError};

pub mod intoto;
pub mod simple;
pub mod tekton;

/// A formatted payload, ready to be serialized and signed.
pub type Payload = serde_json::Value;

/// The payload formats the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayloadType {
    /// The build record itself.
    #[serde(rename = "tekton")]
    Tekton,
    /// An in-toto statement carrying build provenance.
    #[serde(rename = "in-toto", alias = "intoto")]
    InToto,
    /// The container signature payload understood by image signature verifiers.
    #[serde(rename = "simplesigning")]
    SimpleSigning,
}

impl PayloadType {
    pub const ALL: [PayloadType; 3] = [
        PayloadType::Tekton,
        PayloadType::InToto,
        PayloadType::SimpleSigning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Tekton => "tekton",
            PayloadType::InToto => "in-toto",
            PayloadType::SimpleSigning => "simplesigning",
        }
    }

    /// The media type used when a payload of this format is placed in a signing envelope.
    pub fn media_type(&self) -> &'static str {
        match self {
            PayloadType::Tekton => "application/vnd.tekton+json",
            PayloadType::InToto => intoto::PAYLOAD_TYPE,
            PayloadType::SimpleSigning => simple::PAYLOAD_TYPE,
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts signable objects into payloads of one format.
pub trait Payloader: Send + Sync {
    /// The format this payloader produces.
    fn payload_type(&self) -> PayloadType;

    /// Format the object.
    fn create_payload(&self, object: &SignableObject<'_>) -> Result<Payload, FormatError>;

    /// Whether payloads of this format are signed inside a signing envelope.
    fn wrap(&self) -> bool;
}

/// The available payloaders, keyed by format.
#[derive(Clone, Default)]
pub struct Formatters {
    payloaders: HashMap<PayloadType, Arc<dyn Payloader>>,
}

impl Formatters {
    /// Build every known formatter.
    ///
    /// A formatter that cannot be configured is logged and left out; objects configured to use
    /// it are skipped at signing time.
    pub fn new(config: &Config) -> Self {
        let mut payloaders: HashMap<PayloadType, Arc<dyn Payloader>> = HashMap::new();
        for payload_type in PayloadType::ALL {
            let payloader: Result<Arc<dyn Payloader>, anyhow::Error> = match payload_type {
                PayloadType::Tekton => Ok(Arc::new(tekton::Formatter)),
                PayloadType::InToto => intoto::Formatter::new(config)
                    .map(|formatter| Arc::new(formatter) as Arc<dyn Payloader>),
                PayloadType::SimpleSigning => Ok(Arc::new(simple::Formatter)),
            };
            match payloader {
                Ok(payloader) => {
                    payloaders.insert(payload_type, payloader);
                }
                Err(error) => {
                    tracing::warn!(%payload_type, ?error, "Failed to configure formatter");
                }
            }
        }

        Self { payloaders }
    }

    pub fn get(&self, payload_type: PayloadType) -> Option<Arc<dyn Payloader>> {
        self.payloaders.get(&payload_type).cloned()
    }

    /// Add or replace a payloader.
    pub fn insert(&mut self, payloader: Arc<dyn Payloader>) {
        self.payloaders.insert(payloader.payload_type(), payloader);
    }

    pub fn len(&self) -> usize {
        self.payloaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloaders.is_empty()
    }
}

impl FromIterator<Arc<dyn Payloader>> for Formatters {
    fn from_iter<T: IntoIterator<Item = Arc<dyn Payloader>>>(iter: T) -> Self {
        let mut formatters = Formatters::default();
        for payloader in iter {
            formatters.insert(payloader);
        }
        formatters
    }
}

impl std::fmt::Debug for Formatters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.payloaders.keys()).finish()
    }
}
