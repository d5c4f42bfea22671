// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The `simplesigning` format used for container image signatures.

use serde_json::json;

use crate::{
    artifacts::SignableObject,
    error::FormatError,
    formats::{Payload, PayloadType, Payloader},
};

pub const PAYLOAD_TYPE: &str = "application/vnd.dev.cosign.simplesigning.v1+json";
const SIGNATURE_TYPE: &str = "cosign container image signature";

#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter;

impl Payloader for Formatter {
    fn payload_type(&self) -> PayloadType {
        PayloadType::SimpleSigning
    }

    fn create_payload(&self, object: &SignableObject<'_>) -> Result<Payload, FormatError> {
        let SignableObject::Image(image) = object else {
            return Err(FormatError::UnsupportedObject {
                format: PayloadType::SimpleSigning,
                object: object.kind(),
            });
        };

        Ok(json!({
            "critical": {
                "identity": {
                    "docker-reference": image.name,
                },
                "image": {
                    "docker-manifest-digest": image.digest,
                },
                "type": SIGNATURE_TYPE,
            },
            "optional": null,
        }))
    }

    fn wrap(&self) -> bool {
        false
    }
}
