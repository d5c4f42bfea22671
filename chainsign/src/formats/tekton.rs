// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The `tekton` format: the build record itself.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    artifacts::SignableObject,
    error::FormatError,
    formats::{Payload, PayloadType, Payloader},
    record::{BuildResult, Step},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter;

// Annotations are left out since signing itself changes them.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordStatus<'a> {
    namespace: &'a str,
    name: &'a str,
    uid: &'a str,
    task_ref: Option<&'a str>,
    params: &'a BTreeMap<String, String>,
    results: &'a [BuildResult],
    steps: &'a [Step],
    start_time: Option<&'a str>,
    completion_time: Option<&'a str>,
}

impl Payloader for Formatter {
    fn payload_type(&self) -> PayloadType {
        PayloadType::Tekton
    }

    fn create_payload(&self, object: &SignableObject<'_>) -> Result<Payload, FormatError> {
        let SignableObject::BuildRecord(record) = object else {
            return Err(FormatError::UnsupportedObject {
                format: PayloadType::Tekton,
                object: object.kind(),
            });
        };

        Ok(serde_json::to_value(RecordStatus {
            namespace: &record.namespace,
            name: &record.name,
            uid: &record.uid,
            task_ref: record.task_ref.as_deref(),
            params: &record.params,
            results: &record.results,
            steps: &record.steps,
            start_time: record.start_time.as_deref(),
            completion_time: record.completion_time.as_deref(),
        })?)
    }

    fn wrap(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{artifacts::ImageReference, record::BuildRecord};

    #[test]
    fn annotations_do_not_change_the_payload() {
        let mut record = BuildRecord {
            namespace: "default".to_string(),
            name: "build".to_string(),
            uid: "1234".to_string(),
            ..Default::default()
        };
        let before = Formatter
            .create_payload(&SignableObject::BuildRecord(&record))
            .unwrap();
        record
            .annotations
            .insert("chains.tekton.dev/retries".to_string(), "1".to_string());
        let after = Formatter
            .create_payload(&SignableObject::BuildRecord(&record))
            .unwrap();

        assert_eq!(before, after);
        assert_eq!(before["uid"], "1234");
        assert!(before.get("annotations").is_none());
    }

    #[test]
    fn images_are_unsupported() {
        let image = ImageReference::new(
            "registry.example.com/app",
            format!("sha256:{}", "0".repeat(64)),
        )
        .unwrap();
        let result = Formatter.create_payload(&SignableObject::Image(image));

        assert!(matches!(
            result,
            Err(FormatError::UnsupportedObject { object: "image", .. })
        ));
    }
}
