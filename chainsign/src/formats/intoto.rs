// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The `in-toto` format: an in-toto statement with SLSA provenance for a build record.
//!
//! The statement's subjects are the images the build produced, and its materials are the images
//! each step ran in. Statements are always signed inside a DSSE envelope.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    artifacts::{ImageReference, OciArtifact, Signable, SignableObject},
    config::Config,
    error::FormatError,
    formats::{Payload, PayloadType, Payloader},
    record::BuildRecord,
};

/// The DSSE payload type of in-toto statements.
pub const PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
pub const PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v0.2";
const BUILD_TYPE: &str = "tekton.dev/v1beta1/TaskRun";

#[derive(Debug, Clone)]
pub struct Formatter {
    builder_id: String,
}

impl Formatter {
    /// Create an in-toto formatter.
    ///
    /// # Errors
    ///
    /// The configuration must provide a builder id.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        if config.builder_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "builder_id must be set to produce in-toto provenance"
            ));
        }
        Ok(Self {
            builder_id: config.builder_id.clone(),
        })
    }
}

#[derive(Serialize)]
struct Statement<'a> {
    #[serde(rename = "_type")]
    statement_type: &'static str,
    #[serde(rename = "predicateType")]
    predicate_type: &'static str,
    subject: Vec<Subject>,
    predicate: Provenance<'a>,
}

#[derive(Serialize)]
struct Subject {
    name: String,
    digest: BTreeMap<&'static str, String>,
}

impl From<&ImageReference> for Subject {
    fn from(image: &ImageReference) -> Self {
        Self {
            name: image.name.clone(),
            digest: BTreeMap::from([("sha256", image.digest_hex().to_string())]),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Provenance<'a> {
    builder: Builder<'a>,
    build_type: &'static str,
    invocation: Invocation<'a>,
    metadata: Metadata<'a>,
    materials: Vec<Material>,
}

#[derive(Serialize)]
struct Builder<'a> {
    id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Invocation<'a> {
    config_source: BTreeMap<&'static str, &'a str>,
    parameters: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata<'a> {
    build_started_on: Option<&'a str>,
    build_finished_on: Option<&'a str>,
    completeness: Completeness,
    reproducible: bool,
}

#[derive(Serialize)]
struct Completeness {
    parameters: bool,
    environment: bool,
    materials: bool,
}

#[derive(Serialize)]
struct Material {
    uri: String,
    digest: BTreeMap<&'static str, String>,
}

fn subjects(record: &BuildRecord) -> Vec<Subject> {
    OciArtifact
        .extract_objects(record)
        .iter()
        .filter_map(|object| match object {
            SignableObject::Image(image) => Some(Subject::from(image)),
            SignableObject::BuildRecord(_) => None,
        })
        .collect()
}

fn materials(record: &BuildRecord) -> Vec<Material> {
    let mut materials: Vec<Material> = vec![];
    for step in &record.steps {
        let image_id = step
            .image_id
            .strip_prefix("docker-pullable://")
            .unwrap_or(&step.image_id);
        match image_id.parse::<ImageReference>() {
            Ok(image) => {
                let uri = format!("oci://{}", image.name);
                if !materials.iter().any(|m| m.uri == uri) {
                    materials.push(Material {
                        uri,
                        digest: BTreeMap::from([("sha256", image.digest_hex().to_string())]),
                    });
                }
            }
            Err(error) => {
                tracing::debug!(step = %step.name, %error, "Step image is not a material");
            }
        }
    }
    materials
}

impl Payloader for Formatter {
    fn payload_type(&self) -> PayloadType {
        PayloadType::InToto
    }

    fn create_payload(&self, object: &SignableObject<'_>) -> Result<Payload, FormatError> {
        let SignableObject::BuildRecord(record) = object else {
            return Err(FormatError::UnsupportedObject {
                format: PayloadType::InToto,
                object: object.kind(),
            });
        };

        let materials = materials(record);
        let statement = Statement {
            statement_type: STATEMENT_TYPE,
            predicate_type: PREDICATE_TYPE,
            subject: subjects(record),
            predicate: Provenance {
                builder: Builder {
                    id: &self.builder_id,
                },
                build_type: BUILD_TYPE,
                invocation: Invocation {
                    config_source: record
                        .task_ref
                        .as_deref()
                        .map(|task| BTreeMap::from([("entryPoint", task)]))
                        .unwrap_or_default(),
                    parameters: &record.params,
                },
                metadata: Metadata {
                    build_started_on: record.start_time.as_deref(),
                    build_finished_on: record.completion_time.as_deref(),
                    completeness: Completeness {
                        parameters: false,
                        environment: false,
                        materials: false,
                    },
                    reproducible: false,
                },
                materials,
            },
        };

        Ok(serde_json::to_value(statement)?)
    }

    fn wrap(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BuildResult, Step};

    fn record() -> BuildRecord {
        let digest = format!("sha256:{}", "1".repeat(64));
        BuildRecord {
            namespace: "default".to_string(),
            name: "build".to_string(),
            uid: "1234".to_string(),
            task_ref: Some("buildah".to_string()),
            params: BTreeMap::from([("IMAGE".to_string(), "app".to_string())]),
            results: vec![
                BuildResult {
                    name: "IMAGE_URL".to_string(),
                    value: "registry.example.com/app".to_string(),
                },
                BuildResult {
                    name: "IMAGE_DIGEST".to_string(),
                    value: digest,
                },
            ],
            steps: vec![
                Step {
                    name: "build".to_string(),
                    image_id: format!(
                        "docker-pullable://quay.io/buildah/stable@sha256:{}",
                        "2".repeat(64)
                    ),
                },
                Step {
                    name: "push".to_string(),
                    image_id: "quay.io/buildah/stable:latest".to_string(),
                },
            ],
            start_time: Some("2024-01-01T00:00:00Z".to_string()),
            completion_time: Some("2024-01-01T00:05:00Z".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn statement_shape() {
        let formatter = Formatter::new(&Config::default()).unwrap();
        let record = record();
        let payload = formatter
            .create_payload(&SignableObject::BuildRecord(&record))
            .unwrap();

        assert_eq!(payload["_type"], STATEMENT_TYPE);
        assert_eq!(payload["predicateType"], PREDICATE_TYPE);
        assert_eq!(payload["subject"][0]["name"], "registry.example.com/app");
        assert_eq!(payload["subject"][0]["digest"]["sha256"], "1".repeat(64));
        assert_eq!(
            payload["predicate"]["builder"]["id"],
            "https://chainsign.dev/builder"
        );
        assert_eq!(
            payload["predicate"]["invocation"]["configSource"]["entryPoint"],
            "buildah"
        );
        assert_eq!(payload["predicate"]["invocation"]["parameters"]["IMAGE"], "app");
        assert_eq!(
            payload["predicate"]["materials"].as_array().unwrap().len(),
            1
        );
        assert_eq!(
            payload["predicate"]["materials"][0]["uri"],
            "oci://quay.io/buildah/stable"
        );
    }

    #[test]
    fn requires_builder_id() {
        let config = Config {
            builder_id: " ".to_string(),
            ..Default::default()
        };

        assert!(Formatter::new(&config).is_err());
    }
}
