// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing state of a build record.
//!
//! The state lives in the record's annotations. Transitions are computed without I/O by
//! [`transition`]; [`persist`] is the only function that writes them back to the record store.
//!
//! ```text
//! Unset ──fail──▶ Retrying(1) ──fail──▶ … ──fail──▶ Retrying(max) ──fail──▶ Failed
//!   │                 │                                   │
//!   └─────────────────┴──────────────success──────────────┴──────────────▶ Signed
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::RecordStoreError,
    record::{AnnotationPatch, BuildRecord, RecordStore},
};

/// Set to `"true"` once a record is signed, or `"failed"` once it can no longer be retried.
pub const SIGNED_ANNOTATION: &str = "chains.tekton.dev/signed";
/// The number of failed signing attempts, present only while the record is not yet terminal.
pub const RETRY_ANNOTATION: &str = "chains.tekton.dev/retries";

const SIGNED: &str = "true";
const FAILED: &str = "failed";

/// Where a build record is in the signing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningState {
    /// No signing attempt has been recorded.
    Unset,
    /// This many signing attempts have failed; always at least 1.
    Retrying(u32),
    /// Signing failed and the retry budget is exhausted.
    Failed,
    /// Every artifact was signed and stored.
    Signed,
}

/// The result of one signing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl SigningState {
    /// Read the state out of a record's annotations.
    ///
    /// An unparsable retry count is treated as no attempts having been made.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        match annotations.get(SIGNED_ANNOTATION).map(String::as_str) {
            Some(SIGNED) => return SigningState::Signed,
            Some(FAILED) => return SigningState::Failed,
            _ => {}
        }

        match annotations.get(RETRY_ANNOTATION) {
            None => SigningState::Unset,
            Some(count) => match count.parse::<u32>() {
                Ok(0) => SigningState::Unset,
                Ok(count) => SigningState::Retrying(count),
                Err(error) => {
                    tracing::warn!(%error, %count, "Ignoring malformed retry annotation");
                    SigningState::Unset
                }
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SigningState::Signed | SigningState::Failed)
    }

    /// The number of failed attempts recorded so far.
    pub fn retries(&self) -> u32 {
        match self {
            SigningState::Retrying(count) => *count,
            _ => 0,
        }
    }

    /// The annotation patch that moves a record into this state.
    ///
    /// `extra` annotations (for example, the transparency log URL) are written alongside the
    /// state annotations.
    pub fn patch(&self, extra: &BTreeMap<String, String>) -> AnnotationPatch {
        let mut patch = AnnotationPatch {
            set: extra.clone(),
            ..Default::default()
        };
        match self {
            SigningState::Unset => {
                patch.remove.insert(SIGNED_ANNOTATION.to_string());
                patch.remove.insert(RETRY_ANNOTATION.to_string());
            }
            SigningState::Retrying(count) => {
                patch
                    .set
                    .insert(RETRY_ANNOTATION.to_string(), count.to_string());
                patch.remove.insert(SIGNED_ANNOTATION.to_string());
            }
            SigningState::Failed => {
                patch
                    .set
                    .insert(SIGNED_ANNOTATION.to_string(), FAILED.to_string());
                patch.remove.insert(RETRY_ANNOTATION.to_string());
            }
            SigningState::Signed => {
                patch
                    .set
                    .insert(SIGNED_ANNOTATION.to_string(), SIGNED.to_string());
                patch.remove.insert(RETRY_ANNOTATION.to_string());
            }
        }
        patch
    }
}

impl std::fmt::Display for SigningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningState::Unset => write!(f, "unset"),
            SigningState::Retrying(count) => write!(f, "retrying ({count} failed attempts)"),
            SigningState::Failed => write!(f, "failed"),
            SigningState::Signed => write!(f, "signed"),
        }
    }
}

/// How many times a record may fail to sign before it is marked failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The number of failed attempts after which the next failure is terminal.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// Whether a record in `state` may be retried after another failure.
    pub fn retry_available(&self, state: SigningState) -> bool {
        match state {
            SigningState::Unset | SigningState::Retrying(_) => state.retries() < self.max_retries,
            SigningState::Failed | SigningState::Signed => false,
        }
    }
}

/// Compute the state a record moves to after a run with the given outcome.
///
/// Terminal states never change.
pub fn transition(state: SigningState, outcome: Outcome, policy: &RetryPolicy) -> SigningState {
    if state.is_terminal() {
        return state;
    }
    match outcome {
        Outcome::Success => SigningState::Signed,
        Outcome::Failure if policy.retry_available(state) => {
            SigningState::Retrying(state.retries() + 1)
        }
        Outcome::Failure => SigningState::Failed,
    }
}

/// Compute the next state for `record` and write it, along with `extra`, in a single patch.
///
/// Returns the state that was written.
pub async fn persist(
    store: &dyn RecordStore,
    record: &BuildRecord,
    outcome: Outcome,
    policy: &RetryPolicy,
    extra: &BTreeMap<String, String>,
) -> Result<SigningState, RecordStoreError> {
    let current = SigningState::from_annotations(&record.annotations);
    let next = transition(current, outcome, policy);
    let patch = next.patch(extra);
    store.patch_annotations(record, &patch).await?;
    tracing::info!(from = %current, to = %next, "Recorded signing outcome");

    Ok(next)
}
