// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Chainsign

Chainsign signs the artifacts produced by a completed build and records the outcome on the build
record itself.

Given a [`record::BuildRecord`], the [`signer::RecordSigner`] asks each enabled
[`artifacts::Signable`] for the objects it can extract, formats each object into an attestation
payload, signs the payload, stores the signed payload in every configured storage backend, and
optionally uploads the signature to a transparency log. The outcome is written back to the
record's annotations in a single patch:

* `chains.tekton.dev/signed=true` once every object was signed and stored,
* `chains.tekton.dev/retries=N` after a failed run that may be retried, and
* `chains.tekton.dev/signed=failed` once the retry budget is exhausted.

## Components

Signers, formatters, storage backends, the transparency log, and the record store are all
traits. The crate ships a local-key x509 signer, three payload formats (`tekton`, `in-toto`, and
`simplesigning`), a directory storage backend, and a JSON file record store, which is enough to
run the `chainsign` CLI against build records on disk.

## Crate features

* **cli** -
  Build the `chainsign` CLI. This is not enabled by default.
*/

pub mod artifacts;
pub mod config;
pub mod error;
pub mod formats;
pub mod record;
pub mod signer;
pub mod signing;
pub mod state;
pub mod storage;
pub mod transparency;

pub use signer::RecordSigner;

/// Cancel `halt_token` when the process receives SIGINT or SIGTERM.
///
/// An in-flight signing run stops at its next I/O boundary and leaves the build record untouched.
/// The handler returns once the token is cancelled, whether by a signal or by the caller.
#[cfg(feature = "cli")]
pub async fn cancel_on_signal(
    halt_token: tokio_util::sync::CancellationToken,
) -> Result<(), anyhow::Error> {
    use anyhow::Context;
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;

    let received = tokio::select! {
        _ = halt_token.cancelled() => return Ok(()),
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    };
    tracing::warn!(signal = received, "Signal received; abandoning the signing run");
    halt_token.cancel();
    Ok(())
}
