// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use chainsign::{
    config::load_config,
    record::JsonFileStore,
    cancel_on_signal, RecordSigner,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

/// Sign the artifacts of completed builds.
///
/// Signed payloads are written to the configured storage backends, and the outcome is recorded
/// in the build record's annotations.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the configuration file.
    ///
    /// If no path is provided, $CONFIGURATION_DIRECTORY/chainsign/config.toml is used if it
    /// exists, and the defaults otherwise. To view the configuration, run the `config`
    /// subcommand.
    #[arg(long, short, env = "CHAINSIGN_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "CHAINSIGN_LOG", default_value = "WARN,chainsign=INFO")]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Sign a build record stored as a JSON file.
    ///
    /// The record's annotations are updated in place with the outcome.
    Sign {
        /// The JSON-encoded build record.
        #[arg(long)]
        record: PathBuf,
    },

    /// See the current configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "CHAINSIGN_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .context("failed to install the global log subscriber")?;

    let config = load_config(opts.config)?;

    match opts.command {
        Command::Sign { record } => {
            let store = JsonFileStore::new(&record);
            let build_record = store
                .load()
                .await
                .with_context(|| format!("failed to load the build record from {record:?}"))?;

            let halt_token = CancellationToken::new();
            tokio::spawn(cancel_on_signal(halt_token.clone()));

            let root_span = tracing::info_span!("chainsign");
            async move {
                let signer = RecordSigner::new(config, Arc::new(store));
                signer
                    .sign(&halt_token, &build_record)
                    .await
                    .with_context(|| format!("failed to sign {build_record}"))
            }
            .instrument(root_span)
            .await?;
        }
        Command::Config => {
            println!(
                "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
            );
        }
    }

    Ok(())
}
