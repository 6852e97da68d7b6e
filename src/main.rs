// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! CLI entry point for the scheduler process (§6 "CLI surface").

use clap::Parser;
use scheduler_config::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Starts the scheduler's worker/client comm listener and runs until shutdown.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file. Unset fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the worker/client comm listener to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the worker/client comm listener to.
    #[arg(long)]
    port: Option<u16>,

    /// Path of a JSON identity file written on start, removed on shutdown.
    #[arg(long)]
    scheduler_file: Option<String>,

    /// Number of task failures tolerated before a task is poisoned.
    #[arg(long)]
    allowed_failures: Option<u32>,

    /// Path to a PEM certificate chain, enabling TLS on the comm listener.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// Path to the PEM private key paired with `--tls-cert`.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Path to a CA bundle, enabling mutual TLS.
    #[arg(long)]
    tls_ca_file: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<Config, scheduler_config::error::Error> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.scheduler_file.is_some() {
            config.scheduler_file = self.scheduler_file;
        }
        if let Some(allowed_failures) = self.allowed_failures {
            config.scheduling.allowed_failures = allowed_failures;
        }
        if let Some(cert) = self.tls_cert {
            config.tls = Some(scheduler_config::TlsConfig {
                cert,
                key: self.tls_key.unwrap_or_default(),
                ca_file: self.tls_ca_file,
            });
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return std::process::ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();

    let result = runtime.block_on(async move {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_for_signal.cancel();
        });
        scheduler_server::run(config, shutdown).await
    });

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "scheduler exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}
