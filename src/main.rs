mod cli;
mod error;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dwd_bootstrap::{ApiClient, ProvisionRequest, Provisioner};
use dwd_core::diagnose::explain;
use dwd_core::{CredentialStore, DelegateConfig, Diagnostician, Mailer, Observation, OutboundMessage};
use dwd_relay::{GmailSink, ProbeTranscript, RelayProbe, RelayServer};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, DEFAULT_BODY};
use crate::error::CliError;
use crate::report::{BootstrapFailure, SendReport};

/// Exit status when delegation (or the relay) is not working.
const EXIT_MISCONFIGURED: u8 = 2;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut config = DelegateConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.credential {
        config.credential_path = path;
    }
    let json = cli.json;

    match cli.command {
        Commands::Send {
            from,
            to,
            subject,
            body,
            body_file,
            encoding,
        } => {
            let mut builder = OutboundMessage::builder()
                .from(from.as_str())
                .subject(subject.as_str())
                .encoding(encoding.into());
            for rcpt in &to {
                builder = builder.to(rcpt.as_str());
            }
            builder = match (body, body_file) {
                (_, Some(path)) => builder.body_from_file(path)?,
                (Some(text), None) => builder.body(text),
                (None, None) => builder.body(DEFAULT_BODY),
            };
            let message = builder.build()?;
            send(&config, json, message).await
        }
        Commands::Diagnose { subject, recipient } => {
            let mut diagnostician = Diagnostician::from_config(&config)?;
            if let Some(s) = subject {
                diagnostician = diagnostician.with_probe_subject(s);
            }
            if let Some(r) = recipient {
                diagnostician = diagnostician.with_probe_recipient(r);
            }
            let diagnosis = diagnostician
                .diagnose_store(&CredentialStore::from_config(&config))
                .await;
            emit(json, &diagnosis, report::diagnosis)?;
            Ok(status(diagnosis.is_configured()))
        }
        Commands::Relay { host, port, domain } => {
            if let Some(host) = host {
                config.relay.host = host;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            if domain.is_some() {
                config.relay.allowed_domain = domain;
            }
            relay(&config, json).await
        }
        Commands::ProbeRelay {
            addr,
            from,
            to,
            subject,
            delay_ms,
        } => {
            let transcript = ProbeTranscript::new(from, to).with_subject(subject);
            let probe = RelayProbe::new(addr)
                .with_step_delay(Duration::from_millis(delay_ms))
                .with_timeout(config.relay.command_timeout());
            let outcome = probe.run(&transcript).await?;
            emit(json, &outcome, report::probe)?;
            Ok(status(outcome.accepted))
        }
        Commands::Bootstrap {
            project,
            domain,
            account_id,
            key_path,
            overwrite,
            no_enable_apis,
            access_token,
        } => {
            let mut request = ProvisionRequest::new(project.as_str(), domain);
            request.account_id = account_id;
            request.key_path = key_path.unwrap_or_else(|| config.credential_path.clone());
            request.overwrite = overwrite;
            request.enable_apis = !no_enable_apis;

            let provisioner = Provisioner::new(ApiClient::from_config(&config, access_token)?);
            match provisioner.provision(&request).await {
                Ok(done) => {
                    emit(json, &done, report::provision)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => bootstrap_failed(json, &e, &project),
            }
        }
        Commands::Decommission {
            project,
            account_id,
            key_path,
            access_token,
        } => {
            let key_path: PathBuf = key_path.unwrap_or_else(|| config.credential_path.clone());
            let provisioner = Provisioner::new(ApiClient::from_config(&config, access_token)?);
            match provisioner.decommission(&project, &account_id, &key_path).await {
                Ok(done) => {
                    emit(json, &done, report::decommission)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => bootstrap_failed(json, &e, &project),
            }
        }
    }
}

async fn send(config: &DelegateConfig, json: bool, message: OutboundMessage) -> Result<ExitCode, CliError> {
    let mut outcome = SendReport {
        sender: message.from().to_string(),
        recipients: message.to().to_vec(),
        subject: message.subject().to_string(),
        message_id: None,
        diagnosis: None,
    };

    let identity = match CredentialStore::from_config(config).load() {
        Ok(identity) => identity,
        Err(e) => {
            outcome.diagnosis = Some(explain(None, &Observation::from(e), None));
            emit(json, &outcome, report::send)?;
            return Ok(status(false));
        }
    };

    let delivery = Mailer::from_config(config)?.send(&identity, &message).await;
    match delivery.result {
        Ok(ref sent) if sent.is_sent() => {
            outcome.message_id = sent.message_id().map(String::from);
        }
        _ => {
            outcome.diagnosis = Some(explain(Some(&identity), &delivery.observation(), None));
        }
    }
    emit(json, &outcome, report::send)?;
    Ok(status(outcome.message_id.is_some()))
}

async fn relay(config: &DelegateConfig, json: bool) -> Result<ExitCode, CliError> {
    let identity = match CredentialStore::from_config(config).load() {
        Ok(identity) => identity,
        Err(e) => {
            let diagnosis = explain(None, &Observation::from(e), None);
            emit(json, &diagnosis, report::diagnosis)?;
            return Ok(status(false));
        }
    };
    info!(
        "Forwarding as members of {} through {}",
        identity.directory_domain(),
        identity.client_email()
    );

    let mailer = Arc::new(Mailer::from_config(config)?);
    let sink = GmailSink::new(mailer, Arc::new(identity))
        .with_allowed_domain(config.relay.allowed_domain.clone());
    let server = RelayServer::bind(&config.relay, Arc::new(sink)).await?;
    server.serve_until(shutdown_signal()).await?;
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn bootstrap_failed(
    json: bool,
    error: &dwd_bootstrap::BootstrapError,
    project: &str,
) -> Result<ExitCode, CliError> {
    let failure = BootstrapFailure {
        error,
        hints: error.hint(project),
    };
    if json {
        println!("{}", report::json(&failure)?);
    } else {
        eprint!("{}", report::bootstrap_failure(&failure));
    }
    Ok(ExitCode::FAILURE)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<(), CliError> {
    let out = if json { report::json(value)? } else { text(value) };
    println!("{}", out.trim_end());
    Ok(())
}

fn status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_MISCONFIGURED)
    }
}
