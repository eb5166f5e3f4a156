pub mod poll;
pub mod send;

use anyhow::{Result, bail};
use colored::Colorize;
use replyflow_core::{
    AuthFailureHandler, ConnectionManager, FallbackPoller, HttpChatBackend, MessageDispatcher,
    MessageOrchestrator, ReplyHandle, ReplyflowConfig, SendPhase, StaticCredentials,
    Subscription,
};
use std::path::Path;
use std::sync::Arc;

use crate::cli::{Cli, Commands, OutputFormat};
use crate::completions;
use crate::output::{ReplySummary, print_json};

pub async fn run(cli: Cli) -> Result<()> {
    let format = cli.format;
    match cli.command {
        Commands::Completions { shell } => {
            completions::generate_completions(shell);
            Ok(())
        }
        Commands::Send(args) => {
            let config = load_config(cli.config.as_deref(), cli.base_url)?;
            let session = Session::new(&config, cli.token);
            let result = send::run(&session, args, format).await;
            session.shutdown();
            result
        }
        Commands::Poll(args) => {
            let config = load_config(cli.config.as_deref(), cli.base_url)?;
            let session = Session::new(&config, cli.token);
            let result = poll::run(&session, args, format).await;
            session.shutdown();
            result
        }
    }
}

fn load_config(path: Option<&Path>, base_url: Option<String>) -> Result<ReplyflowConfig> {
    let mut config = match path {
        Some(path) => ReplyflowConfig::from_file(path)?,
        None => ReplyflowConfig::load()?,
    };
    if let Some(base_url) = base_url {
        config.base_url = base_url;
    }
    Ok(config)
}

struct SignInNotice;

impl AuthFailureHandler for SignInNotice {
    fn on_auth_failure(&self) {
        eprintln!("{}", "Credential rejected, sign in again.".yellow());
    }
}

/// Wired-up delivery stack for one command.
pub struct Session {
    pub orchestrator: MessageOrchestrator,
    connection: ConnectionManager,
    attached: Subscription,
}

impl Session {
    pub fn new(config: &ReplyflowConfig, token: Option<String>) -> Self {
        let credentials = Arc::new(StaticCredentials::new(token));
        let backend = Arc::new(HttpChatBackend::new(&config.base_url, credentials.clone()));
        let connection = ConnectionManager::new(config.connection_config());
        let dispatcher = MessageDispatcher::new(config.buffer_config());
        let attached = dispatcher.attach(&connection);
        let poller = FallbackPoller::new(backend.clone(), config.poller_config());
        let orchestrator =
            MessageOrchestrator::new(backend, connection.clone(), dispatcher, poller, credentials)
                .with_auth_failure_handler(Arc::new(SignInNotice));

        Self {
            orchestrator,
            connection,
            attached,
        }
    }

    fn shutdown(self) {
        self.attached.unsubscribe();
        self.connection.close();
    }
}

/// Wait for the reply, cancelling it on Ctrl-C.
async fn wait_for_reply(reply: &ReplyHandle) -> SendPhase {
    tokio::select! {
        phase = reply.wait() => phase,
        _ = tokio::signal::ctrl_c() => {
            reply.cancel();
            reply.wait().await
        }
    }
}

async fn finish(
    reply: &ReplyHandle,
    conversation_id: String,
    message_id: String,
    format: OutputFormat,
) -> Result<()> {
    let phase = wait_for_reply(reply).await;
    if phase == SendPhase::Error {
        bail!(
            "{}",
            reply
                .error()
                .unwrap_or_else(|| "reply failed".to_string())
        );
    }
    if format.is_json() {
        print_json(&ReplySummary {
            conversation_id,
            message_id,
            content: reply.content(),
            stopped: reply.is_stopped(),
        })?;
    }
    Ok(())
}
