use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Session, finish};
use crate::cli::{OutputFormat, PollArgs};
use crate::output::TerminalObserver;

pub async fn run(session: &Session, args: PollArgs, format: OutputFormat) -> Result<()> {
    let observer = Arc::new(TerminalObserver::new(format.is_json()));
    let reply = session.orchestrator.follow(
        &args.message_id,
        &args.conversation,
        observer,
        CancellationToken::new(),
    );
    finish(&reply, args.conversation, args.message_id, format).await
}
