use anyhow::Result;
use colored::Colorize;
use replyflow_core::models::MessageStatus;
use replyflow_core::{ReplyError, ReplyObserver};
use serde::Serialize;
use std::io::Write;
use tracing::debug;

/// Streams reply text to stdout. Notices go to stderr so stdout carries only
/// the reply.
pub struct TerminalObserver {
    quiet: bool,
}

impl TerminalObserver {
    /// A quiet observer prints nothing; used with `--format json`.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn write(&self, text: &str) {
        if self.quiet {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

impl ReplyObserver for TerminalObserver {
    fn on_token(&self, token: &str) {
        self.write(token);
    }

    fn on_replace(&self, content: &str) {
        if !self.quiet {
            eprintln!("\n{}", "[reply rewritten]".dimmed());
        }
        self.write(content);
    }

    fn on_status(&self, status: MessageStatus) {
        debug!(status = %status, "Reply status changed");
    }

    fn on_conversation(&self, conversation_id: &str, created: bool) {
        if created && !self.quiet {
            eprintln!("{} {}", "New conversation:".dimmed(), conversation_id);
        }
    }

    fn on_complete(&self, _content: &str, stopped: bool) {
        if self.quiet {
            return;
        }
        self.write("\n");
        if stopped {
            eprintln!("{}", "[stopped]".yellow());
        }
    }

    fn on_error(&self, error: &ReplyError) {
        debug!(error = %error, "Reply failed");
    }
}

#[derive(Debug, Serialize)]
pub struct ReplySummary {
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    pub stopped: bool,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(value)?;
    println!("{output}");
    Ok(())
}
