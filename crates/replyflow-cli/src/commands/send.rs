use anyhow::{Context, Result};
use replyflow_core::SendRequest;
use replyflow_core::models::Attachment;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{Session, finish};
use crate::cli::{OutputFormat, SendArgs};
use crate::output::TerminalObserver;

pub async fn run(session: &Session, args: SendArgs, format: OutputFormat) -> Result<()> {
    let mut request = SendRequest::new(args.message);
    if let Some(conversation_id) = args.conversation {
        request = request.in_conversation(conversation_id);
    }
    if let Some(path) = args.file {
        request = request.with_attachment(read_attachment(&path)?);
    }
    if args.poll {
        request = request.force_polling();
    }

    let observer = Arc::new(TerminalObserver::new(format.is_json()));
    let outcome = session.orchestrator.send(request, observer).await?;
    info!(
        conversation_id = %outcome.conversation_id,
        message_id = %outcome.message_id,
        transport = outcome.transport.as_str(),
        "Following reply"
    );

    finish(
        &outcome.reply,
        outcome.conversation_id.clone(),
        outcome.message_id.clone(),
        format,
    )
    .await
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("attachment")
        .to_string();
    Ok(Attachment {
        file_name,
        mime_type: mime_for(path).to_string(),
        bytes,
    })
}

fn mime_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mime_for() {
        assert_eq!(mime_for(Path::new("notes.TXT")), "text/plain");
        assert_eq!(mime_for(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("archive")), "application/octet-stream");
    }

    #[test]
    fn test_read_attachment() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{}}").unwrap();

        let attachment = read_attachment(file.path()).unwrap();
        assert_eq!(attachment.mime_type, "application/json");
        assert_eq!(attachment.bytes, b"{}");
        assert!(attachment.file_name.ends_with(".json"));
    }

    #[test]
    fn test_missing_attachment_is_an_error() {
        let error = read_attachment(Path::new("/nonexistent/replyflow.txt")).unwrap_err();
        assert!(error.to_string().contains("Failed to read"));
    }
}
