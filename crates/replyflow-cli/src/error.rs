use colored::Colorize;

pub fn handle_error(err: anyhow::Error) -> ! {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    let msg = format!("{:#}", err).to_lowercase();

    if msg.contains("unauthorized") || msg.contains("rejected the credential") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Provide a valid token with:");
        eprintln!("  {} export REPLYFLOW_TOKEN=<token>", "$".dimmed());
    }

    if msg.contains("polling timed out") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  The reply may still be generating. Resume with:");
        eprintln!(
            "  {} replyflow poll <message-id> --conversation <id>",
            "$".dimmed()
        );
    }

    if msg.contains("connection refused") || msg.contains("error sending request") {
        eprintln!("\n{}", "Suggestion:".yellow().bold());
        eprintln!("  Check that the backend is reachable, or set --base-url.");
    }

    std::process::exit(1);
}
