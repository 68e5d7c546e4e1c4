use clap::Parser;
use std::path::PathBuf;

/// Send one email over SMTP, described by a TOML request file
#[derive(Parser, Debug)]
#[command(name = "smtp-send-email")]
#[command(about = "Send an email with file-glob and inline attachments over SMTP")]
#[command(version)]
pub struct Cli {
    /// Request file with [message], [[attachments]] and [server] sections
    #[arg(long, short = 'r')]
    pub request: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Validate the request without connecting
    #[arg(long)]
    pub dry_run: bool,
}
