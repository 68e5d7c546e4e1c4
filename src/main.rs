use anyhow::Result;
use clap::Parser;
use smtp_send_email::cli::Cli;
use smtp_send_email::smtp::MessageAssembler;
use smtp_send_email::{send_email, SendEmailRequest};
use tokio_util::sync::CancellationToken;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let request = SendEmailRequest::load_from_file(&cli.request).await?;

    if cli.dry_run {
        let assembled = MessageAssembler::assemble(&request.message)?;
        request.server.validate()?;
        println!(
            "Would send to {} recipient(s) via {}:{} with {} attachment entries",
            assembled.recipient_count(),
            request.server.host,
            request.server.port,
            request.attachments.len()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling send");
            ctrl_c.cancel();
        }
    });

    let outcome = send_email(&request.message, &request.attachments, &request.server, &cancel).await?;
    println!("{}", outcome.status);

    Ok(())
}
