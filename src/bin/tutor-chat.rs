use anyhow::Result;
use clap::Parser;
use std::io::Write;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tutorstream::api::ChatClient;
use tutorstream::config::Config;
use tutorstream::logging::init_tracing;
use tutorstream::state::{ChatSession, TurnStatus, TurnUpdate};

#[derive(Parser)]
#[command(name = "tutor-chat", about = "Send one message through the tutor relay")]
struct Cli {
    /// Message to send
    message: String,

    /// Subject the tutor should answer in
    #[arg(long, default_value = "general")]
    subject: String,

    /// Session identifier forwarded to the backend
    #[arg(long)]
    session_id: Option<String>,

    /// Relay chat endpoint (overrides TUTOR_RELAY_URL)
    #[arg(long)]
    relay_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(relay_url) = cli.relay_url {
        config.relay_url = relay_url;
    }
    config.validate()?;
    init_tracing(config.log_json);

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let mut session =
        ChatSession::new(ChatClient::from_config(&config), cli.subject).with_cancellation(cancel);
    if let Some(session_id) = cli.session_id {
        session = session.with_session_id(session_id);
    }

    let (update_tx, mut update_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(update) = update_rx.recv().await {
            match update {
                TurnUpdate::Token(token) => {
                    let _ = write!(stdout, "{token}");
                    let _ = stdout.flush();
                }
                TurnUpdate::Tool(tool) => {
                    let _ = writeln!(stdout, "\n[tool requested: {}]", tool.name);
                }
                TurnUpdate::Finalized(_) | TurnUpdate::Failed(_) => {}
            }
        }
    });

    let report = session.send_message(cli.message, Some(&update_tx)).await?;
    drop(update_tx);
    let _ = printer.await;

    println!("\n\n{}", report.text);
    if let TurnStatus::Failed(reason) = &report.status {
        tracing::error!(%reason, "chat turn failed");
        std::process::exit(1);
    }
    Ok(())
}
