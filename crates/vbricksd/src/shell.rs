//! Interactive console on stdin/stdout.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use vbricks_core::{console, Engine, Outcome};
use vbricks_remote::client;

const PROMPT: &str = "virtualbricks> ";

/// Read commands until `quit` or end of input.
pub async fn run(engine: Engine) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            tracing::debug!("Console input closed");
            return Ok(());
        };
        let (outcome, output) = engine
            .run(move |f| {
                let mut output = Vec::new();
                let outcome = console::parse(f, &line, &mut output);
                (outcome, output)
            })
            .await?;
        stdout.write_all(&output).await?;

        match outcome {
            Outcome::Quit => return Ok(()),
            Outcome::Connect(host) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    match client::connect(&engine, &host).await {
                        Ok(()) => tracing::info!(host = %host, "Connected"),
                        Err(e) => tracing::error!(host = %host, error = %e, "Connection failed"),
                    }
                });
            }
            Outcome::Ok | Outcome::Fail => {}
        }
    }
}
