use anyhow::Result;
use clap::Parser;
use cmd_cli::app::{line_source, App, CliArgs, Input};
use cmd_cli::config::Config;
use cmd_cli::Error;
use crossterm::style::Stylize;
use std::io::IsTerminal;
use tokio::io::{AsyncBufRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TTY_PATH: &str = "/dev/tty";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmd_cli=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Help output counts as a failed invocation too.
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    match run(args, &cancel).await {
        Ok(()) => Ok(()),
        // The failing program has already reported on stderr.
        Err(e @ Error::Execution { .. }) => std::process::exit(e.exit_code()),
        Err(e) => {
            eprintln!("{}", format!("error: {}", e).yellow());
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(args: CliArgs, cancel: &CancellationToken) -> cmd_cli::Result<()> {
    let piped = read_piped_stdin().await?;
    let tty: Option<Box<dyn AsyncBufRead + Unpin + Send>> = if args.interactive {
        let file = std::fs::File::open(TTY_PATH).map_err(|e| {
            Error::Generic(format!("failed to open {}: {}", TTY_PATH, e))
        })?;
        Some(line_source(std::io::BufReader::new(file)))
    } else {
        None
    };

    let mut app = App::load(Config::default_path()?)?;
    app.run(&args, Input { piped, tty }, cancel).await
}

async fn read_piped_stdin() -> cmd_cli::Result<Option<String>> {
    if std::io::stdin().is_terminal() {
        return Ok(None);
    }
    let mut piped = String::new();
    tokio::io::stdin()
        .read_to_string(&mut piped)
        .await
        .map_err(|e| Error::Generic(format!("failed to read from pipe: {}", e)))?;
    Ok(Some(piped))
}
