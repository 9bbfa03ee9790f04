mod cell;
mod cli;
mod coordinator;
mod document;
mod error;
mod hash;
mod kernel;
mod parser;
mod render;
mod transport;
mod watcher;
mod wire;

use clap::Parser;
use cli::Cli;
use error::EngineError;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = cli.validate() {
        eprintln!("knitj: {err}");
        std::process::exit(1);
    }
    let format = match cli.resolve_format() {
        Ok(format) => format,
        Err(err) => {
            eprintln!("knitj: {err}");
            std::process::exit(1);
        }
    };

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    let result = rt.block_on(run(cli, format));

    match result {
        Ok(()) => {
            tracing::info!("leaving knitj");
        }
        Err(err) => {
            tracing::error!(%err, "knitj terminated with an error");
            std::process::exit(err.exit_code());
        }
    }
}

async fn run(cli: Cli, format: parser::Format) -> Result<(), EngineError> {
    if cli.server {
        let source_path = cli.source.clone().expect("validated by Cli::validate");
        let output_path = cli
            .resolve_output()
            .expect("server mode always has an output path");

        let config = coordinator::ServerConfig {
            source_path,
            output_path,
            format,
            kernel_name: cli.kernel.clone(),
            host: "127.0.0.1".to_string(),
            port_range: (8080, 8099),
            static_dir: std::env::var_os("KNITJ_STATIC_DIR").map(Into::into),
            browser: cli
                .browser_choice()
                .map(|b| b.map(|s| s.to_string())),
        };

        let shutdown = Arc::new(Notify::new());
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                    shutdown.notify_waiters();
                }
            }
        });

        coordinator::run_server(config, shutdown).await
    } else {
        let input = match &cli.source {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|source| EngineError::Io {
                    path: path.clone(),
                    source,
                })?,
            None => {
                use tokio::io::AsyncReadExt;
                let mut buf = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut buf)
                    .await
                    .map_err(|source| EngineError::Io {
                        path: "<stdin>".into(),
                        source,
                    })?;
                buf
            }
        };

        match &cli.output {
            Some(path) => {
                let file = tokio::fs::File::create(path)
                    .await
                    .map_err(|source| EngineError::Io {
                        path: path.clone(),
                        source,
                    })?;
                coordinator::run_batch(format, input, cli.kernel.as_deref(), file).await
            }
            None => coordinator::run_batch(format, input, cli.kernel.as_deref(), tokio::io::stdout()).await,
        }
    }
}
