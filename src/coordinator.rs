//! Owns the Document, the kernel adapter, the transport, and the watcher;
//! runs either the batch or the server pipeline described by the CLI.

use crate::cell::Cell;
use crate::document::Document;
use crate::error::EngineError;
use crate::hash::Hash;
use crate::kernel::adapter::{AdapterEvent, KernelAdapter};
use crate::parser::{self, Format};
use crate::render::Renderer;
use crate::transport::Transport;
use crate::watcher::SourceWatcher;
use crate::wire::{ClientMessage, ServerMessage};
use jupyter_protocol::JupyterMessageContent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Notify};

/// Run the one-shot pipeline: read all of `input`, submit every code cell,
/// stream the page to `output` in source order as each cell completes.
pub async fn run_batch(
    format: Format,
    input: String,
    kernel_name: Option<&str>,
    mut output: impl tokio::io::AsyncWrite + Unpin,
) -> Result<(), EngineError> {
    let mut document = Document::new();
    let parsed = parser::parse(format, &input)?;
    let reconcile = document.update_from_source(parsed);
    document.begin_round(&reconcile.new_cells);

    let renderer = Renderer::new();
    let (mut adapter, mut events) = KernelAdapter::start(kernel_name).await?;

    let order: Vec<Hash> = document.cells().map(Cell::hash).collect();
    for hash in &order {
        if let Some(code) = code_of(&document, *hash) {
            adapter.execute(*hash, &code).await?;
        }
    }
    tracing::info!(cells = order.len(), "code cells submitted to kernel");

    output
        .write_all(renderer.page_prologue(&document).as_bytes())
        .await
        .map_err(|source| io_err(source, "<stdout>"))?;

    for hash in &order {
        if let Some(cell) = document.get(*hash) {
            if let Some(code_cell) = cell.as_code() {
                let signal = code_cell.completion.clone();
                wait_with_pump(&signal, &mut events, &mut document).await;
            }
        }
        let html = document
            .get(*hash)
            .map(|c| renderer.render_cell(c))
            .unwrap_or_default();
        output
            .write_all(html.as_bytes())
            .await
            .map_err(|source| io_err(source, "<stdout>"))?;
    }

    output
        .write_all(renderer.page_epilogue(false).as_bytes())
        .await
        .map_err(|source| io_err(source, "<stdout>"))?;
    output
        .flush()
        .await
        .map_err(|source| io_err(source, "<stdout>"))?;

    adapter.shutdown().await?;
    Ok(())
}

/// Drain kernel events, applying each to the document, until `signal`
/// fires. Events for cells other than the one being awaited are still
/// applied so later cells see up-to-date state when their turn comes.
async fn wait_with_pump(
    signal: &crate::cell::CompletionSignal,
    events: &mut mpsc::UnboundedReceiver<AdapterEvent>,
    document: &mut Document,
) {
    loop {
        if signal.is_done() {
            return;
        }
        tokio::select! {
            biased;
            _ = signal.wait() => return,
            event = events.recv() => {
                match event {
                    Some(AdapterEvent::Message { hash: Some(hash), content }) => {
                        document.apply_message(hash, &content);
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        }
    }
}

fn io_err(source: std::io::Error, path: &str) -> EngineError {
    EngineError::Io {
        path: PathBuf::from(path),
        source,
    }
}

fn code_of(document: &Document, hash: Hash) -> Option<String> {
    document
        .get(hash)
        .and_then(Cell::as_code)
        .map(|c| c.code.clone())
}

/// Configuration for the live server pipeline.
pub struct ServerConfig {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub format: Format,
    pub kernel_name: Option<String>,
    pub host: String,
    pub port_range: (u16, u16),
    pub static_dir: Option<PathBuf>,
    /// `None` means do not open a browser; `Some(None)` opens the system
    /// default; `Some(Some(name))` opens a named browser.
    pub browser: Option<Option<String>>,
}

/// Run the live server pipeline until `shutdown` is notified.
pub async fn run_server(config: ServerConfig, shutdown: Arc<Notify>) -> Result<(), EngineError> {
    let mut document = Document::new();

    let source_text = tokio::fs::read_to_string(&config.source_path)
        .await
        .map_err(|source| io_err(source, &config.source_path.display().to_string()))?;
    let parsed = parser::parse(config.format, &source_text)?;
    let reconcile = document.update_from_source(parsed);

    // Seed outputs from a previous run's rendered page onto the cells
    // `update_from_source` just created, so unchanged cells don't
    // re-execute on every restart (§4.6).
    if config.output_path.exists() {
        if let Ok(existing) = tokio::fs::read_to_string(&config.output_path).await {
            document.load_from_html(&existing);
        }
    }

    // Only cells `load_from_html` didn't seed an output onto still need
    // to run; a cell seeded with output is already done.
    let to_execute: Vec<Hash> = reconcile
        .new_cells
        .iter()
        .copied()
        .filter(|hash| {
            document
                .get(*hash)
                .and_then(Cell::as_code)
                .map(|c| !c.is_done())
                .unwrap_or(false)
        })
        .collect();
    document.begin_round(&to_execute);

    let renderer = Renderer::new();
    let (mut adapter, mut kernel_events) =
        KernelAdapter::start(config.kernel_name.as_deref()).await?;

    let (transport, mut client_messages) =
        Transport::new(renderer.render_page(&document, true), config.static_dir.clone());

    let port = transport
        .serve(&config.host, config.port_range.0, config.port_range.1, {
            let shutdown = shutdown.clone();
            async move { shutdown.notified().await }
        })
        .await?;
    tracing::info!(port, "server mode ready");

    if let Some(choice) = &config.browser {
        open_browser(choice.as_deref(), port, &config.host);
    }

    let (file_tx, mut file_rx) = mpsc::unbounded_channel::<String>();
    let (watcher, changes) =
        SourceWatcher::new(&config.source_path).map_err(|err| EngineError::Io {
            path: config.source_path.clone(),
            source: std::io::Error::other(err),
        })?;
    tokio::spawn(async move {
        watcher
            .run(changes, |text| {
                let file_tx = file_tx.clone();
                async move {
                    let _ = file_tx.send(text);
                }
            })
            .await;
    });

    for hash in &to_execute {
        if let Some(code) = code_of(&document, *hash) {
            adapter.execute(*hash, &code).await?;
        }
    }

    persist(&config.output_path, &transport, &renderer, &document).await;

    loop {
        tokio::select! {
            Some(text) = file_rx.recv() => {
                on_file_change(
                    &mut document,
                    &renderer,
                    &transport,
                    &mut adapter,
                    config.format,
                    text,
                )
                .await;
                persist(&config.output_path, &transport, &renderer, &document).await;
            }
            Some(event) = kernel_events.recv() => {
                match event {
                    AdapterEvent::Message { hash: Some(hash), content } => {
                        document.apply_message(hash, &content);
                        if let Some(cell) = document.get(hash) {
                            let html = renderer.render_cell(cell);
                            transport.broadcast(ServerMessage::Cell {
                                hashid: hash.hex(),
                                html,
                            });
                        }
                        persist(&config.output_path, &transport, &renderer, &document).await;
                    }
                    AdapterEvent::Message { hash: None, content } => {
                        if is_kernel_starting(&content) {
                            transport.broadcast(ServerMessage::KernelStarting);
                        }
                    }
                    AdapterEvent::Lost(reason) => {
                        tracing::error!(%reason, "kernel channel lost");
                        break;
                    }
                }
            }
            Some(msg) = client_messages.recv() => {
                on_client_message(&mut document, &mut adapter, msg).await;
            }
            _ = shutdown.notified() => break,
        }
    }

    adapter.shutdown().await?;
    Ok(())
}

/// Mirrors `Document::apply_message`'s string-matched comparison against
/// `execution_state`, since the handful of states this engine cares about
/// (idle, starting) aren't worth a direct match on an enum whose variant
/// set the kernel protocol can extend.
fn is_kernel_starting(content: &JupyterMessageContent) -> bool {
    match content {
        JupyterMessageContent::Status(status) => {
            format!("{:?}", status.execution_state).to_lowercase() == "starting"
        }
        _ => false,
    }
}

async fn on_file_change(
    document: &mut Document,
    renderer: &Renderer,
    transport: &Transport,
    adapter: &mut KernelAdapter,
    format: Format,
    text: String,
) {
    let parsed = match parser::parse(format, &text) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(%err, "parse error on file change, document left unchanged");
            return;
        }
    };

    let reconcile = document.update_from_source(parsed);
    document.begin_round(&reconcile.new_cells);

    let hashids: Vec<String> = document.cells().map(|c| c.hash().hex()).collect();
    let htmls = reconcile
        .updated_cells()
        .iter()
        .filter_map(|hash| document.get(*hash).map(|c| (hash.hex(), renderer.render_cell(c))))
        .collect();
    transport.broadcast(ServerMessage::Document { hashids, htmls });

    for hash in &reconcile.new_cells {
        if let Some(code) = code_of(document, *hash) {
            if let Err(err) = adapter.execute(*hash, &code).await {
                tracing::error!(%err, "failed to dispatch new cell for execution");
            }
        }
    }
}

async fn on_client_message(document: &mut Document, adapter: &mut KernelAdapter, msg: ClientMessage) {
    match msg {
        ClientMessage::Reevaluate { hashids } => {
            for hex in hashids {
                let Some(hash) = Hash::from_hex(&hex) else { continue };
                let Some(code) = document.get_code_mut(hash).map(|c| {
                    c.reset();
                    c.code.clone()
                }) else {
                    continue;
                };
                if let Err(err) = adapter.execute(hash, &code).await {
                    tracing::error!(%err, "failed to redispatch reevaluated cell");
                }
            }
        }
        ClientMessage::RestartKernel => {
            if let Err(err) = adapter.restart().await {
                tracing::error!(%err, "kernel restart failed");
            }
        }
        ClientMessage::InterruptKernel => {
            if let Err(err) = adapter.interrupt().await {
                tracing::error!(%err, "kernel interrupt failed");
            }
        }
        ClientMessage::Ping => {}
    }
}

/// Rewrite the output HTML file and the transport's cached page. The
/// coordinator is the only writer of this file (§5).
async fn persist(output_path: &Path, transport: &Transport, renderer: &Renderer, document: &Document) {
    let page = renderer.render_page(document, true);
    transport.set_page(page.clone()).await;
    if let Err(err) = tokio::fs::write(output_path, page).await {
        tracing::error!(%err, path = %output_path.display(), "failed to persist output HTML");
    }
}

/// Best-effort open of a browser tab pointing at the running server.
pub fn open_browser(choice: Option<&str>, port: u16, host: &str) {
    let url = format!("http://{host}:{port}");
    let result = match choice {
        Some(browser) => open::with(&url, browser),
        None => open::that(&url),
    };
    if let Err(err) = result {
        tracing::warn!(%err, "failed to open browser");
    }
}
