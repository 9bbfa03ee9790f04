//! Ties kernel lifecycle and the raw protocol client to cell identity:
//! every execution is correlated back to the `Hash` that requested it.

use crate::error::KernelLifecycleError;
use crate::hash::Hash;
use crate::kernel::client::{KernelClient, KernelMessage};
use crate::kernel::manager::KernelManager;
use jupyter_protocol::JupyterMessageContent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// An event produced by the receive/dispatch pipeline, for the coordinator
/// to fold into the Document.
#[derive(Debug)]
pub enum AdapterEvent {
    /// A parsed iopub message, with its originating cell resolved (or
    /// `None` if the parent msg_id is unknown, which is logged but not
    /// fatal).
    Message {
        hash: Option<Hash>,
        content: JupyterMessageContent,
    },
    /// The IOPub channel reported a read failure; the session is over.
    Lost(String),
}

/// Wraps a `KernelManager` + `KernelClient` pair with a hash-keyed
/// correlation table and the background dispatch worker that drains the
/// client's message channel.
pub struct KernelAdapter {
    manager: KernelManager,
    client: KernelClient,
    correlation: Arc<Mutex<HashMap<String, Hash>>>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl KernelAdapter {
    /// Start a kernel, connect to it, and spawn the dispatch worker.
    /// Returns the adapter plus the event stream the coordinator drains.
    pub async fn start(
        kernel_name: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>), KernelLifecycleError> {
        let manager = KernelManager::start(kernel_name)
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: kernel_name.unwrap_or("python3").to_string(),
                source,
            })?;

        let (client, kernel_rx) =
            KernelClient::connect(manager.connection_info())
                .await
                .map_err(|source| KernelLifecycleError::StartFailed {
                    name: kernel_name.unwrap_or("python3").to_string(),
                    source,
                })?;

        let correlation = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        spawn_dispatch_worker(kernel_rx, correlation.clone(), events_tx.clone());

        let mut adapter = Self {
            manager,
            client,
            correlation,
            events_tx,
        };
        let _ = adapter.client.request_kernel_info().await;

        Ok((adapter, events_rx))
    }

    /// Dispatch code for execution, recording the msg_id → hash mapping so
    /// replies can be routed back to this cell. Entries are never removed:
    /// the table is bounded only by total executions in the session.
    pub async fn execute(&mut self, hash: Hash, code: &str) -> Result<(), KernelLifecycleError> {
        let msg_id = self
            .client
            .execute(code)
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: "execute".to_string(),
                source,
            })?;
        self.correlation.lock().unwrap().insert(msg_id, hash);
        Ok(())
    }

    /// Restart the kernel process and reconnect, preserving the
    /// correlation map: executions dispatched before the restart become
    /// orphaned (their replies never arrive) but are otherwise harmless.
    pub async fn restart(&mut self) -> Result<(), KernelLifecycleError> {
        self.manager
            .restart()
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: "restart".to_string(),
                source,
            })?;

        let (client, kernel_rx) = KernelClient::connect(self.manager.connection_info())
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: "restart".to_string(),
                source,
            })?;
        self.client = client;

        spawn_dispatch_worker(kernel_rx, self.correlation.clone(), self.events_tx.clone());
        let _ = self.client.request_kernel_info().await;
        Ok(())
    }

    /// Best-effort SIGINT-equivalent; does not wait for a reply.
    pub async fn interrupt(&mut self) -> Result<(), KernelLifecycleError> {
        self.client
            .interrupt()
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: "interrupt".to_string(),
                source,
            })
    }

    /// Request kernel shutdown, then tear down the process.
    pub async fn shutdown(&mut self) -> Result<(), KernelLifecycleError> {
        let _ = self.client.shutdown(false).await;
        self.manager
            .shutdown()
            .await
            .map_err(|source| KernelLifecycleError::StartFailed {
                name: "shutdown".to_string(),
                source,
            })
    }
}

/// Drain the client's raw message channel, resolve each message's parent
/// hash through the correlation table, and forward it as an `AdapterEvent`.
/// There is no shell-reply arm: the client never surfaces shell replies
/// on this channel (the `STATUS=idle` iopub message alone drives cell
/// completion, and an error reply duplicates the iopub `ERROR` event),
/// so there is nothing for the worker to ignore here.
fn spawn_dispatch_worker(
    mut kernel_rx: mpsc::UnboundedReceiver<KernelMessage>,
    correlation: Arc<Mutex<HashMap<String, Hash>>>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
) {
    tokio::spawn(async move {
        while let Some(msg) = kernel_rx.recv().await {
            match msg {
                KernelMessage::IoPub(jupyter_msg) => {
                    let hash = jupyter_msg
                        .parent_header
                        .as_ref()
                        .and_then(|h| correlation.lock().unwrap().get(&h.msg_id).copied());
                    if events_tx
                        .send(AdapterEvent::Message {
                            hash,
                            content: jupyter_msg.content,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                KernelMessage::IoPubError(e) => {
                    let _ = events_tx.send(AdapterEvent::Lost(e));
                    break;
                }
            }
        }
    });
}
