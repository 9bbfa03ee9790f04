//! The websocket JSON protocol between the coordinator and connected browsers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server → client. Hashes cross the wire as their hex string, matching
/// the CSS class already used to identify a cell's DOM node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Replace one cell's DOM subtree.
    Cell { hashid: String, html: String },
    /// Authoritative cell order, plus the rendered HTML of the cells
    /// whose content changed in this round.
    Document {
        hashids: Vec<String>,
        htmls: BTreeMap<String, String>,
    },
    /// Advisory: the kernel is (re)starting, nothing is running yet.
    KernelStarting,
}

/// Client → server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    Reevaluate { hashids: Vec<String> },
    RestartKernel,
    InterruptKernel,
    Ping,
}
