//! Debounced filesystem watch → text delivery for a single source file.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Coalesces a burst of editor-save events into one re-read. Tuned for
/// the write pattern of a text editor (several modify events within a
/// handful of milliseconds), not for heavy filesystem traffic.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches the directory containing `target` and signals when `target`
/// itself changes. Holds the underlying OS watch alive for its lifetime.
pub struct SourceWatcher {
    target: PathBuf,
    _watcher: RecommendedWatcher,
}

impl SourceWatcher {
    /// Start watching. Returns the watcher (keep it alive for as long as
    /// you want events) and the channel side the caller drains.
    pub fn new(target: &Path) -> notify::Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let canonical_target = target
            .canonicalize()
            .unwrap_or_else(|_| target.to_path_buf());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if !matches!(
                event.kind,
                notify::EventKind::Modify(_) | notify::EventKind::Create(_)
            ) {
                return;
            }
            let touches_target = event
                .paths
                .iter()
                .any(|p| p.canonicalize().as_deref() == Ok(canonical_target.as_path()));
            if touches_target {
                let _ = tx.send(());
            }
        })?;

        let parent = target.parent().filter(|p| !p.as_os_str().is_empty());
        let watch_dir = parent.unwrap_or_else(|| Path::new("."));
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

        Ok((
            Self {
                target: target.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Drain change notifications and invoke `handler(text)` once per
    /// coalesced burst. Re-entry is serialized: the next read does not
    /// begin until `handler`'s future resolves.
    pub async fn run<F, Fut>(&self, mut changes: mpsc::UnboundedReceiver<()>, mut handler: F)
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        while changes.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while changes.try_recv().is_ok() {}

            if let Ok(text) = tokio::fs::read_to_string(&self.target).await {
                handler(text).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn detects_a_write_to_the_target_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# initial\n").unwrap();

        let (watcher, rx) = SourceWatcher::new(&path).unwrap();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(async move {
            watcher
                .run(rx, |text| {
                    let done_tx = done_tx.clone();
                    async move {
                        let _ = done_tx.send(text);
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "# appended").unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("timed out waiting for watcher")
            .expect("channel closed");
        assert!(text.contains("appended"));

        run.abort();
    }
}
