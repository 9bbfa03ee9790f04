//! The live document: an ordered cell sequence reconciled against a parsed
//! source and driven forward by kernel messages.

use crate::cell::{Cell, CodeCell, media_to_map};
use crate::hash::Hash;
use crate::parser::ParseResult;
use jupyter_protocol::JupyterMessageContent;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// The reconciled result of re-parsing source against the previous document:
/// which cells are brand new (never seen before) and which existing cells
/// changed in a way that needs re-dispatch to the renderer.
#[derive(Debug, Default)]
pub struct ReconcileResult {
    pub new_cells: Vec<Hash>,
    pub dirty_cells: Vec<Hash>,
}

impl ReconcileResult {
    /// `new_cells ∪ flag_updated_cells`: every cell a round's broadcast
    /// needs to carry rendered HTML for, since both are freshly
    /// (re)dispatched to the kernel and have no HTML a connected browser
    /// has already seen.
    pub fn updated_cells(&self) -> Vec<Hash> {
        self.new_cells
            .iter()
            .chain(self.dirty_cells.iter())
            .copied()
            .collect()
    }
}

/// An ordered, content-addressed cell sequence plus frontmatter.
///
/// Mutated only from the coordinator's single logical thread of control:
/// a file-change reconciliation, a kernel message dispatch, or a
/// `load_from_html` seed never interleave with each other.
#[derive(Debug, Default)]
pub struct Document {
    pub frontmatter: BTreeMap<String, String>,
    order: Vec<Hash>,
    cells: HashMap<Hash, Cell>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: Hash) -> Option<&Cell> {
        self.cells.get(&hash)
    }

    pub fn get_code_mut(&mut self, hash: Hash) -> Option<&mut CodeCell> {
        self.cells.get_mut(&hash).and_then(Cell::as_code_mut)
    }

    /// Cells in document order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.order.iter().filter_map(|h| self.cells.get(h))
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Reconcile a freshly parsed source against the current document.
    ///
    /// A cell surviving from the previous version (same hash, same flags)
    /// keeps its runtime state untouched. A cell whose hash is unchanged
    /// but whose flags differ is reset (it re-executes, but its identity
    /// and position are otherwise preserved). A cell hash never seen
    /// before is inserted fresh. Any previously-known cell absent from the
    /// new parse is dropped. The final order always matches the new parse.
    pub fn update_from_source(&mut self, parsed: ParseResult) -> ReconcileResult {
        self.frontmatter = parsed.frontmatter;

        let mut new_cells = Vec::new();
        let mut dirty_cells = Vec::new();
        let mut next_order = Vec::with_capacity(parsed.cells.len());
        let mut next_cells = HashMap::with_capacity(parsed.cells.len());

        for cell in parsed.cells {
            let hash = cell.hash();
            next_order.push(hash);

            match (self.cells.remove(&hash), cell) {
                (Some(Cell::Code(mut existing)), Cell::Code(incoming)) => {
                    if existing.flags == incoming.flags {
                        next_cells.insert(hash, Cell::Code(existing));
                    } else {
                        existing.flags = incoming.flags;
                        existing.reset();
                        dirty_cells.push(hash);
                        next_cells.insert(hash, Cell::Code(existing));
                    }
                }
                (Some(existing @ Cell::Text(_)), Cell::Text(_)) => {
                    next_cells.insert(hash, existing);
                }
                (None, incoming) => {
                    new_cells.push(hash);
                    next_cells.insert(hash, incoming);
                }
                (Some(_), incoming) => {
                    // Same hash, different kind: impossible since the hash is
                    // kind-tagged, but fall back to treating it as new.
                    new_cells.push(hash);
                    next_cells.insert(hash, incoming);
                }
            }
        }

        self.order = next_order;
        self.cells = next_cells;

        ReconcileResult {
            new_cells,
            dirty_cells,
        }
    }

    /// Mark every code cell as about to execute, in document order, and
    /// return their hashes. Called once per execution round (server mode:
    /// a new/changed cell batch; batch mode: the whole document).
    pub fn begin_round(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            if let Some(cell) = self.get_code_mut(*hash) {
                cell.reset();
            }
        }
    }

    /// Apply a kernel IOPub message addressed (by prior msg_id correlation)
    /// to `hash`. Unrecognized content variants are ignored: the kernel
    /// adapter already filtered to messages worth dispatching.
    pub fn apply_message(&mut self, hash: Hash, content: &JupyterMessageContent) {
        let Some(cell) = self.get_code_mut(hash) else {
            return;
        };

        match content {
            JupyterMessageContent::Status(status) => {
                let state = format!("{:?}", status.execution_state).to_lowercase();
                if state == "idle" {
                    cell.set_done();
                }
            }
            JupyterMessageContent::StreamContent(stream) => {
                cell.append_stream(&stream.text);
            }
            JupyterMessageContent::ExecuteResult(result) => {
                cell.set_output(media_to_map(&result.data));
            }
            JupyterMessageContent::DisplayData(display) => {
                cell.set_output(media_to_map(&display.data));
            }
            JupyterMessageContent::ErrorOutput(error) => {
                let traceback = error.traceback.join("\n");
                cell.set_error(crate::render::ansi_to_html(&traceback));
            }
            JupyterMessageContent::ExecuteInput(_) => {}
            _ => {}
        }
    }

    /// Reconstruct document state from a previously rendered page, so a
    /// server restart need not re-execute cells whose source is unchanged.
    /// Cells are matched by their hash, which is the first CSS class on
    /// each `.code-cell` element per the output format; cells absent from
    /// `rendered_html` are left untouched.
    pub fn load_from_html(&mut self, rendered_html: &str) {
        use scraper::{Html, Selector};

        let document = Html::parse_document(rendered_html);
        let cells_selector = Selector::parse("#cells > .code-cell").unwrap();
        let output_selector = Selector::parse(".output").unwrap();

        for element in document.select(&cells_selector) {
            let classes: Vec<&str> = element.value().classes().collect();
            let Some(hash) = classes.first().and_then(|h| Hash::from_hex(h)) else {
                continue;
            };
            let Some(cell) = self.get_code_mut(hash) else {
                continue;
            };

            if let Some(output_el) = element.select(&output_selector).next() {
                let mut map = BTreeMap::new();
                map.insert("text/html".to_string(), output_el.inner_html());
                cell.set_output(map);
            }

            if classes.contains(&"hide") {
                cell.flags.insert("hide".to_string());
            }

            if classes.contains(&"done") {
                cell.set_done();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, Format};
    use std::collections::BTreeSet;

    fn parsed(text: &str) -> ParseResult {
        parser::parse(Format::Markdown, text).unwrap()
    }

    #[test]
    fn new_cells_are_reported_and_inserted() {
        let mut doc = Document::new();
        let result = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        assert_eq!(result.new_cells.len(), 1);
        assert!(result.dirty_cells.is_empty());
        assert_eq!(doc.cells().count(), 1);
    }

    #[test]
    fn unchanged_cell_keeps_its_output_across_reparse() {
        let mut doc = Document::new();
        let r1 = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        let hash = r1.new_cells[0];
        doc.get_code_mut(hash).unwrap().set_output(
            [("text/plain".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );

        let r2 = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        assert!(r2.new_cells.is_empty());
        assert!(r2.dirty_cells.is_empty());
        assert!(doc.get(hash).unwrap().as_code().unwrap().output.is_some());
    }

    #[test]
    fn flag_only_change_resets_but_keeps_hash() {
        let mut doc = Document::new();
        let r1 = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        let hash = r1.new_cells[0];
        doc.get_code_mut(hash).unwrap().set_output(
            [("text/plain".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );

        let r2 = doc.update_from_source(parsed("```python\n#::hide\nprint(1)\n```\n"));
        assert!(r2.new_cells.is_empty());
        assert_eq!(r2.dirty_cells, vec![hash]);
        let cell = doc.get(hash).unwrap().as_code().unwrap();
        assert!(cell.output.is_none());
        assert!(cell.flags.contains("hide"));
    }

    #[test]
    fn removed_cell_is_dropped() {
        let mut doc = Document::new();
        let r1 = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        let hash = r1.new_cells[0];
        doc.update_from_source(parsed(""));
        assert!(doc.get(hash).is_none());
        assert!(doc.is_empty());
    }

    #[test]
    fn reorder_is_reflected_in_cells_iteration_order() {
        let mut doc = Document::new();
        doc.update_from_source(parsed("```python\nprint(1)\n```\n\n```python\nprint(2)\n```\n"));
        let before: Vec<String> = doc
            .cells()
            .filter_map(|c| c.as_code().map(|c| c.code.clone()))
            .collect();
        assert_eq!(before, vec!["print(1)", "print(2)"]);

        doc.update_from_source(parsed("```python\nprint(2)\n```\n\n```python\nprint(1)\n```\n"));
        let after: Vec<String> = doc
            .cells()
            .filter_map(|c| c.as_code().map(|c| c.code.clone()))
            .collect();
        assert_eq!(after, vec!["print(2)", "print(1)"]);
    }

    #[test]
    fn load_from_html_seeds_output_onto_reconciled_cell() {
        let mut doc = Document::new();
        let r1 = doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        let hash = r1.new_cells[0];
        doc.get_code_mut(hash).unwrap().set_output(
            [("text/plain".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );
        doc.get_code_mut(hash).unwrap().set_done();

        let renderer = crate::render::Renderer::new();
        let rendered = renderer.render_page(&doc, false);

        // A fresh process re-parses the same source into a brand-new,
        // empty Document, then seeds outputs from the previous run's
        // rendered page: reconciliation must run first, since
        // `load_from_html` can only mutate cells it can find.
        let mut restarted = Document::new();
        let r2 = restarted.update_from_source(parsed("```python\nprint(1)\n```\n"));
        assert_eq!(r2.new_cells, vec![hash]);
        restarted.load_from_html(&rendered);

        let cell = restarted.get(hash).unwrap().as_code().unwrap();
        assert!(cell.is_done());
        assert!(cell.output.is_some());
    }

    #[test]
    fn load_from_html_on_an_empty_document_seeds_nothing() {
        let mut doc = Document::new();
        doc.update_from_source(parsed("```python\nprint(1)\n```\n"));
        doc.get_code_mut(doc.order[0])
            .unwrap()
            .set_output([("text/plain".to_string(), "1".to_string())].into_iter().collect());
        doc.get_code_mut(doc.order[0]).unwrap().set_done();
        let rendered = crate::render::Renderer::new().render_page(&doc, false);

        let mut empty = Document::new();
        empty.load_from_html(&rendered);
        assert!(empty.is_empty());
    }

    #[test]
    fn apply_message_status_idle_marks_done() {
        let mut doc = Document::new();
        let mut flags = BTreeSet::new();
        flags.insert("x".to_string());
        let cell = CodeCell::new("print(1)", BTreeSet::new());
        let hash = cell.hash;
        doc.order.push(hash);
        doc.cells.insert(hash, Cell::Code(cell));
        doc.get_code_mut(hash).unwrap().reset();
        let _ = flags;

        let status = jupyter_protocol::Status {
            execution_state: jupyter_protocol::ExecutionState::Idle,
        };
        doc.apply_message(hash, &JupyterMessageContent::Status(status));
        assert!(doc.get(hash).unwrap().as_code().unwrap().is_done());
    }
}
