//! Pure rendering: cell HTML and full-page assembly. Nothing here mutates
//! the Document; it only reads.

use crate::cell::{Cell, CodeCell};
use crate::document::Document;
use pulldown_cmark::{Options, Parser};
use std::fmt::Write as _;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;

fn markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    let parser = Parser::new_ext(text, options);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Syntect resources for highlighting code cell source, reused for the
/// lifetime of a render session.
pub struct Renderer {
    syntax_set: SyntaxSet,
    theme: Theme,
}

impl Renderer {
    pub fn new() -> Self {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let theme_set = ThemeSet::load_defaults();
        let theme = theme_set
            .themes
            .get("base16-ocean.dark")
            .or_else(|| theme_set.themes.get("base16-eighties.dark"))
            .cloned()
            .unwrap_or_else(|| theme_set.themes.values().next().unwrap().clone());
        Self { syntax_set, theme }
    }

    fn highlight_python(&self, code: &str) -> String {
        let syntax = self
            .syntax_set
            .find_syntax_by_token("python")
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());
        highlighted_html_for_string(code, &self.syntax_set, syntax, &self.theme)
            .unwrap_or_else(|_| format!("<pre>{}</pre>", escape_html(code)))
    }

    /// Render a single cell's HTML, including its wrapping
    /// `<div class="{hash} {kind}-cell ...">`.
    pub fn render_cell(&self, cell: &Cell) -> String {
        match cell {
            Cell::Text(t) => {
                format!(
                    "<div class=\"{} text-cell\">{}</div>",
                    t.hash,
                    markdown(&t.content)
                )
            }
            Cell::Code(c) => self.render_code_cell(c),
        }
    }

    fn render_code_cell(&self, c: &CodeCell) -> String {
        let mut classes = format!("{} code-cell", c.hash);
        for flag in &c.flags {
            let _ = write!(classes, " {flag}");
        }
        if c.is_done() {
            classes.push_str(" done");
        }
        if c.is_evaluating() {
            classes.push_str(" evaluating");
        }

        let source_html = self.highlight_python(&c.code);
        let output_html = self.render_output(c);

        format!(
            "<div class=\"{classes}\"><div class=\"source\">{source_html}</div><div class=\"output\">{output_html}</div></div>"
        )
    }

    /// The contents of a code cell's `.output` region: error (if any)
    /// above stream text, above the MIME-selected result.
    fn render_output(&self, c: &CodeCell) -> String {
        if c.is_template {
            return markdown(&c.stream);
        }

        let mut out = String::new();
        if let Some(error) = &c.error {
            out.push_str(error);
        }
        if !c.stream.is_empty() {
            let _ = write!(out, "<pre>{}</pre>", escape_html(&c.stream));
        }
        if let Some(output) = &c.output {
            out.push_str(&render_mime_bundle(output));
        }
        out
    }

    /// Assemble the full page: cells, frontmatter-derived title, and the
    /// syntect + ANSI stylesheets. `client_flag` toggles the browser-side
    /// live-update script tag.
    pub fn render_page(&self, document: &Document, client_flag: bool) -> String {
        let cells_html: String = document
            .cells()
            .map(|cell| self.render_cell(cell))
            .collect();
        format!(
            "{}{cells_html}{}",
            self.page_prologue(document),
            self.page_epilogue(client_flag)
        )
    }

    /// Everything up to and including the `<div id="cells">` open tag.
    /// Streamed first in batch mode, before any cell has finished.
    pub fn page_prologue(&self, document: &Document) -> String {
        let title = document
            .frontmatter
            .get("title")
            .cloned()
            .unwrap_or_else(|| "knitj".to_string());
        let styles = self.styles();
        format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title><style>{styles}</style></head><body><div id=\"cells\">"
        )
    }

    /// Closes what `page_prologue` opened. `client_flag` toggles the
    /// browser-side live-update script tag.
    pub fn page_epilogue(&self, client_flag: bool) -> String {
        let script = if client_flag {
            r#"<script src="/static/client.js"></script>"#
        } else {
            ""
        };
        format!("</div>{script}</body></html>\n")
    }

    /// Pygments-equivalent CSS plus the fixed ANSI-color stylesheet rules
    /// consumed by `ansi_to_html`'s inline-span output.
    fn styles(&self) -> String {
        let syntect_css = syntect::html::css_for_theme_with_class_style(
            &self.theme,
            syntect::html::ClassStyle::Spaced,
        )
        .unwrap_or_default();
        format!("{syntect_css}\n{ANSI_STYLES}")
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// MIME selection order (first match wins): svg, png, html, plain text.
fn render_mime_bundle(data: &std::collections::BTreeMap<String, String>) -> String {
    if let Some(svg) = data.get("image/svg+xml") {
        let start = svg.find("<svg").unwrap_or(0);
        return svg[start..].to_string();
    }
    if let Some(png) = data.get("image/png") {
        return format!("<img src=\"data:image/png;base64,{png}\">");
    }
    if let Some(html) = data.get("text/html") {
        return html.clone();
    }
    if let Some(plain) = data.get("text/plain") {
        return format!("<pre>{}</pre>", escape_html(plain));
    }
    String::new()
}

const ANSI_STYLES: &str = "\
.ansi-black { color: #2e3436; } .ansi-red { color: #cc0000; }
.ansi-green { color: #4e9a06; } .ansi-yellow { color: #c4a000; }
.ansi-blue { color: #3465a4; } .ansi-magenta { color: #75507b; }
.ansi-cyan { color: #06989a; } .ansi-white { color: #d3d7cf; }
.ansi-bold { font-weight: bold; }
";

/// Convert a traceback's ANSI SGR escapes to an HTML span tree. Tracebacks
/// are otherwise opaque bytes from the kernel; this is the boundary at
/// which they become renderable.
pub fn ansi_to_html(text: &str) -> String {
    ansi_to_html::convert(text).unwrap_or_else(|_| escape_html(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, Format};
    use std::collections::BTreeMap;

    #[test]
    fn mime_selection_prefers_svg_over_everything() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "fallback".to_string());
        data.insert("image/svg+xml".to_string(), "<svg>x</svg>".to_string());
        let html = render_mime_bundle(&data);
        assert!(html.starts_with("<svg"));
    }

    #[test]
    fn mime_selection_falls_back_to_plain_text() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), "2".to_string());
        assert_eq!(render_mime_bundle(&data), "<pre>2</pre>");
    }

    #[test]
    fn s1_rendered_cell_contains_pre_wrapped_output() {
        let mut doc = Document::new();
        let parsed = parser::parse(Format::Markdown, "# Title\n\n```python\nprint(1+1)\n```\n")
            .unwrap();
        let result = doc.update_from_source(parsed);
        let code_hash = result.new_cells[1];
        doc.get_code_mut(code_hash).unwrap().set_output(
            [("text/plain".to_string(), "2".to_string())]
                .into_iter()
                .collect(),
        );
        doc.get_code_mut(code_hash).unwrap().set_done();

        let renderer = Renderer::new();
        let cell = doc.get(code_hash).unwrap();
        let html = renderer.render_cell(cell);
        assert!(html.contains("<pre>2</pre>"));
        assert!(html.contains("done"));
    }

    #[test]
    fn template_cell_renders_markdown_stream_not_pre() {
        let mut c = CodeCell::new_template("print(render_template('# Hi', locals()))");
        c.append_stream("# Hi\n");
        let renderer = Renderer::new();
        let html = renderer.render_cell(&Cell::Code(c));
        assert!(html.contains("<h1>"));
        assert!(!html.contains("<pre>"));
    }

    #[test]
    fn text_cell_renders_as_markdown_div() {
        let renderer = Renderer::new();
        let cell = Cell::Text(crate::cell::TextCell::new("# Title"));
        let html = renderer.render_cell(&cell);
        assert!(html.contains("text-cell"));
        assert!(html.contains("<h1>Title</h1>"));
    }
}
