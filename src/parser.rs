//! Text → ordered cell list, for both the markdown and code source formats.

use crate::cell::{Cell, CodeCell, TextCell};
use crate::error::ParsingError;
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Which source format to parse as. Auto-detected by file suffix at the
/// CLI layer (`.py` → `Code`, `.md` → `Markdown`) when not given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Markdown,
    Code,
}

/// Parsed frontmatter plus the ordered cell list it precedes.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub frontmatter: BTreeMap<String, String>,
    pub cells: Vec<Cell>,
}

static FENCE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```python\s*$").unwrap());
static FENCE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```\s*$").unwrap());
static PROSE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s?::>").unwrap());
static PROSE_STRIP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s?").unwrap());
static MAGIC_ESCAPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s*::%").unwrap());
static MODELINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s*::").unwrap());

pub fn parse(format: Format, text: &str) -> Result<ParseResult, ParsingError> {
    match format {
        Format::Markdown => parse_markdown(text),
        Format::Code => parse_code(text),
    }
}

/// Split author flags off the first line of a code body, if it opens with
/// a `#::` modeline. Returns the code to hash/execute (modeline stripped)
/// and the lowercase alphabetic flag tokens.
fn strip_modeline(code: &str) -> (String, BTreeSet<String>) {
    let Some(first_line_end) = code.find('\n') else {
        return if MODELINE.is_match(code) {
            (String::new(), tokenize_flags(code))
        } else {
            (code.to_string(), BTreeSet::new())
        };
    };
    let first_line = &code[..first_line_end];
    if MODELINE.is_match(first_line) {
        let rest = code[first_line_end + 1..].to_string();
        (rest, tokenize_flags(first_line))
    } else {
        (code.to_string(), BTreeSet::new())
    }
}

fn tokenize_flags(modeline: &str) -> BTreeSet<String> {
    let stripped = MODELINE.replace(modeline, "");
    stripped
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Extract a leading `key: value` frontmatter block, if present.
fn extract_markdown_frontmatter(text: &str) -> (BTreeMap<String, String>, &str) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (BTreeMap::new(), text);
    };
    let Some((end, delim_line_len)) = find_frontmatter_end(rest, "---") else {
        return (BTreeMap::new(), text);
    };
    let block = &rest[..end];
    let remainder = &rest[end + delim_line_len..];
    (parse_kv_block(block), remainder)
}

/// Same idea for the code format, where each frontmatter line is prefixed `# `.
fn extract_code_frontmatter(text: &str) -> (BTreeMap<String, String>, &str) {
    let Some(rest) = text.strip_prefix("# ---\n") else {
        return (BTreeMap::new(), text);
    };
    let Some((end, delim_line_len)) = find_frontmatter_end(rest, "# ---") else {
        return (BTreeMap::new(), text);
    };
    let block = &rest[..end];
    let remainder = &rest[end + delim_line_len..];
    let unprefixed: String = block
        .lines()
        .map(|l| l.strip_prefix("# ").unwrap_or(l))
        .collect::<Vec<_>>()
        .join("\n");
    (parse_kv_block(&unprefixed), remainder)
}

/// Find the byte offset of the closing delimiter line (`delim\n` or
/// `delim` at end of input, with no trailing newline), scanning line by
/// line. Returns the offset plus the full byte length of the matched
/// line (including its newline, if it has one), so the caller can slice
/// past it without assuming a newline is present.
fn find_frontmatter_end(text: &str, delim: &str) -> Option<(usize, usize)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.strip_suffix('\n').unwrap_or(line);
        if trimmed == delim {
            return Some((offset, line.len()));
        }
        offset += line.len();
    }
    None
}

fn parse_kv_block(block: &str) -> BTreeMap<String, String> {
    block
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn flush_text(buffer: &mut String, cells: &mut Vec<Cell>) {
    if !buffer.trim().is_empty() {
        cells.push(Cell::Text(TextCell::new(std::mem::take(buffer))));
    } else {
        buffer.clear();
    }
}

fn parse_markdown(text: &str) -> Result<ParseResult, ParsingError> {
    let (frontmatter, body) = extract_markdown_frontmatter(text);

    let mut cells = Vec::new();
    let mut text_buffer = String::new();
    let mut fence_body: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut fence_start_line = 0;
    let mut comment_open = false;
    let mut comment_start_line = 0;

    for (idx, line) in body.lines().enumerate() {
        let line_no = idx + 1;
        if in_fence {
            if FENCE_CLOSE.is_match(line) {
                let code = fence_body.join("\n");
                let (code, flags) = strip_modeline(&code);
                cells.push(Cell::Code(CodeCell::new(code, flags)));
                fence_body.clear();
                in_fence = false;
            } else {
                fence_body.push(line);
            }
            continue;
        }

        if FENCE_OPEN.is_match(line) {
            flush_text(&mut text_buffer, &mut cells);
            in_fence = true;
            fence_start_line = line_no;
            continue;
        }

        if !comment_open {
            if let Some(rel) = line.find("<!--") {
                comment_open = true;
                comment_start_line = line_no;
                let _ = rel;
            }
        }
        if comment_open && line.contains("-->") {
            comment_open = false;
        }

        text_buffer.push_str(line);
        text_buffer.push('\n');
    }

    if in_fence {
        return Err(ParsingError::UnclosedFence {
            line: fence_start_line,
        });
    }
    if comment_open {
        return Err(ParsingError::UnclosedComment {
            line: comment_start_line,
        });
    }

    flush_text(&mut text_buffer, &mut cells);

    Ok(ParseResult { frontmatter, cells })
}

fn parse_code(text: &str) -> Result<ParseResult, ParsingError> {
    let (frontmatter, body) = extract_code_frontmatter(text);

    let mut cells = Vec::new();
    let mut text_buffer = String::new();
    let mut code_buffer: Vec<String> = Vec::new();
    let mut in_prose = false;
    let mut prose_start_line = 0;

    let lines: Vec<&str> = body.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let line_no = i + 1;

        if !in_prose && PROSE_OPEN.is_match(line) {
            flush_code(&mut code_buffer, &mut cells);
            in_prose = true;
            prose_start_line = line_no;
            i += 1;
            continue;
        }

        if in_prose {
            if !line.starts_with('#') {
                in_prose = false;
                // Re-process this line as code on the next loop iteration.
                continue;
            }
            let stripped = PROSE_STRIP.replace(line, "").to_string();
            if stripped.starts_with('j') {
                flush_text(&mut text_buffer, &mut cells);
                let template = stripped[1..].to_string();
                cells.push(Cell::Code(desugar_template(&template)));
            } else {
                text_buffer.push_str(&stripped);
                text_buffer.push('\n');
            }
            i += 1;
            continue;
        }

        let rewritten = if MAGIC_ESCAPE.is_match(line) {
            MAGIC_ESCAPE.replace(line, "%").to_string()
        } else {
            line.to_string()
        };
        code_buffer.push(rewritten);
        i += 1;
    }

    if in_prose {
        return Err(ParsingError::UnclosedProse {
            line: prose_start_line,
        });
    }

    flush_text(&mut text_buffer, &mut cells);
    flush_code(&mut code_buffer, &mut cells);

    Ok(ParseResult { frontmatter, cells })
}

fn flush_code(buffer: &mut Vec<String>, cells: &mut Vec<Cell>) {
    if buffer.iter().all(|l| l.trim().is_empty()) {
        buffer.clear();
        return;
    }
    let code = buffer.join("\n");
    let (code, flags) = strip_modeline(&code);
    cells.push(Cell::Code(CodeCell::new(code, flags)));
    buffer.clear();
}

/// Desugar a `j<template>` prose line into a code cell that prints the
/// rendered template. `is_template` tells the renderer to show the
/// rendered markdown instead of raw stream text.
fn desugar_template(literal_template: &str) -> CodeCell {
    let escaped = literal_template.replace('\\', "\\\\").replace('\'', "\\'");
    let code = format!("print(render_template('{escaped}', locals()))");
    CodeCell::new_template(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_s1_title_and_code_cell() {
        let text = "# Title\n\n```python\nprint(1+1)\n```\n";
        let result = parse(Format::Markdown, text).unwrap();
        assert_eq!(result.cells.len(), 2);
        match &result.cells[0] {
            Cell::Text(t) => assert_eq!(t.content.trim(), "# Title"),
            _ => panic!("expected text cell"),
        }
        match &result.cells[1] {
            Cell::Code(c) => assert_eq!(c.code, "print(1+1)"),
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn markdown_unclosed_fence_fails() {
        let text = "```python\nprint(1)\n";
        assert!(matches!(
            parse(Format::Markdown, text),
            Err(ParsingError::UnclosedFence { .. })
        ));
    }

    #[test]
    fn markdown_unclosed_comment_fails() {
        let text = "hello <!-- oops\nmore text\n";
        assert!(matches!(
            parse(Format::Markdown, text),
            Err(ParsingError::UnclosedComment { .. })
        ));
    }

    #[test]
    fn markdown_comment_passes_through_without_splitting_cell() {
        let text = "before <!-- note --> after\n";
        let result = parse(Format::Markdown, text).unwrap();
        assert_eq!(result.cells.len(), 1);
        match &result.cells[0] {
            Cell::Text(t) => assert!(t.content.contains("<!-- note -->")),
            _ => panic!("expected text cell"),
        }
    }

    #[test]
    fn modeline_flags_are_tokenized_and_stripped() {
        let text = "```python\n#::hide\nprint(1)\n```\n";
        let result = parse(Format::Markdown, text).unwrap();
        match &result.cells[0] {
            Cell::Code(c) => {
                assert_eq!(c.code, "print(1)");
                assert!(c.flags.contains("hide"));
            }
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn empty_source_is_empty_document() {
        let result = parse(Format::Markdown, "").unwrap();
        assert!(result.cells.is_empty());
    }

    #[test]
    fn frontmatter_only_source_has_no_cells() {
        let text = "---\ntitle: demo\n---\n";
        let result = parse(Format::Markdown, text).unwrap();
        assert!(result.cells.is_empty());
        assert_eq!(result.frontmatter.get("title").unwrap(), "demo");
    }

    #[test]
    fn frontmatter_without_trailing_newline_does_not_panic() {
        let text = "---\ntitle: demo\n---";
        let result = parse(Format::Markdown, text).unwrap();
        assert!(result.cells.is_empty());
        assert_eq!(result.frontmatter.get("title").unwrap(), "demo");
    }

    #[test]
    fn code_frontmatter_without_trailing_newline_does_not_panic() {
        let text = "# ---\n# title: demo\n# ---";
        let result = parse(Format::Code, text).unwrap();
        assert!(result.cells.is_empty());
        assert_eq!(result.frontmatter.get("title").unwrap(), "demo");
    }

    #[test]
    fn code_mode_prose_region_and_default_code() {
        let text = "print('a')\n# ::>\n# hello\nprint('b')\n";
        let result = parse(Format::Code, text).unwrap();
        assert_eq!(result.cells.len(), 3);
        assert!(matches!(&result.cells[0], Cell::Code(c) if c.code == "print('a')"));
        assert!(matches!(&result.cells[1], Cell::Text(t) if t.content.trim() == "hello"));
        assert!(matches!(&result.cells[2], Cell::Code(c) if c.code == "print('b')"));
    }

    #[test]
    fn code_mode_magic_escape_rewritten() {
        let text = "#::%magic\nprint(1)\n";
        let result = parse(Format::Code, text).unwrap();
        match &result.cells[0] {
            Cell::Code(c) => assert!(c.code.starts_with("%magic")),
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn code_mode_template_line_desugars_to_code_cell() {
        let text = "# ::>\n#j{{ x }}\n";
        let result = parse(Format::Code, text).unwrap();
        assert_eq!(result.cells.len(), 1);
        match &result.cells[0] {
            Cell::Code(c) => {
                assert!(c.is_template);
                assert!(c.code.contains("render_template"));
            }
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn flag_only_change_keeps_hash_family() {
        let without_flag = parse(Format::Markdown, "```python\nprint(1)\n```\n").unwrap();
        let with_flag = parse(Format::Markdown, "```python\n#::hide\nprint(1)\n```\n").unwrap();
        let a = without_flag.cells[0].as_code().unwrap();
        let a2 = with_flag.cells[0].as_code().unwrap();
        let a: &CodeCell = a;
        assert_eq!(a.hash, a2.hash);
        assert!(!a.equals(a2));
    }
}
