use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use sourcelens_core::position::LspPosition;
use sourcelens_core::snippet::preview_lines;
use tracing::debug;

use crate::error::SessionError;
use crate::lsp::{
    LspDocumentHighlight, LspDocumentSymbol, LspLocation, LspLocationLink, LspSymbolInformation,
    uri_to_path,
};

/// One row of the flattened outline shown next to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolEntry {
    pub name: String,
    pub kind: String,
    pub start: LspPosition,
    pub end: LspPosition,
    /// Nesting depth in the document symbol tree.
    pub indent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationEntry {
    /// Path relative to the repository checkout, or empty when the target
    /// lies outside it (SDK headers, toolchain sources).
    pub uri: String,
    pub filename: String,
    pub start: LspPosition,
    pub end: LspPosition,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightEntry {
    pub start: LspPosition,
    pub end: LspPosition,
    pub kind: String,
}

pub fn symbol_kind_label(kind: u32) -> String {
    // https://microsoft.github.io/language-server-protocol/specifications/lsp/3.17/specification/#symbolKind
    match kind {
        5 => "class".to_string(),
        6 => "method".to_string(),
        7 => "property".to_string(),
        8 => "field".to_string(),
        9 => "constructor".to_string(),
        10 => "enum".to_string(),
        11 => "interface".to_string(),
        12 => "function".to_string(),
        23 => "struct".to_string(),
        other => other.to_string(),
    }
}

pub(crate) fn parse_document_symbols(value: Value) -> Result<Vec<SymbolEntry>, SessionError> {
    const METHOD: &str = "textDocument/documentSymbol";

    if value.is_null() {
        return Ok(Vec::new());
    }
    let Some(arr) = value.as_array() else {
        return Err(SessionError::invalid_response(METHOD, "result is not an array"));
    };
    let Some(first) = arr.first() else {
        return Ok(Vec::new());
    };

    // DocumentSymbol carries selectionRange; SymbolInformation carries location.
    if first.get("selectionRange").is_some() {
        let roots: Vec<LspDocumentSymbol> =
            serde_json::from_value(value).map_err(|err| SessionError::invalid_response(METHOD, err))?;
        let mut out = Vec::new();
        for root in &roots {
            flatten_document_symbol(root, 0, &mut out);
        }
        return Ok(out);
    }

    let infos: Vec<LspSymbolInformation> =
        serde_json::from_value(value).map_err(|err| SessionError::invalid_response(METHOD, err))?;
    Ok(infos
        .into_iter()
        .map(|info| SymbolEntry {
            name: info.name,
            kind: symbol_kind_label(info.kind),
            start: info.location.range.start,
            end: info.location.range.end,
            indent: 0,
        })
        .collect())
}

fn flatten_document_symbol(sym: &LspDocumentSymbol, depth: u32, out: &mut Vec<SymbolEntry>) {
    out.push(SymbolEntry {
        name: sym.name.clone(),
        kind: symbol_kind_label(sym.kind),
        start: sym.selection_range.start,
        end: sym.selection_range.end,
        indent: depth,
    });
    for child in &sym.children {
        flatten_document_symbol(child, depth + 1, out);
    }
}

/// Accepts `Location`, `Location[]` and `LocationLink[]`; entries that do
/// not parse are skipped.
pub(crate) fn parse_locations(value: Value, method: &str) -> Result<Vec<LspLocation>, SessionError> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => {
            return Err(SessionError::invalid_response(
                method,
                "result is neither array nor object",
            ));
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match to_lsp_location(item) {
            Some(location) => out.push(location),
            None => debug!(method, "skipping unrecognized location"),
        }
    }
    Ok(out)
}

fn to_lsp_location(value: Value) -> Option<LspLocation> {
    if value.get("uri").is_some() {
        return serde_json::from_value(value).ok();
    }
    if value.get("targetUri").is_some() {
        let link: LspLocationLink = serde_json::from_value(value).ok()?;
        return Some(LspLocation {
            uri: link.target_uri,
            range: link.target_selection_range,
        });
    }
    None
}

/// Builds the browser-facing location. `roots` are the spellings of the
/// repository checkout directory (as configured and canonical); `source` is
/// the target file's text when it could be read.
pub(crate) fn to_location_entry(
    location: &LspLocation,
    roots: &[PathBuf],
    source: Option<&str>,
    max_lines: usize,
    trim: bool,
) -> LocationEntry {
    let content = source
        .map(|text| preview_lines(text, location.range.start.line, max_lines))
        .unwrap_or_default();
    let content = if trim {
        content.trim().to_string()
    } else {
        content
    };

    LocationEntry {
        uri: relative_uri(&location.uri, roots),
        filename: file_name(&location.uri),
        start: location.range.start,
        end: location.range.end,
        content,
    }
}

pub(crate) fn relative_uri(uri: &str, roots: &[PathBuf]) -> String {
    let Some(path) = uri_to_path(uri) else {
        return String::new();
    };
    roots
        .iter()
        .find_map(|root| path.strip_prefix(root).ok())
        .map(join_components)
        .unwrap_or_default()
}

fn join_components(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn file_name(uri: &str) -> String {
    if let Some(path) = uri_to_path(uri) {
        return path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    uri.split(['?', '#'])
        .next()
        .and_then(|rest| rest.rsplit('/').find(|segment| !segment.is_empty()))
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn parse_highlights(value: Value) -> Result<Vec<HighlightEntry>, SessionError> {
    const METHOD: &str = "textDocument/documentHighlight";

    if value.is_null() {
        return Ok(Vec::new());
    }
    let highlights: Vec<LspDocumentHighlight> =
        serde_json::from_value(value).map_err(|err| SessionError::invalid_response(METHOD, err))?;
    Ok(highlights
        .into_iter()
        .map(|h| HighlightEntry {
            start: h.range.start,
            end: h.range.end,
            kind: highlight_kind_label(h.kind).to_string(),
        })
        .collect())
}

fn highlight_kind_label(kind: Option<u32>) -> &'static str {
    match kind {
        Some(1) => "text",
        Some(2) => "read",
        Some(3) => "write",
        _ => "none",
    }
}

/// Markdown for a hover result: `MarkupContent`, a `MarkedString`, or the
/// first entry of a `MarkedString[]`. Empty when the server has nothing.
pub(crate) fn hover_text(value: &Value) -> String {
    let Some(contents) = value.get("contents") else {
        return String::new();
    };
    marked_string_text(contents)
}

fn marked_string_text(contents: &Value) -> String {
    match contents {
        Value::String(text) => text.clone(),
        Value::Object(obj) => obj
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Value::Array(items) => items
            .iter()
            .map(marked_string_text)
            .find(|text| !text.is_empty())
            .unwrap_or_default(),
        _ => String::new(),
    }
}
