//! Asset reference rewriting for a build's entry document.
//!
//! Bundlers bake absolute paths (`/assets/index-3f2a.js`) or CDN URLs into
//! `index.html`. Published bundles live under an arbitrary storage prefix, so
//! every `src`, `href` and `srcset` value is resolved against the output
//! directory on disk and, when a matching file exists, replaced by a path
//! relative to the document (`assets/...` or a root file name).
//!
//! Values that resolve to nothing are left exactly as authored. The document
//! is only touched when at least one attribute changed; unchanged documents
//! come back byte-for-byte.
//!
//! `tl` locates the elements. Attribute spans are then read from each opening
//! tag directly so that names match case-insensitively and unquoted values
//! keep their exact position. Markup inside `script`, `style` and `template`
//! is never rewritten. Documents that are not valid UTF-8 are edited on their
//! raw bytes.

use std::borrow::Cow;
use std::path::{Component, Path};

use thiserror::Error;
use tracing::{debug, warn};

const DOCTYPE: &str = "<!DOCTYPE html>\n";
const REWRITTEN_ATTRIBUTES: [&str; 3] = ["src", "href", "srcset"];
const OPAQUE_ELEMENTS: [&str; 3] = ["script", "style", "template"];

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to parse document: {0}")]
    Parse(String),
}

/// Result of [`rewrite_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub html: Vec<u8>,
    pub changed: bool,
}

/// Rewrite the asset references of an HTML document relative to `root`.
pub fn rewrite_document(html: &[u8], root: &Path) -> Result<Rewritten, RewriteError> {
    let markup = markup_view(html);
    let dom = tl::parse(&markup, tl::ParserOptions::default())
        .map_err(|e| RewriteError::Parse(format!("{e:?}")))?;
    let bytes = markup.as_bytes();

    let mut starts: Vec<usize> = dom
        .nodes()
        .iter()
        .filter_map(|node| node.as_tag())
        .filter_map(|tag| offset_within(bytes, tag.raw().as_bytes()))
        .filter(|&offset| bytes[offset] == b'<')
        .collect();
    starts.sort_unstable();
    starts.dedup();

    // (byte offset, byte length, replacement) of each changed attribute value
    let mut edits: Vec<(usize, usize, String)> = Vec::new();
    let mut opaque_until = 0;
    for start in starts {
        if start < opaque_until {
            continue;
        }
        let Some(tag) = scan_opening_tag(bytes, start) else {
            continue;
        };

        let mut seen = [false; REWRITTEN_ATTRIBUTES.len()];
        for attribute in &tag.attributes {
            let Some(slot) = REWRITTEN_ATTRIBUTES
                .iter()
                .position(|name| attribute.name.eq_ignore_ascii_case(name.as_bytes()))
            else {
                continue;
            };
            // Only the first occurrence of each attribute counts.
            if std::mem::replace(&mut seen[slot], true) {
                continue;
            }
            let Some(span) = &attribute.value else {
                continue;
            };
            let Ok(original) = std::str::from_utf8(&html[span.start..span.end]) else {
                continue;
            };
            let replacement = if REWRITTEN_ATTRIBUTES[slot] == "srcset" {
                rewrite_srcset(original, root)
            } else {
                rewrite_reference(original, root)
            };
            if let Some(replacement) = replacement {
                debug!(
                    attribute = REWRITTEN_ATTRIBUTES[slot],
                    from = original,
                    to = %replacement,
                    "Rewrote asset reference"
                );
                let replacement = if span.quoted || !needs_quotes(&replacement) {
                    replacement
                } else {
                    format!("\"{replacement}\"")
                };
                edits.push((span.start, span.end - span.start, replacement));
            }
        }

        if OPAQUE_ELEMENTS
            .iter()
            .any(|name| tag.name.eq_ignore_ascii_case(name.as_bytes()))
        {
            opaque_until = closing_tag(bytes, tag.end, tag.name);
        }
    }

    if edits.is_empty() {
        return Ok(Rewritten {
            html: html.to_vec(),
            changed: false,
        });
    }

    edits.sort_by_key(|(offset, _, _)| *offset);
    let mut out = Vec::with_capacity(html.len() + DOCTYPE.len());
    let mut cursor = 0;
    for (offset, len, replacement) in edits {
        if offset < cursor {
            continue;
        }
        out.extend_from_slice(&html[cursor..offset]);
        out.extend_from_slice(replacement.as_bytes());
        cursor = offset + len;
    }
    out.extend_from_slice(&html[cursor..]);

    Ok(Rewritten {
        html: ensure_doctype(out),
        changed: true,
    })
}

/// Text view of `html` with the same byte offsets. Bytes of an invalid
/// document outside ASCII become `_`, which never alters the markup.
fn markup_view(html: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(html) {
        Ok(text) => Cow::Borrowed(text),
        Err(err) => {
            warn!(offset = err.valid_up_to(), "Document is not valid UTF-8, editing raw bytes");
            Cow::Owned(
                html.iter()
                    .map(|&b| if b.is_ascii() { b as char } else { '_' })
                    .collect(),
            )
        }
    }
}

#[derive(Debug)]
struct ValueSpan {
    start: usize,
    end: usize,
    quoted: bool,
}

#[derive(Debug)]
struct Attribute<'a> {
    name: &'a [u8],
    value: Option<ValueSpan>,
}

#[derive(Debug)]
struct OpeningTag<'a> {
    name: &'a [u8],
    attributes: Vec<Attribute<'a>>,
    /// Offset just past the closing `>`.
    end: usize,
}

fn is_tag_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'/' || b == b'>'
}

/// Tokenize the opening tag starting at the `<` found at `start`.
fn scan_opening_tag(bytes: &[u8], start: usize) -> Option<OpeningTag<'_>> {
    let len = bytes.len();
    let skip_whitespace = |mut pos: usize| {
        while pos < len && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    };

    let mut pos = start + 1;
    while pos < len && !is_tag_delimiter(bytes[pos]) {
        pos += 1;
    }
    let name = &bytes[start + 1..pos];
    if name.is_empty() || !name[0].is_ascii_alphabetic() {
        return None;
    }

    let mut attributes = Vec::new();
    loop {
        while pos < len && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b'/') {
            pos += 1;
        }
        match bytes.get(pos) {
            None => break,
            Some(b'>') => {
                pos += 1;
                break;
            }
            _ => {}
        }

        let name_start = pos;
        pos += 1;
        while pos < len && !is_tag_delimiter(bytes[pos]) && bytes[pos] != b'=' {
            pos += 1;
        }
        let attribute_name = &bytes[name_start..pos];

        pos = skip_whitespace(pos);
        if bytes.get(pos) != Some(&b'=') {
            attributes.push(Attribute {
                name: attribute_name,
                value: None,
            });
            continue;
        }
        pos = skip_whitespace(pos + 1);

        let value = match bytes.get(pos) {
            Some(&quote @ (b'"' | b'\'')) => {
                let value_start = pos + 1;
                let value_end = bytes[value_start..]
                    .iter()
                    .position(|&b| b == quote)
                    .map_or(len, |idx| value_start + idx);
                pos = (value_end + 1).min(len);
                ValueSpan {
                    start: value_start,
                    end: value_end,
                    quoted: true,
                }
            }
            _ => {
                let value_start = pos;
                while pos < len && !bytes[pos].is_ascii_whitespace() && bytes[pos] != b'>' {
                    pos += 1;
                }
                ValueSpan {
                    start: value_start,
                    end: pos,
                    quoted: false,
                }
            }
        };
        attributes.push(Attribute {
            name: attribute_name,
            value: Some(value),
        });
    }

    Some(OpeningTag {
        name,
        attributes,
        end: pos,
    })
}

/// Offset of the `</name` that ends the element whose content starts at `from`.
fn closing_tag(bytes: &[u8], from: usize, name: &[u8]) -> usize {
    let mut pos = from;
    while let Some(idx) = bytes
        .get(pos..)
        .and_then(|rest| rest.windows(2).position(|w| w == b"</"))
    {
        let at = pos + idx;
        let tail = &bytes[at + 2..];
        if tail.len() >= name.len()
            && tail[..name.len()].eq_ignore_ascii_case(name)
            && tail.get(name.len()).map_or(true, |&b| is_tag_delimiter(b))
        {
            return at;
        }
        pos = at + 2;
    }
    bytes.len()
}

/// Unquoted values cannot carry whitespace or markup characters.
fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .bytes()
            .any(|b| b.is_ascii_whitespace() || matches!(b, b'"' | b'\'' | b'=' | b'<' | b'>' | b'`'))
}

/// Rewrite a single URL value. Returns `None` when the value stays as is.
pub fn rewrite_reference(value: &str, root: &Path) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (path, suffix) = match trimmed.find(['?', '#']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let resolved = if is_external(path) {
        resolve_external(path, root)
    } else {
        resolve_local(path, root)
    }?;

    let rewritten = format!("{resolved}{suffix}");
    (rewritten != value).then_some(rewritten)
}

/// Rewrite every candidate URL of a `srcset` list, keeping descriptors.
pub fn rewrite_srcset(value: &str, root: &Path) -> Option<String> {
    let mut changed = false;
    let candidates: Vec<String> = value
        .split(',')
        .map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let Some(url) = parts.next() else {
                return candidate.to_string();
            };
            match rewrite_reference(url, root) {
                Some(new_url) => {
                    changed = true;
                    std::iter::once(new_url.as_str())
                        .chain(parts)
                        .collect::<Vec<_>>()
                        .join(" ")
                }
                None => candidate.to_string(),
            }
        })
        .collect();

    if !changed {
        return None;
    }
    let joined = candidates
        .iter()
        .map(|c| c.trim())
        .collect::<Vec<_>>()
        .join(", ");
    (joined != value).then_some(joined)
}

/// Prefix `<!DOCTYPE html>` unless the document already starts with one.
pub fn ensure_doctype(html: Vec<u8>) -> Vec<u8> {
    let start = html
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(html.len());
    let head = &html[start..];
    if head.len() >= 9 && head[..9].eq_ignore_ascii_case(b"<!doctype") {
        return html;
    }
    let mut out = Vec::with_capacity(DOCTYPE.len() + html.len());
    out.extend_from_slice(DOCTYPE.as_bytes());
    out.extend_from_slice(&html);
    out
}

/// Scheme-qualified (`https:`, `data:`) or protocol-relative (`//cdn`).
fn is_external(value: &str) -> bool {
    if value.starts_with("//") {
        return true;
    }
    match value.find(':') {
        Some(idx) if idx > 0 => {
            let scheme = &value[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

/// External URLs are only rewritten when their `/assets/` tail exists locally.
fn resolve_external(path: &str, root: &Path) -> Option<String> {
    let (_, tail) = path.split_once("/assets/")?;
    is_file_under(&root.join("assets"), tail).then(|| format!("assets/{tail}"))
}

fn resolve_local(path: &str, root: &Path) -> Option<String> {
    let clean = path.strip_prefix('/').unwrap_or(path);
    let assets = root.join("assets");

    if let Some(idx) = clean.find("assets/") {
        let rel = clean[idx + "assets/".len()..].trim_start_matches('/');
        if is_file_under(&assets, rel) {
            return Some(format!("assets/{rel}"));
        }
    }
    if is_file_under(&assets, clean) {
        return Some(format!("assets/{clean}"));
    }
    let basename = clean.rsplit('/').next().unwrap_or(clean);
    if is_file_under(&assets, basename) {
        return Some(format!("assets/{basename}"));
    }
    // Only top-level files are published from the output root.
    if !clean.contains('/') && is_file_under(root, clean) {
        return Some(clean.to_string());
    }
    None
}

/// Whether `rel` names an existing file inside `dir`, never escaping it.
fn is_file_under(dir: &Path, rel: &str) -> bool {
    if rel.is_empty() {
        return false;
    }
    let rel = Path::new(rel);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return false;
    }
    dir.join(rel).is_file()
}

/// Byte offset of `needle` inside `haystack` when it is a non-empty sub-slice of it.
fn offset_within(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let start = (needle.as_ptr() as usize).checked_sub(haystack.as_ptr() as usize)?;
    let end = start.checked_add(needle.len())?;
    (!needle.is_empty() && end <= haystack.len()).then_some(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_external_urls() {
        assert!(is_external("https://cdn.example.com/app.js"));
        assert!(is_external("//cdn.example.com/app.js"));
        assert!(is_external("data:image/png;base64,AAAA"));
        assert!(!is_external("/assets/app.js"));
        assert!(!is_external("assets/app.js"));
        assert!(!is_external("./app.js"));
    }

    #[test]
    fn opening_tag_spans_cover_every_quoting_style() {
        let html = br#"<img SRC=/a.png alt='x y' data-x="1" hidden srcset = b.png>rest"#;
        let tag = scan_opening_tag(html, 0).unwrap();
        assert_eq!(tag.name, b"img");
        assert_eq!(&html[tag.end..], b"rest");

        let spans: Vec<(&[u8], Option<&[u8]>)> = tag
            .attributes
            .iter()
            .map(|a| (a.name, a.value.as_ref().map(|v| &html[v.start..v.end])))
            .collect();
        assert_eq!(
            spans,
            vec![
                (&b"SRC"[..], Some(&b"/a.png"[..])),
                (&b"alt"[..], Some(&b"x y"[..])),
                (&b"data-x"[..], Some(&b"1"[..])),
                (&b"hidden"[..], None),
                (&b"srcset"[..], Some(&b"b.png"[..])),
            ]
        );
    }

    #[test]
    fn closing_tag_is_case_insensitive_and_whole_word() {
        let html = b"<script>a</scripts></SCRIPT >";
        assert_eq!(closing_tag(html, 8, b"script"), 19);
        assert_eq!(closing_tag(html, 8, b"style"), html.len());
    }

    #[test]
    fn ensure_doctype_is_case_insensitive_and_idempotent() {
        let with = b"  <!doctype html><html></html>".to_vec();
        assert_eq!(ensure_doctype(with.clone()), with);
        let without = b"<html></html>".to_vec();
        let fixed = ensure_doctype(without);
        assert!(fixed.starts_with(b"<!DOCTYPE html>\n<html>"));
        assert_eq!(ensure_doctype(fixed.clone()), fixed);
    }
}
