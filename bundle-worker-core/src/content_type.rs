//! Extension-based content types for published files.

use std::path::Path;

/// Last resort when neither the table nor the system lookup knows the type.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Resolve the MIME type of a file from its extension.
///
/// Bundler output is served straight from the bucket, so browsers must see
/// `application/javascript` for modules and `text/css` for stylesheets
/// regardless of what the platform registry says.
pub fn resolve(path: impl AsRef<Path>) -> &'static str {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "js" | "mjs" => "application/javascript",
        "css" => "text/css",
        "html" | "htm" => "text/html",
        "svg" => "image/svg+xml",
        "json" | "map" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "" => OCTET_STREAM,
        other => mime_guess::from_ext(other).first_raw().unwrap_or(OCTET_STREAM),
    }
}
