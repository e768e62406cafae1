//! Component metadata injected into a build's `index.html` before upload.

use std::io;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::contract::BuildJob;

/// What a published page learns about the component it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMeta {
    pub name: String,
    pub version: String,
    pub component_id: String,
    pub build_timestamp: DateTime<Utc>,
}

impl From<&BuildJob> for ComponentMeta {
    fn from(job: &BuildJob) -> Self {
        Self {
            name: job.component.clone(),
            version: job.version.clone(),
            component_id: job.component_id.clone(),
            build_timestamp: job.created_at,
        }
    }
}

impl ComponentMeta {
    fn timestamp(&self) -> String {
        self.build_timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Meta tags and the `window.__BUNDLE_COMPONENT__` script.
    pub fn head_block(&self) -> String {
        let timestamp = self.timestamp();
        let mut block = String::from("\n    <!-- component metadata -->");
        for (name, content) in [
            ("component-name", self.name.as_str()),
            ("component-version", self.version.as_str()),
            ("build-timestamp", timestamp.as_str()),
            ("component-id", self.component_id.as_str()),
        ] {
            block.push_str(&format!(
                "\n    <meta name=\"{name}\" content=\"{}\">",
                escape_attribute(content)
            ));
        }
        block.push_str(&format!(
            "\n    <script>\n        window.__BUNDLE_COMPONENT__ = {{\n            \
             name: {},\n            version: {},\n            componentId: {},\n            \
             buildTimestamp: {}\n        }};\n    </script>\n",
            js_string(&self.name),
            js_string(&self.version),
            js_string(&self.component_id),
            js_string(&timestamp),
        ));
        block
    }
}

/// Insert the metadata block before the first `</head>`; `None` without one.
pub fn annotate_html(html: &str, meta: &ComponentMeta) -> Option<String> {
    // ASCII lowercasing keeps byte offsets.
    let at = html.to_ascii_lowercase().find("</head>")?;
    let block = meta.head_block();
    let mut out = String::with_capacity(html.len() + block.len());
    out.push_str(&html[..at]);
    out.push_str(&block);
    out.push_str(&html[at..]);
    Some(out)
}

/// Annotate `index` in place. Returns whether the document was changed.
pub async fn annotate_file(index: &Path, meta: &ComponentMeta) -> io::Result<bool> {
    let html = tokio::fs::read_to_string(index).await?;
    match annotate_html(&html, meta) {
        Some(annotated) => {
            tokio::fs::write(index, annotated).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

/// A JSON string literal that cannot close the surrounding `<script>`.
fn js_string(value: &str) -> String {
    serde_json::Value::from(value)
        .to_string()
        .replace("</", "<\\/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(name: &str) -> ComponentMeta {
        ComponentMeta {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            component_id: "c-42".to_string(),
            build_timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn inserts_before_first_head_close() {
        let html = "<html><head><title>x</title></HEAD><body></body></html>";
        let out = annotate_html(html, &meta("btn")).unwrap();
        let block_at = out.find("<meta name=\"component-name\" content=\"btn\">").unwrap();
        assert!(block_at < out.find("</HEAD>").unwrap());
        assert!(out.contains("<meta name=\"build-timestamp\" content=\"2024-05-01T12:30:00Z\">"));
        assert!(out.contains("componentId: \"c-42\""));
        assert!(out.starts_with("<html><head><title>x</title>"));
    }

    #[test]
    fn leaves_documents_without_head_alone() {
        assert_eq!(annotate_html("<p>fragment</p>", &meta("btn")), None);
    }

    #[test]
    fn escapes_values() {
        let out = annotate_html("<head></head>", &meta("a\"</script><b>")).unwrap();
        assert!(out.contains("content=\"a&quot;&lt;/script&gt;&lt;b&gt;\""));
        assert!(out.contains(r#"name: "a\"<\/script><b>""#));
        assert_eq!(out.matches("</script>").count(), 1);
    }
}
