use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;

use super::types::{
    AttrValue, ContentTree, Node, RenderContext, RenderError, RenderEvent, RenderStream, Renderer,
};

const DOCTYPE: &str = "<!DOCTYPE html>";
const FLUSH_BYTES: usize = 16 * 1024;
const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];
const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Renders a content tree to an HTML document.
#[derive(Debug, Clone, Copy)]
pub struct HtmlRenderer {
    flush_bytes: usize,
}

impl HtmlRenderer {
    pub fn new() -> Self {
        Self {
            flush_bytes: FLUSH_BYTES,
        }
    }

    /// Size of the data events the body is split into.
    pub fn with_flush_bytes(mut self, flush_bytes: usize) -> Self {
        self.flush_bytes = flush_bytes.max(1);
        self
    }
}

impl Default for HtmlRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for HtmlRenderer {
    fn render(
        &self,
        tree: ContentTree,
        _context: &RenderContext,
    ) -> Result<RenderStream, RenderError> {
        let mut body = String::new();
        write_node(&tree.root, &mut body, false)?;

        let body = Bytes::from(body);
        let flush_bytes = self.flush_bytes;
        let events = stream! {
            yield Ok(RenderEvent::Data(Bytes::from_static(DOCTYPE.as_bytes())));
            yield Ok(RenderEvent::ShellReady);

            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + flush_bytes).min(body.len());
                yield Ok(RenderEvent::Data(body.slice(offset..end)));
                offset = end;
            }
        };
        Ok(events.boxed())
    }
}

fn write_node(node: &Node, out: &mut String, raw_text: bool) -> Result<(), RenderError> {
    match node {
        Node::Empty => {}
        Node::Text(text) if raw_text => out.push_str(text),
        Node::Text(text) => escape_into(text, out, false),
        Node::Raw(html) => out.push_str(html),
        Node::Fragment(children) => {
            for child in children {
                write_node(child, out, raw_text)?;
            }
        }
        Node::Element {
            tag,
            attrs,
            children,
        } => {
            if !is_valid_name(tag) {
                return Err(RenderError::InvalidTag { tag: tag.clone() });
            }
            let tag = tag.to_ascii_lowercase();

            out.push('<');
            out.push_str(&tag);
            for (name, value) in attrs {
                if !is_valid_name(name) {
                    return Err(RenderError::failed(format!(
                        "invalid attribute `{name}` on <{tag}>"
                    )));
                }
                out.push(' ');
                out.push_str(name);
                if let AttrValue::Text(value) = value {
                    out.push_str("=\"");
                    escape_into(value, out, true);
                    out.push('"');
                }
            }
            out.push('>');

            if VOID_ELEMENTS.contains(&tag.as_str()) {
                if !children.is_empty() {
                    return Err(RenderError::failed(format!(
                        "void element <{tag}> cannot have children"
                    )));
                }
                return Ok(());
            }

            let raw_text = RAW_TEXT_ELEMENTS.contains(&tag.as_str());
            for child in children {
                write_node(child, out, raw_text)?;
            }
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }
    }
    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == ':' || c == '_')
}

fn escape_into(text: &str, out: &mut String, attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\'' if attribute => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
}
