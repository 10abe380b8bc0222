//! Decoder for the row-oriented payload format.
//!
//! A payload is a sequence of newline-terminated rows `<hex id>:<json>`.
//! Row `0` is the root. Rows may reference each other (including forward
//! references) through `"$L<hex id>"` strings, so the tree can only be
//! assembled once every row has arrived.
//!
//! JSON values map onto nodes as follows:
//! - `["$", tag, props]` or `["$", tag, key, props]` is an element whose
//!   children live in `props.children`;
//! - any other array is a fragment;
//! - a string is text, with `"$$…"` escaping a literal leading `$`;
//! - numbers render as text; `null` and booleans render nothing.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use serde_json::{Map, Value};

use super::types::{AttrValue, ContentTree, DecodeError, Node, PayloadDecoder, RenderContext};

const ROOT_ROW: &str = "0";
const MAX_DEPTH: usize = 512;
const URL_ATTRIBUTES: [&str; 4] = ["href", "src", "action", "poster"];

#[derive(Debug, Default, Clone, Copy)]
pub struct RowPayloadDecoder;

impl PayloadDecoder for RowPayloadDecoder {
    fn decode(
        &self,
        chunks: &[Bytes],
        context: &RenderContext,
    ) -> Result<ContentTree, DecodeError> {
        let payload: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        let text = std::str::from_utf8(&payload).map_err(|_| DecodeError::Utf8)?;
        if text.trim().is_empty() {
            return Err(DecodeError::Empty);
        }

        let rows = parse_rows(text)?;
        let root = rows.get(ROOT_ROW).ok_or(DecodeError::MissingRoot)?;

        let mut resolver = Resolver {
            rows: &rows,
            visiting: HashSet::from([ROOT_ROW.to_string()]),
            context,
        };
        let root = resolver.node(root, 0)?;
        Ok(ContentTree { root })
    }
}

fn parse_rows(text: &str) -> Result<HashMap<String, Value>, DecodeError> {
    let mut rows = HashMap::new();
    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let (id, json) = line.split_once(':').ok_or_else(|| DecodeError::MalformedRow {
            line: line_no,
            message: "missing `:` separator".to_string(),
        })?;
        let id = normalize_row_id(id).ok_or_else(|| DecodeError::MalformedRow {
            line: line_no,
            message: format!("invalid row id `{id}`"),
        })?;
        let value: Value = serde_json::from_str(json).map_err(|err| DecodeError::MalformedRow {
            line: line_no,
            message: err.to_string(),
        })?;

        if rows.insert(id.clone(), value).is_some() {
            return Err(DecodeError::MalformedRow {
                line: line_no,
                message: format!("duplicate row `{id}`"),
            });
        }
    }
    Ok(rows)
}

/// Row ids are hexadecimal; leading zeros and case are not significant.
fn normalize_row_id(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let trimmed = raw.trim_start_matches('0');
    if trimmed.is_empty() {
        Some(ROOT_ROW.to_string())
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

struct Resolver<'a> {
    rows: &'a HashMap<String, Value>,
    visiting: HashSet<String>,
    context: &'a RenderContext,
}

impl Resolver<'_> {
    fn node(&mut self, value: &Value, depth: usize) -> Result<Node, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::InvalidContent(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }

        match value {
            Value::Null | Value::Bool(_) => Ok(Node::Empty),
            Value::Number(number) => Ok(Node::Text(number.to_string())),
            Value::String(text) => self.string(text, depth),
            Value::Array(items) => match element_parts(items) {
                Some((tag, props)) => self.element(tag, props, depth),
                None => self.fragment(items, depth),
            },
            Value::Object(_) => Err(DecodeError::InvalidContent(
                "objects are not valid children".to_string(),
            )),
        }
    }

    fn string(&mut self, text: &str, depth: usize) -> Result<Node, DecodeError> {
        if let Some(escaped) = text.strip_prefix("$$") {
            return Ok(Node::Text(format!("${escaped}")));
        }
        if let Some(reference) = text.strip_prefix("$L") {
            return self.reference(reference, depth);
        }
        if text == "$undefined" {
            return Ok(Node::Empty);
        }
        Ok(Node::Text(text.to_string()))
    }

    fn reference(&mut self, raw: &str, depth: usize) -> Result<Node, DecodeError> {
        let id = normalize_row_id(raw)
            .ok_or_else(|| DecodeError::UnresolvedReference(raw.to_string()))?;
        let rows = self.rows;
        let value = rows
            .get(&id)
            .ok_or_else(|| DecodeError::UnresolvedReference(id.clone()))?;

        if !self.visiting.insert(id.clone()) {
            return Err(DecodeError::Cycle(id));
        }
        let node = self.node(value, depth + 1);
        self.visiting.remove(&id);
        node
    }

    fn fragment(&mut self, items: &[Value], depth: usize) -> Result<Node, DecodeError> {
        let children = items
            .iter()
            .map(|item| self.node(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Node::Fragment(children))
    }

    fn element(
        &mut self,
        tag: &str,
        props: Option<&Map<String, Value>>,
        depth: usize,
    ) -> Result<Node, DecodeError> {
        let mut attrs = BTreeMap::new();
        let mut children = Vec::new();

        for (name, value) in props.into_iter().flatten() {
            match name.as_str() {
                "children" => match self.node(value, depth + 1)? {
                    Node::Fragment(nodes) => children.extend(nodes),
                    Node::Empty => {}
                    node => children.push(node),
                },
                "dangerouslySetInnerHTML" => {
                    let html = value
                        .get("__html")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            DecodeError::InvalidContent(
                                "dangerouslySetInnerHTML requires a string `__html`".to_string(),
                            )
                        })?;
                    children.push(Node::Raw(html.to_string()));
                }
                "key" | "ref" => {}
                handler if is_event_handler(handler) => {}
                _ => {
                    if let Some((attr, value)) = self.attribute(name, value) {
                        attrs.insert(attr, value);
                    }
                }
            }
        }

        // Component references have no markup of their own; keep their output.
        if tag.starts_with('$') {
            return Ok(Node::Fragment(children));
        }

        Ok(Node::Element {
            tag: tag.to_string(),
            attrs,
            children,
        })
    }

    fn attribute(&self, name: &str, value: &Value) -> Option<(String, AttrValue)> {
        let attr = match name {
            "className" => "class".to_string(),
            "htmlFor" => "for".to_string(),
            other => other.to_string(),
        };

        let value = match value {
            Value::Null | Value::Bool(false) => return None,
            Value::Bool(true) => AttrValue::Flag,
            Value::Number(number) => AttrValue::Text(number.to_string()),
            Value::String(text) if URL_ATTRIBUTES.contains(&attr.as_str()) => {
                AttrValue::Text(self.context.resolve_url(text))
            }
            Value::String(text) => AttrValue::Text(text.clone()),
            Value::Object(map) if attr == "style" => AttrValue::Text(inline_style(map)),
            Value::Array(_) | Value::Object(_) => return None,
        };
        Some((attr, value))
    }
}

fn element_parts(items: &[Value]) -> Option<(&str, Option<&Map<String, Value>>)> {
    if items.len() < 2 || items.len() > 4 || items[0].as_str() != Some("$") {
        return None;
    }
    let tag = items[1].as_str()?;
    let props = items.last().filter(|_| items.len() > 2).and_then(Value::as_object);
    Some((tag, props))
}

fn is_event_handler(name: &str) -> bool {
    name.len() > 2
        && name.starts_with("on")
        && name[2..].chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn inline_style(map: &Map<String, Value>) -> String {
    map.iter()
        .filter_map(|(property, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                Value::Number(number) => number.to_string(),
                _ => return None,
            };
            Some(format!("{}:{value}", kebab_case(property)))
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn kebab_case(property: &str) -> String {
    let mut out = String::with_capacity(property.len() + 4);
    for c in property.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
