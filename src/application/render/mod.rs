//! Worker-side collaborators: payload decoding and second-stage rendering.
//!
//! Both are pure with respect to ambient state: everything a route needs is
//! carried by its [`RenderContext`].

mod decoder;
mod html;
mod types;

pub use decoder::RowPayloadDecoder;
pub use html::HtmlRenderer;
pub use types::{
    AttrValue, ContentTree, DecodeError, FinalizeError, Node, PayloadDecoder, RenderContext,
    RenderError, RenderEvent, RenderStream, Renderer, WriteError,
};
