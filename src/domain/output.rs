use std::path::{Path, PathBuf};

use prerender_protocol::Route;

const HTML_INDEX: &str = "index.html";
const PAYLOAD_INDEX: &str = "index.rsc";

/// File that receives the rendered HTML for `route`.
///
/// `/` maps to `<out_dir>/index.html`, `/about` to `<out_dir>/about/index.html`.
/// A route whose last segment already ends in `.html` is written as-is.
pub fn html_output_path(out_dir: &Path, route: &Route) -> PathBuf {
    output_path(out_dir, route, HTML_INDEX, "html")
}

/// File that receives a verbatim copy of the route's payload stream.
pub fn payload_output_path(out_dir: &Path, route: &Route) -> PathBuf {
    output_path(out_dir, route, PAYLOAD_INDEX, "rsc")
}

fn output_path(out_dir: &Path, route: &Route, index: &str, extension: &str) -> PathBuf {
    let mut path = out_dir.to_path_buf();
    let mut explicit_file = false;
    for segment in route.segments() {
        path.push(segment);
        explicit_file = segment.ends_with(".html");
    }

    if explicit_file {
        path.set_extension(extension);
        path
    } else {
        path.join(index)
    }
}
