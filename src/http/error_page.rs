//! Assembly of the 500 response sent when a request cannot be dispatched.
//!
//! The friendly variant renders the embedded HTML templates with simple
//! `{{PLACEHOLDER}}` substitution; spawn-failure annotations are merged into
//! the parameters with uppercased keys, and a failure that carries HTML
//! selects the `_with_html` template. With friendly pages disabled, a static
//! undisclosed-error page is served instead.

use std::collections::HashMap;

use bytes::Bytes;

use crate::proxy::pool::SpawnFailure;

const LAYOUT: &str = include_str!("../../resources/templates/error_layout.html.template");
const LAYOUT_CSS: &str = include_str!("../../resources/templates/error_layout.css");
const GENERAL_ERROR: &str = include_str!("../../resources/templates/general_error.html.template");
const GENERAL_ERROR_WITH_HTML: &str =
    include_str!("../../resources/templates/general_error_with_html.html.template");
const UNDISCLOSED_ERROR: &str =
    include_str!("../../resources/templates/undisclosed_error.html.template");

/// Replaces each `{{KEY}}` in `template` with the matching parameter.
/// Unknown keys render as empty.
pub fn apply_template(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Some(value) = params.get(&after[..end]) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Renders the HTML body of the 500 page.
pub fn render_error_body(
    message: &str,
    app_root: &str,
    environment: &str,
    failure: Option<&SpawnFailure>,
    friendly: bool,
) -> String {
    if !friendly {
        return UNDISCLOSED_ERROR.to_string();
    }

    let mut params = HashMap::new();
    params.insert("CSS".to_string(), LAYOUT_CSS.to_string());
    params.insert("APP_ROOT".to_string(), app_root.to_string());
    params.insert("ENVIRONMENT".to_string(), environment.to_string());
    params.insert("MESSAGE".to_string(), message.to_string());

    let template = match failure {
        Some(failure) => {
            params.insert(
                "TITLE".to_string(),
                "Web application could not be started".to_string(),
            );
            for (name, value) in &failure.annotations {
                params.insert(name.to_uppercase(), value.clone());
            }
            if failure.html {
                GENERAL_ERROR_WITH_HTML
            } else {
                GENERAL_ERROR
            }
        }
        None => {
            params.insert("TITLE".to_string(), "Internal server error".to_string());
            GENERAL_ERROR
        }
    };

    let content = apply_template(template, &params);
    params.insert("CONTENT".to_string(), content);
    apply_template(LAYOUT, &params)
}

/// Wraps a rendered body in the 500 response framing. The HTTP status line
/// is included only when the request asked for it; the `Status`,
/// `Content-Length` and `Content-Type` headers always are.
pub fn build_error_response(body: &str, print_status_line: bool) -> Bytes {
    let mut out = Vec::with_capacity(body.len() + 128);
    if print_status_line {
        out.extend_from_slice(b"HTTP/1.1 500 Internal Server Error\r\n");
    }
    out.extend_from_slice(b"Status: 500 Internal Server Error\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Content-Type: text/html; charset=UTF-8\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.as_bytes());
    Bytes::from(out)
}
