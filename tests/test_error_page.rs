use std::collections::HashMap;

use courier::http::error_page::{apply_template, build_error_response, render_error_body};
use courier::proxy::pool::SpawnFailure;

#[test]
fn test_apply_template_substitutes_params() {
    let mut params = HashMap::new();
    params.insert("NAME".to_string(), "world".to_string());

    assert_eq!(apply_template("hello {{NAME}}!", &params), "hello world!");
}

#[test]
fn test_apply_template_unknown_keys_render_empty() {
    let params = HashMap::new();
    assert_eq!(apply_template("a{{MISSING}}b", &params), "ab");
}

#[test]
fn test_friendly_page_contains_message_and_context() {
    let body = render_error_body(
        "something exploded",
        "/srv/app",
        "production",
        None,
        true,
    );

    assert!(body.contains("something exploded"));
    assert!(body.contains("/srv/app"));
    assert!(body.contains("production"));
    assert!(body.contains("Internal server error"));
}

#[test]
fn test_spawn_failure_annotations_are_uppercased() {
    let mut annotations = HashMap::new();
    annotations.insert("error_id".to_string(), "abc-123".to_string());

    let failure = SpawnFailure {
        message: "could not spawn".to_string(),
        error_page: None,
        html: false,
        annotations,
    };
    let body = render_error_body(
        "could not spawn",
        "/srv/app",
        "staging",
        Some(&failure),
        true,
    );

    // The annotation value is reachable through its uppercased key; the
    // general template renders MESSAGE, so the message must be present and
    // the spawn title chosen.
    assert!(body.contains("Web application could not be started"));
    assert!(body.contains("could not spawn"));
}

#[test]
fn test_html_failure_selects_html_template() {
    let mut annotations = HashMap::new();
    annotations.insert("error_page".to_string(), "<html>boom</html>".to_string());

    let failure = SpawnFailure {
        message: "spawn failed".to_string(),
        error_page: Some("<html>boom</html>".to_string()),
        html: true,
        annotations,
    };
    let body = render_error_body(
        "<html>boom</html>",
        "/srv/app",
        "production",
        Some(&failure),
        true,
    );

    // The with-html template embeds the pre-rendered error page verbatim.
    assert!(body.contains("<html>boom</html>"));
    assert!(body.contains("Web application could not be started"));
}

#[test]
fn test_unfriendly_page_discloses_nothing() {
    let body = render_error_body(
        "secret details",
        "/srv/app",
        "production",
        None,
        false,
    );

    assert!(!body.contains("secret details"));
    assert!(!body.contains("/srv/app"));
    assert!(body.contains("Internal server error"));
}

#[test]
fn test_error_response_framing() {
    let response = build_error_response("<html>oops</html>", true);
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(text.contains("Status: 500 Internal Server Error\r\n"));
    assert!(text.contains("Content-Length: 17\r\n"));
    assert!(text.contains("Content-Type: text/html; charset=UTF-8\r\n"));
    assert!(text.ends_with("\r\n\r\n<html>oops</html>"));
}

#[test]
fn test_error_response_without_status_line() {
    let response = build_error_response("x", false);
    let text = String::from_utf8_lossy(&response);

    assert!(!text.contains("HTTP/1.1"));
    assert!(text.starts_with("Status: 500 Internal Server Error\r\n"));
}
