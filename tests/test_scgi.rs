use courier::http::scgi::{HeaderBlock, ScgiError, ScgiParser};

fn netstring(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in pairs {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    let mut out = format!("{}:", body.len()).into_bytes();
    out.extend_from_slice(&body);
    out.push(b',');
    out
}

#[test]
fn test_parse_simple_header_frame() {
    let frame = netstring(&[("REQUEST_METHOD", "GET"), ("PATH_INFO", "/")]);
    let mut parser = ScgiParser::new(4096);

    let consumed = parser.feed(&frame);
    assert_eq!(consumed, frame.len());
    assert!(parser.is_complete());
    assert!(!parser.accepting_input());
    assert_eq!(parser.block().get(b"REQUEST_METHOD").unwrap(), b"GET");
    assert_eq!(parser.block().get(b"PATH_INFO").unwrap(), b"/");
}

#[test]
fn test_parse_one_byte_at_a_time() {
    let frame = netstring(&[("REQUEST_METHOD", "POST"), ("CONTENT_LENGTH", "5")]);
    let mut parser = ScgiParser::new(4096);

    for byte in &frame {
        assert!(parser.accepting_input());
        let consumed = parser.feed(std::slice::from_ref(byte));
        assert_eq!(consumed, 1);
    }
    assert!(parser.is_complete());
    assert_eq!(parser.block().get(b"CONTENT_LENGTH").unwrap(), b"5");
}

#[test]
fn test_bytes_after_frame_are_not_consumed() {
    let mut frame = netstring(&[("REQUEST_METHOD", "POST")]);
    let frame_len = frame.len();
    frame.extend_from_slice(b"body bytes");

    let mut parser = ScgiParser::new(4096);
    let consumed = parser.feed(&frame);
    assert_eq!(consumed, frame_len);
    assert!(parser.is_complete());

    // Once complete, further feeds consume nothing.
    assert_eq!(parser.feed(b"more"), 0);
}

#[test]
fn test_header_data_matches_wire_body() {
    let frame = netstring(&[("A", "1"), ("B", "2")]);
    let mut parser = ScgiParser::new(4096);
    parser.feed(&frame);

    assert!(parser.is_complete());
    assert_eq!(parser.header_data().as_ref(), b"A\x001\x00B\x002\x00");
}

#[test]
fn test_declared_length_over_limit_is_too_large() {
    let frame = netstring(&[("REQUEST_METHOD", "GET")]);
    let mut parser = ScgiParser::new(8);

    parser.feed(&frame);
    assert!(parser.has_error());
    assert_eq!(parser.error(), Some(ScgiError::TooLarge));
}

#[test]
fn test_absurdly_long_length_field_is_too_large() {
    let mut parser = ScgiParser::new(1024 * 1024);
    parser.feed(b"99999999999:");
    assert_eq!(parser.error(), Some(ScgiError::TooLarge));
}

#[test]
fn test_non_digit_length_is_malformed() {
    let mut parser = ScgiParser::new(4096);
    parser.feed(b"12x:");
    assert_eq!(parser.error(), Some(ScgiError::Malformed));
}

#[test]
fn test_missing_comma_terminator_is_malformed() {
    let mut parser = ScgiParser::new(4096);
    parser.feed(b"4:A\x001\x00;");
    assert_eq!(parser.error(), Some(ScgiError::Malformed));
}

#[test]
fn test_unterminated_pair_structure_is_malformed() {
    // Body does not end with a null byte.
    let mut parser = ScgiParser::new(4096);
    parser.feed(b"4:A\x0012,");
    assert_eq!(parser.error(), Some(ScgiError::Malformed));
}

#[test]
fn test_odd_field_count_is_malformed() {
    // Key with no value.
    let mut parser = ScgiParser::new(4096);
    parser.feed(b"2:A\x00,");
    assert_eq!(parser.error(), Some(ScgiError::Malformed));
}

#[test]
fn test_empty_header_block() {
    let mut parser = ScgiParser::new(4096);
    let consumed = parser.feed(b"0:,");
    assert_eq!(consumed, 3);
    assert!(parser.is_complete());
    assert!(parser.block().is_empty());
}

#[test]
fn test_normalize_moves_http_content_length() {
    let mut block = HeaderBlock::default();
    block.insert(&b"HTTP_CONTENT_LENGTH"[..], &b"42"[..]);

    let modified = block.normalize();
    assert!(modified);
    assert!(!block.contains(b"HTTP_CONTENT_LENGTH"));
    assert_eq!(block.get(b"CONTENT_LENGTH").unwrap(), b"42");
}

#[test]
fn test_normalize_drops_http_content_length_when_plain_exists() {
    let mut block = HeaderBlock::default();
    block.insert(&b"CONTENT_LENGTH"[..], &b"10"[..]);
    block.insert(&b"HTTP_CONTENT_LENGTH"[..], &b"42"[..]);

    let modified = block.normalize();
    assert!(modified);
    assert!(!block.contains(b"HTTP_CONTENT_LENGTH"));
    assert_eq!(block.get(b"CONTENT_LENGTH").unwrap(), b"10");
}

#[test]
fn test_normalize_handles_content_type_too() {
    let mut block = HeaderBlock::default();
    block.insert(&b"HTTP_CONTENT_TYPE"[..], &b"text/plain"[..]);

    assert!(block.normalize());
    assert_eq!(block.get(b"CONTENT_TYPE").unwrap(), b"text/plain");
}

#[test]
fn test_normalize_untouched_block_reports_unmodified() {
    let mut block = HeaderBlock::default();
    block.insert(&b"REQUEST_METHOD"[..], &b"GET"[..]);
    block.insert(&b"CONTENT_LENGTH"[..], &b"3"[..]);

    assert!(!block.normalize());
}

#[test]
fn test_serialize_preserves_insertion_order() {
    let mut block = HeaderBlock::default();
    block.insert(&b"B"[..], &b"2"[..]);
    block.insert(&b"A"[..], &b"1"[..]);

    assert_eq!(block.serialize().as_ref(), b"B\x002\x00A\x001\x00");
}

#[test]
fn test_bool_option() {
    let mut block = HeaderBlock::default();
    block.insert(&b"PASSENGER_BUFFERING"[..], &b"true"[..]);
    block.insert(&b"PASSENGER_PRINT_STATUS_LINE"[..], &b"false"[..]);

    assert!(block.bool_option(b"PASSENGER_BUFFERING", false));
    assert!(!block.bool_option(b"PASSENGER_PRINT_STATUS_LINE", true));
    assert!(block.bool_option(b"PASSENGER_FRIENDLY_ERROR_PAGES", true));
}
