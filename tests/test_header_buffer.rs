use courier::http::header_buffer::HeaderBufferer;

#[test]
fn test_complete_header_in_one_chunk() {
    let mut bufferer = HeaderBufferer::new(4096);
    let data = b"Status: 200\r\nContent-Length: 2\r\n\r\n";

    let consumed = bufferer.feed(data);
    assert_eq!(consumed, data.len());
    assert!(bufferer.is_complete());
    assert_eq!(bufferer.data(), data);
}

#[test]
fn test_bytes_past_terminator_are_not_consumed() {
    let mut bufferer = HeaderBufferer::new(4096);
    let data = b"Status: 200\r\n\r\nhello";

    let consumed = bufferer.feed(data);
    assert_eq!(consumed, data.len() - "hello".len());
    assert!(bufferer.is_complete());
    assert_eq!(bufferer.data(), b"Status: 200\r\n\r\n");
}

#[test]
fn test_terminator_split_across_chunks() {
    let mut bufferer = HeaderBufferer::new(4096);

    assert_eq!(bufferer.feed(b"Status: 200\r"), 12);
    assert!(!bufferer.is_complete());
    assert_eq!(bufferer.feed(b"\n\r"), 2);
    assert!(!bufferer.is_complete());
    assert_eq!(bufferer.feed(b"\nrest"), 1);
    assert!(bufferer.is_complete());
    assert_eq!(bufferer.data(), b"Status: 200\r\n\r\n");
}

#[test]
fn test_one_byte_at_a_time() {
    let data = b"X: y\r\n\r\n";
    let mut bufferer = HeaderBufferer::new(4096);

    for byte in data {
        assert!(bufferer.accepting_input());
        assert_eq!(bufferer.feed(std::slice::from_ref(byte)), 1);
    }
    assert!(bufferer.is_complete());
    assert_eq!(bufferer.data(), data);
}

#[test]
fn test_false_start_resets_match() {
    let mut bufferer = HeaderBufferer::new(4096);
    let data = b"a\r\nb\r\n\r\n";

    assert_eq!(bufferer.feed(data), data.len());
    assert!(bufferer.is_complete());
}

#[test]
fn test_oversized_header_is_an_error() {
    let mut bufferer = HeaderBufferer::new(8);

    bufferer.feed(b"this is longer than eight bytes");
    assert!(bufferer.has_error());
    assert!(!bufferer.is_complete());
    assert!(!bufferer.accepting_input());
}
