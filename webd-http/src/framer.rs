//! Request framer: decides whether a byte prefix holds a complete
//! HTTP/1.1 request.
//!
//! This is the engine's completeness probe. It runs over borrowed bytes on
//! every readiness event before the real parser is invoked, so it performs
//! no allocation and no mutation: a single pass over the header section
//! for `Content-Length` / `Transfer-Encoding`, then either a length check
//! or a chunk walk.

/// Default cap on the header section. A prefix that grows past this
/// without containing the header terminator is malformed.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Outcome of a completeness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Not enough bytes yet; re-run on the next readiness event.
    Incomplete,
    /// A full request occupies the first `consumed` bytes of the prefix.
    Complete { consumed: usize },
    /// The prefix can never become a valid request.
    Malformed(&'static str),
}

impl Probe {
    pub fn is_complete(&self) -> bool {
        matches!(self, Probe::Complete { .. })
    }
}

/// Checks whether `data` starts with a complete request.
///
/// Body framing is decided in order: `Transfer-Encoding: chunked`, then
/// `Content-Length`, then no body. Chunk extensions are stripped at the
/// first `;`; the first CRLF after the zero-sized chunk terminates the
/// message (trailers are not consumed beyond that).
pub fn check(data: &[u8], max_header_bytes: usize) -> Probe {
    let header_end = match find(data, HEADER_END) {
        Some(idx) => idx,
        None => {
            if data.len() > max_header_bytes {
                return Probe::Malformed("header section exceeds cap");
            }
            return Probe::Incomplete;
        }
    };

    let body_start = header_end + HEADER_END.len();
    let headers = &data[..header_end];

    // Skip the request line.
    let mut cur = match find(headers, CRLF) {
        Some(idx) => &headers[idx + 2..],
        None => return Probe::Incomplete,
    };

    let mut content_length: Option<u64> = None;
    let mut chunked = false;

    while !cur.is_empty() {
        let line;
        match find(cur, CRLF) {
            Some(idx) => {
                line = &cur[..idx];
                cur = &cur[idx + 2..];
            }
            None => {
                line = cur;
                cur = &[];
            }
        }

        if let Some(value) = header_value(line, b"content-length:") {
            if let Some(n) = parse_decimal(trim(value)) {
                content_length = Some(n);
            }
        } else if let Some(value) = header_value(line, b"transfer-encoding:") {
            if contains_token_chunked(value) {
                chunked = true;
            }
        }
    }

    if chunked {
        return check_chunked(data, body_start);
    }

    if let Some(n) = content_length {
        let total = body_start as u64 + n;
        if data.len() as u64 >= total {
            return Probe::Complete {
                consumed: total as usize,
            };
        }
        return Probe::Incomplete;
    }

    Probe::Complete {
        consumed: body_start,
    }
}

fn check_chunked(data: &[u8], body_start: usize) -> Probe {
    let body = &data[body_start..];
    let mut offset = 0usize;

    loop {
        let line_end = match find(&body[offset..], CRLF) {
            Some(idx) => idx,
            None => return Probe::Incomplete,
        };

        // Chunk extensions: the size ends at the first semicolon.
        let mut line = &body[offset..offset + line_end];
        if let Some(semi) = line.iter().position(|&b| b == b';') {
            line = &line[..semi];
        }
        let line = trim(line);

        let chunk_size = match parse_hex(line) {
            Some(n) => n,
            None => return Probe::Malformed("invalid chunk size"),
        };

        offset += line_end + 2;

        if chunk_size == 0 {
            // Last chunk. The message ends at the next CRLF; any trailer
            // headers before it are skipped, not parsed.
            let trailer_end = match find(&body[offset..], CRLF) {
                Some(idx) => idx,
                None => return Probe::Incomplete,
            };
            return Probe::Complete {
                consumed: body_start + offset + trailer_end + 2,
            };
        }

        // Chunk data plus its trailing CRLF.
        if ((body.len() - offset) as u64) < chunk_size + 2 {
            return Probe::Incomplete;
        }
        offset += chunk_size as usize + 2;
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Case-insensitive match on `name:` (colon included); returns the raw
/// value bytes on a hit.
fn header_value<'a>(line: &'a [u8], name_with_colon: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name_with_colon.len() {
        return None;
    }
    let (prefix, rest) = line.split_at(name_with_colon.len());
    if prefix.eq_ignore_ascii_case(name_with_colon) {
        Some(rest)
    } else {
        None
    }
}

pub(crate) fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

fn contains_token_chunked(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|token| trim(token).eq_ignore_ascii_case(b"chunked"))
}

/// Strict decimal: optional single leading sign, then digits only.
/// Negative values are treated as absent (mirrors lenient header reuse).
fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    let (negative, digits) = match bytes {
        [b'-', rest @ ..] => (true, rest),
        [b'+', rest @ ..] => (false, rest),
        _ => (false, bytes),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value
            .checked_mul(10)?
            .checked_add(u64::from(b - b'0'))?;
        if value > i64::MAX as u64 {
            return None;
        }
    }
    if negative {
        return None;
    }
    Some(value)
}

/// Strict hex, upper and lower case accepted, bounded to a 63-bit value.
pub(crate) fn parse_hex(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            b'a'..=b'f' => u64::from(b - b'a' + 10),
            b'A'..=b'F' => u64::from(b - b'A' + 10),
            _ => return None,
        };
        value = value.checked_mul(16)?.checked_add(digit)?;
        if value > i64::MAX as u64 {
            return None;
        }
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_default(data: &[u8]) -> Probe {
        check(data, DEFAULT_MAX_HEADER_BYTES)
    }

    #[test]
    fn bodyless_request_completes_at_header_end() {
        let req = b"GET /?id=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn partial_headers_are_incomplete() {
        assert_eq!(
            check_default(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Probe::Incomplete
        );
        assert_eq!(check_default(b""), Probe::Incomplete);
    }

    #[test]
    fn content_length_body_completes_exactly_at_length() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nHello";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
        // One byte short of the declared body.
        assert_eq!(check_default(&req[..req.len() - 1]), Probe::Incomplete);
    }

    #[test]
    fn content_length_header_is_case_insensitive() {
        let req = b"POST / HTTP/1.1\r\ncontent-length: 2\r\n\r\nok";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn consumed_ignores_pipelined_suffix() {
        let first = b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET / HTTP/1.1\r\n\r\n";
        let expected = b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nok".len();
        assert_eq!(
            check_default(first),
            Probe::Complete { consumed: expected }
        );
    }

    #[test]
    fn chunked_request_completes_after_terminator() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn chunked_without_final_crlf_is_incomplete() {
        // The zero chunk line is present but the terminating CRLF is not.
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\n";
        assert_eq!(check_default(req), Probe::Incomplete);
    }

    #[test]
    fn chunked_truncated_mid_data_is_incomplete() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n";
        assert_eq!(check_default(req), Probe::Incomplete);
    }

    #[test]
    fn chunk_extensions_are_stripped() {
        let req =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nHello\r\n0\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn invalid_chunk_size_is_malformed() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nxyz\r\n";
        assert!(matches!(check_default(req), Probe::Malformed(_)));
    }

    #[test]
    fn hex_chunk_sizes_accept_both_cases() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nA\r\n0123456789\r\n0\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\na\r\n0123456789\r\n0\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: 9999\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn oversized_header_section_is_malformed() {
        let mut req = Vec::from(&b"GET / HTTP/1.1\r\n"[..]);
        while req.len() <= DEFAULT_MAX_HEADER_BYTES {
            req.extend_from_slice(b"X-Pad: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        assert!(matches!(check_default(&req), Probe::Malformed(_)));
    }

    #[test]
    fn under_cap_without_terminator_is_incomplete() {
        let req = b"GET / HTTP/1.1\r\nX-Pad: aaaa\r\n";
        assert_eq!(check_default(req), Probe::Incomplete);
    }

    #[test]
    fn negative_content_length_is_ignored() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n";
        assert_eq!(
            check_default(req),
            Probe::Complete { consumed: req.len() }
        );
    }

    #[test]
    fn completeness_is_stable_under_suffixes() {
        let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\n\r\n";
        let consumed = match check_default(req) {
            Probe::Complete { consumed } => consumed,
            other => panic!("expected complete, got {:?}", other),
        };
        let mut extended = req.to_vec();
        extended.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(check_default(&extended), Probe::Complete { consumed });
        assert!(consumed <= req.len());
    }
}
