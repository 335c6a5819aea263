//! Content-Type detection over the first bytes of a response body.
//!
//! A compact signature table covering the formats that matter for a
//! server default, falling back to a text/binary heuristic. Only the
//! first 512 bytes are considered.

const SNIFF_LEN: usize = 512;

/// Detects a Content-Type for `data`. Never returns an empty string.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    // Leading whitespace is insignificant for markup detection.
    let trimmed = {
        let start = data
            .iter()
            .position(|&b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
            .unwrap_or(data.len());
        &data[start..]
    };

    const HTML_TAGS: [&str; 10] = [
        "<!DOCTYPE HTML",
        "<HTML",
        "<HEAD",
        "<SCRIPT",
        "<TITLE",
        "<BODY",
        "<TABLE",
        "<DIV",
        "<P",
        "<!--",
    ];
    for tag in HTML_TAGS {
        if let Some(rest) = prefix_ignore_case(trimmed, tag.as_bytes()) {
            // The tag must terminate; "<Preamble" is not "<P".
            if tag == "<!--" || matches!(rest.first(), Some(b' ') | Some(b'>') | None) {
                return "text/html; charset=utf-8";
            }
        }
    }
    if prefix_ignore_case(trimmed, b"<?xml").is_some() {
        return "text/xml; charset=utf-8";
    }

    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if data.starts_with(b"%!PS-Adobe-") {
        return "application/postscript";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if data.starts_with(b"\x1f\x8b\x08") {
        return "application/x-gzip";
    }
    if data.starts_with(&[0xfe, 0xff]) || data.starts_with(&[0xff, 0xfe]) {
        return "text/plain; charset=utf-16";
    }
    if data.starts_with(&[0xef, 0xbb, 0xbf]) {
        return "text/plain; charset=utf-8";
    }

    if data.iter().any(|&b| is_binary_byte(b)) {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn prefix_ignore_case<'a>(data: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if data.len() < prefix.len() {
        return None;
    }
    let (head, rest) = data.split_at(prefix.len());
    if head.eq_ignore_ascii_case(prefix) {
        Some(rest)
    } else {
        None
    }
}

fn is_binary_byte(b: u8) -> bool {
    b <= 0x08 || b == 0x0b || (0x0e..=0x1a).contains(&b) || (0x1c..=0x1f).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_html() {
        assert_eq!(
            detect_content_type(b"<!DOCTYPE html><html></html>"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            detect_content_type(b"  \n<html><body>hi</body>"),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn tag_must_terminate() {
        // "<Paragraph" must not match "<P".
        assert_eq!(
            detect_content_type(b"<Paragraph data"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn detects_common_binaries() {
        assert_eq!(detect_content_type(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(detect_content_type(b"GIF89a......"), "image/gif");
        assert_eq!(
            detect_content_type(b"\x89PNG\r\n\x1a\nrest"),
            "image/png"
        );
        assert_eq!(detect_content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
    }

    #[test]
    fn plain_text_fallback() {
        assert_eq!(
            detect_content_type(b"Response 1"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn binary_fallback() {
        assert_eq!(
            detect_content_type(&[0x00, 0x01, 0x02, 0x03]),
            "application/octet-stream"
        );
    }
}
