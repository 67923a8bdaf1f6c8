//! # First-Payload Classifier
//!
//! Byte-level predicates over the first payload of a flow and over the first
//! bytes a peer sends back. These decide which protocol a flow speaks (TLS
//! ClientHello, plain HTTP, raw TCP), extract the SNI or Host name used for
//! strategy matching, and recognize the two response shapes that indicate a
//! blocked destination: a ServerHello that does not match the ClientHello,
//! and an HTTP redirect pointing away from the requested host.
//!
//! All functions are pure and never allocate; hostnames are returned as
//! slices into the scanned buffer.

use std::collections::HashSet;

// Offset of the legacy session id inside a TLS handshake record:
// record header (5) + handshake header (4) + version (2) + random (32).
const TLS_SESSION_ID_OFFSET: usize = 43;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"PATCH ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"TRACE ",
    b"CONNECT ",
];

/// True when the buffer starts a TLS handshake record of the given type.
fn is_tls_handshake(buf: &[u8], handshake_type: u8) -> bool {
    buf.len() > 5 && buf[0] == 0x16 && buf[1] == 0x03 && buf[5] == handshake_type
}

/// True when the buffer looks like a TLS ClientHello.
pub fn is_tls_chello(buf: &[u8]) -> bool {
    is_tls_handshake(buf, 0x01)
}

/// True when the buffer looks like a TLS ServerHello.
pub fn is_tls_shello(buf: &[u8]) -> bool {
    is_tls_handshake(buf, 0x02)
}

/// Legacy session id of a hello record, when present and in bounds.
fn tls_session_id(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() <= TLS_SESSION_ID_OFFSET {
        return None;
    }
    let len = buf[TLS_SESSION_ID_OFFSET] as usize;
    if len == 0 || buf.len() < TLS_SESSION_ID_OFFSET + 1 + len {
        return None;
    }
    Some(&buf[TLS_SESSION_ID_OFFSET + 1..TLS_SESSION_ID_OFFSET + 1 + len])
}

/// True when both hellos carry a legacy session id and the ServerHello does
/// not echo the ClientHello's. A mismatch is the signature of an injected
/// response racing the real server.
pub fn neq_tls_sid(req: &[u8], resp: &[u8]) -> bool {
    if !is_tls_chello(req) || !is_tls_shello(resp) {
        return false;
    }
    match (tls_session_id(req), tls_session_id(resp)) {
        (Some(q), Some(s)) => q != s,
        _ => false,
    }
}

/// Fast byte-level check for an HTTP request line, without UTF-8 validation.
pub fn is_http(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| buf.starts_with(m))
}

/// Extract the SNI hostname from a TLS ClientHello.
///
/// Walks the fixed ClientHello layout (record header, handshake header,
/// version, random, session id, cipher suites, compression methods) to the
/// extension block and scans for extension type 0.
pub fn parse_sni(buf: &[u8]) -> Option<&str> {
    if !is_tls_chello(buf) {
        return None;
    }

    let mut pos = 5; // TLS record header

    // Handshake type (1) + length (3) + client version (2)
    pos += 4 + 2;

    // Client random
    pos += 32;

    if pos + 1 > buf.len() {
        return None;
    }

    // Session id
    let session_id_len = buf[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > buf.len() {
        return None;
    }

    // Cipher suites
    let cipher_suites_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2 + cipher_suites_len;

    if pos + 1 > buf.len() {
        return None;
    }

    // Compression methods
    let compression_methods_len = buf[pos] as usize;
    pos += 1 + compression_methods_len;

    if pos + 2 > buf.len() {
        return None;
    }

    let extensions_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;

    if pos + extensions_len > buf.len() {
        return None;
    }

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end {
        let ext_type = ((buf[pos] as u16) << 8) | (buf[pos + 1] as u16);
        let ext_len = ((buf[pos + 2] as usize) << 8) | (buf[pos + 3] as usize);
        pos += 4;

        if pos + ext_len > extensions_end {
            break;
        }

        // SNI extension type is 0
        if ext_type == 0 {
            if ext_len >= 5 {
                // Server name list length (2), name type (1), hostname length (2)
                let name_type = buf[pos + 2];
                let hostname_len = ((buf[pos + 3] as usize) << 8) | (buf[pos + 4] as usize);
                if name_type == 0 && pos + 5 + hostname_len <= extensions_end {
                    return std::str::from_utf8(&buf[pos + 5..pos + 5 + hostname_len]).ok();
                }
            }
            break;
        }

        pos += ext_len;
    }

    None
}

/// Extract the `Host` header value from an HTTP request.
///
/// Scans the first KiB for a `host:` line (case-insensitive, at a line
/// start) and returns the trimmed value.
pub fn parse_http_host(buf: &[u8]) -> Option<&str> {
    if !is_http(buf) {
        return None;
    }
    let scan_len = std::cmp::min(buf.len(), 1024);
    let pattern = b"host:";

    let mut i = 0;
    while i + pattern.len() <= scan_len {
        let at_line_start = i == 0 || buf[i - 1] == b'\n';
        if at_line_start && buf[i..i + pattern.len()].eq_ignore_ascii_case(pattern) {
            let start = i + pattern.len();
            let mut end = start;
            while end < scan_len && buf[end] != b'\r' && buf[end] != b'\n' {
                end += 1;
            }

            let value = &buf[start..end];
            let trim_start = value.iter().take_while(|b| matches!(**b, b' ' | b'\t')).count();
            let trim_end = value
                .iter()
                .rev()
                .take_while(|b| matches!(**b, b' ' | b'\t'))
                .count();
            if trim_start + trim_end < value.len() {
                return std::str::from_utf8(&value[trim_start..value.len() - trim_end]).ok();
            }
            return None;
        }
        i += 1;
    }

    None
}

/// Hostname the flow is aimed at: SNI first, HTTP Host as fallback.
pub fn payload_host(buf: &[u8]) -> Option<&str> {
    parse_sni(buf).or_else(|| parse_http_host(buf))
}

/// Match the payload's hostname against a suffix set.
///
/// The full name is tested first, then the remainder after each `.`
/// boundary, so `cdn.video.example.com` hits a set containing
/// `example.com`. An empty set matches nothing.
pub fn host_match(hosts: &HashSet<String>, buf: &[u8]) -> bool {
    let Some(host) = payload_host(buf) else {
        return false;
    };
    let mut rest = host;
    loop {
        if hosts.contains(rest) {
            return true;
        }
        match rest.find('.') {
            Some(dot) => rest = &rest[dot + 1..],
            None => return false,
        }
    }
}

/// Status code of an HTTP/1.x response line.
fn http_status(resp: &[u8]) -> Option<u16> {
    if resp.len() < 12 || !resp.starts_with(b"HTTP/1.") {
        return None;
    }
    let digits = &resp[9..12];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(
        (digits[0] - b'0') as u16 * 100 + (digits[1] - b'0') as u16 * 10 + (digits[2] - b'0') as u16,
    )
}

/// Host part of an absolute `Location:` header value, when present.
fn location_host(resp: &[u8]) -> Option<&str> {
    let scan_len = std::cmp::min(resp.len(), 1024);
    let pattern = b"location:";

    let mut i = 0;
    while i + pattern.len() <= scan_len {
        let at_line_start = i == 0 || resp[i - 1] == b'\n';
        if at_line_start && resp[i..i + pattern.len()].eq_ignore_ascii_case(pattern) {
            let mut start = i + pattern.len();
            while start < scan_len && (resp[start] == b' ' || resp[start] == b'\t') {
                start += 1;
            }
            let value_end = start
                + resp[start..scan_len]
                    .iter()
                    .position(|b| *b == b'\r' || *b == b'\n')
                    .unwrap_or(scan_len - start);
            let value = &resp[start..value_end];

            // Relative redirects stay on the requested host.
            let scheme_end = value.windows(3).position(|w| w == b"://")?;
            let host = &value[scheme_end + 3..];
            let host_end = host
                .iter()
                .position(|b| *b == b'/' || *b == b':')
                .unwrap_or(host.len());
            return std::str::from_utf8(&host[..host_end]).ok();
        }
        i += 1;
    }
    None
}

fn same_site(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    a.len() > b.len() && a.as_bytes()[a.len() - b.len() - 1] == b'.' && a.ends_with(b)
        || b.len() > a.len() && b.as_bytes()[b.len() - a.len() - 1] == b'.' && b.ends_with(a)
}

/// True when the response is a 3xx redirect that leaves the requested host.
///
/// A redirect within the same site (same name, or a sub/superdomain) is
/// normal server behavior; a redirect to an unrelated host right after the
/// first request is the usual shape of an injected block page.
pub fn is_http_redirect(req: &[u8], resp: &[u8]) -> bool {
    match http_status(resp) {
        Some(code) if (300..400).contains(&code) => {}
        _ => return false,
    }
    let Some(req_host) = parse_http_host(req) else {
        return false;
    };
    let Some(loc_host) = location_host(resp) else {
        return false;
    };
    !same_site(req_host, loc_host)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Build a minimal TLS hello record for tests.
    pub fn tls_hello(handshake_type: u8, session_id: &[u8], sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0xab; 32]); // random
        body.push(session_id.len() as u8);
        body.extend_from_slice(session_id);
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut exts = Vec::new();
        if let Some(name) = sni {
            let name = name.as_bytes();
            exts.extend_from_slice(&[0x00, 0x00]); // extension type: server_name
            let ext_len = name.len() + 5;
            exts.extend_from_slice(&(ext_len as u16).to_be_bytes());
            exts.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            exts.push(0x00); // name type: host_name
            exts.extend_from_slice(&(name.len() as u16).to_be_bytes());
            exts.extend_from_slice(name);
        }
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![handshake_type];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    pub fn client_hello(sni: &str) -> Vec<u8> {
        tls_hello(0x01, &[0x11; 32], Some(sni))
    }

    pub fn server_hello(session_id: &[u8]) -> Vec<u8> {
        tls_hello(0x02, session_id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_tls_hello_detection() {
        let chello = client_hello("example.com");
        assert!(is_tls_chello(&chello));
        assert!(!is_tls_shello(&chello));

        let shello = server_hello(&[0x11; 32]);
        assert!(is_tls_shello(&shello));
        assert!(!is_tls_chello(&shello));

        assert!(!is_tls_chello(b"GET / HTTP/1.1\r\n"));
        assert!(!is_tls_chello(&[0x16, 0x03]));
    }

    #[test]
    fn test_session_id_mismatch() {
        let chello = client_hello("example.com");
        assert!(!neq_tls_sid(&chello, &server_hello(&[0x11; 32])));
        assert!(neq_tls_sid(&chello, &server_hello(&[0x22; 32])));
        // No session id in the reply: nothing to compare.
        assert!(!neq_tls_sid(&chello, &server_hello(&[])));
    }

    #[test]
    fn test_parse_sni() {
        let chello = client_hello("cdn.video.example.com");
        assert_eq!(parse_sni(&chello), Some("cdn.video.example.com"));
        assert_eq!(parse_sni(&tls_hello(0x01, &[0x11; 32], None)), None);
        // Truncated record must not panic or misparse.
        assert_eq!(parse_sni(&chello[..40]), None);
    }

    #[test]
    fn test_http_detection_and_host() {
        let req = b"GET /index.html HTTP/1.1\r\nHost:  example.com \r\n\r\n";
        assert!(is_http(req));
        assert_eq!(parse_http_host(req), Some("example.com"));

        assert!(is_http(b"CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(!is_http(b"\x16\x03\x01"));
        assert!(!is_http(b"GETX / HTTP/1.1\r\n"));

        // "Ghost:" must not satisfy the Host scan.
        let tricky = b"GET / HTTP/1.1\r\nGhost: nope\r\nHost: real.com\r\n\r\n";
        assert_eq!(parse_http_host(tricky), Some("real.com"));
    }

    #[test]
    fn test_host_match_suffix_walk() {
        let hosts: HashSet<String> = ["example.com".to_string()].into_iter().collect();
        assert!(host_match(&hosts, &client_hello("example.com")));
        assert!(host_match(&hosts, &client_hello("cdn.video.example.com")));
        assert!(!host_match(&hosts, &client_hello("example.org")));
        assert!(!host_match(&hosts, &client_hello("badexample.com")));

        let empty = HashSet::new();
        assert!(!host_match(&empty, &client_hello("example.com")));

        let req = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
        assert!(host_match(&hosts, req));
    }

    #[test]
    fn test_http_redirect() {
        let req = &b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..];

        let blocked = b"HTTP/1.1 302 Found\r\nLocation: http://blockpage.isp.net/warn\r\n\r\n";
        assert!(is_http_redirect(req, blocked));

        let same = b"HTTP/1.1 301 Moved Permanently\r\nLocation: https://www.example.com/\r\n\r\n";
        assert!(!is_http_redirect(req, same));

        let relative = b"HTTP/1.1 302 Found\r\nLocation: /login\r\n\r\n";
        assert!(!is_http_redirect(req, relative));

        let ok = b"HTTP/1.1 200 OK\r\n\r\n";
        assert!(!is_http_redirect(req, ok));
    }
}
