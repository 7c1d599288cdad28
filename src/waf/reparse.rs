//! Header re-parsing from wire bytes recovered out of proxy buffers.
//!
//! The serialized head handed over by the host proxy is not guaranteed
//! clean: line endings may mix `\r\n`, bare `\n` and stray `\r`, NUL
//! bytes may be embedded, and values may be folded across lines. The
//! reparser recovers a start-line and a name/value list ready for the
//! rules engine, flagging how much repair was needed.

use bytes::{Bytes, BytesMut};
use memchr::{memchr, memmem};

use crate::core::{WafError, WafResult};
use crate::engine::HeaderField;

/// Line-termination discipline for a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineMode {
    /// Strict `\r\n` only.
    Strict,
    /// `\n`, with an optional preceding `\r`. Stray `\r` inside the
    /// line is stripped.
    Lf,
    /// Any of `\r\n`, `\n`, or a lone `\r`.
    Any,
}

/// Which head is being recovered; decides start-line handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadKind {
    Request,
    Response,
}

/// A recovered head: start-line, fields, and repair indicators.
#[derive(Debug)]
pub struct ParsedHead {
    pub start_line: Bytes,
    pub fields: Vec<HeaderField>,
    /// A body is announced via positive `Content-Length` or chunked
    /// `Transfer-Encoding`.
    pub announces_body: bool,
    /// Set when termination had to be downgraded from `\r\n`.
    pub downgraded: bool,
}

struct Line<'a> {
    content: &'a [u8],
    next: usize,
    downgraded: bool,
}

fn next_line(buf: &[u8], pos: usize, mode: LineMode) -> Option<Line<'_>> {
    if pos >= buf.len() {
        return None;
    }
    let rest = &buf[pos..];
    match mode {
        LineMode::Strict => {
            let at = memmem::find(rest, b"\r\n")?;
            Some(Line {
                content: &rest[..at],
                next: pos + at + 2,
                downgraded: false,
            })
        }
        LineMode::Lf => match memchr(b'\n', rest) {
            Some(at) => {
                let (content, downgraded) = if at > 0 && rest[at - 1] == b'\r' {
                    (&rest[..at - 1], false)
                } else {
                    (&rest[..at], true)
                };
                Some(Line {
                    content,
                    next: pos + at + 1,
                    downgraded,
                })
            }
            // Unterminated tail still yields a line, downgraded.
            None => Some(Line {
                content: rest,
                next: buf.len(),
                downgraded: true,
            }),
        },
        LineMode::Any => {
            let at = rest.iter().position(|&b| b == b'\r' || b == b'\n')?;
            let mut next = pos + at + 1;
            let mut downgraded = rest[at] != b'\r';
            if rest[at] == b'\r' {
                if rest.get(at + 1) == Some(&b'\n') {
                    next += 1;
                } else {
                    downgraded = true;
                }
            }
            Some(Line {
                content: &rest[..at],
                next,
                downgraded,
            })
        }
    }
}

/// Strips embedded NULs, shifting the remainder left.
fn elide_nuls(block: &[u8]) -> (Vec<u8>, bool) {
    if memchr(0, block).is_none() {
        return (block.to_vec(), false);
    }
    let cleaned: Vec<u8> = block.iter().copied().filter(|&b| b != 0).collect();
    log::debug!("Elided {} NUL byte(s) from header block", block.len() - cleaned.len());
    (cleaned, true)
}

/// Strips stray `\r` from recovered line content.
fn strip_stray_cr(content: &[u8], downgraded: &mut bool) -> Vec<u8> {
    if memchr(b'\r', content).is_none() {
        return content.to_vec();
    }
    *downgraded = true;
    content.iter().copied().filter(|&b| b != b'\r').collect()
}

fn trim_leading_ws(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    &value[start..]
}

fn trim_trailing_ws(value: &[u8]) -> &[u8] {
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(0, |i| i + 1);
    &value[..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn announces_body(fields: &[HeaderField]) -> bool {
    for field in fields {
        if eq_ignore_case(&field.name, b"content-length") {
            if let Ok(text) = std::str::from_utf8(&field.value) {
                if let Ok(n) = text.trim().parse::<u64>() {
                    if n > 0 {
                        return true;
                    }
                }
            }
        } else if eq_ignore_case(&field.name, b"transfer-encoding") {
            let value = field.value.to_ascii_lowercase();
            if memmem::find(&value, b"chunked").is_some() {
                return true;
            }
        }
    }
    false
}

/// Recovers the start-line and header list from a serialized head.
///
/// The block is known to be `\n`-terminated by the host, so both the
/// start-line and the headers are scanned in [`LineMode::Lf`].
pub fn parse_head(block: &[u8], kind: HeadKind) -> WafResult<ParsedHead> {
    let (cleaned, _had_nuls) = elide_nuls(block);
    let mut downgraded = false;
    let mut pos = 0usize;

    let start = next_line(&cleaned, pos, LineMode::Lf)
        .ok_or_else(|| WafError::Malformed("empty header block".to_string()))?;
    downgraded |= start.downgraded;
    pos = start.next;
    let start_line = strip_stray_cr(start.content, &mut downgraded);
    if start_line.is_empty() {
        return Err(WafError::Malformed(format!(
            "missing {} start-line",
            match kind {
                HeadKind::Request => "request",
                HeadKind::Response => "status",
            }
        )));
    }

    let mut fields: Vec<HeaderField> = Vec::new();
    while let Some(line) = next_line(&cleaned, pos, LineMode::Lf) {
        downgraded |= line.downgraded;
        pos = line.next;
        let content = strip_stray_cr(line.content, &mut downgraded);
        if content.is_empty() {
            break;
        }

        // Folded continuation: horizontal whitespace continues the
        // previous value.
        if content[0] == b' ' || content[0] == b'\t' {
            if let Some(last) = fields.last_mut() {
                let mut merged = BytesMut::from(&last.value[..]);
                let cont = trim_trailing_ws(trim_leading_ws(&content));
                if !cont.is_empty() {
                    if !merged.is_empty() {
                        merged.extend_from_slice(b" ");
                    }
                    merged.extend_from_slice(cont);
                }
                last.value = merged.freeze();
            } else {
                log::debug!("Dropping continuation line with no preceding header");
            }
            continue;
        }

        match memchr(b':', &content) {
            Some(colon) => {
                let name = trim_trailing_ws(&content[..colon]);
                let value = trim_leading_ws(&content[colon + 1..]);
                fields.push(HeaderField::new(name.to_vec(), value.to_vec()));
            }
            None => {
                log::debug!(
                    "Dropping header line with no separator: {:?}",
                    String::from_utf8_lossy(&content)
                );
            }
        }
    }

    let announces_body = announces_body(&fields);
    Ok(ParsedHead {
        start_line: Bytes::from(start_line),
        fields,
        announces_body,
        downgraded,
    })
}

const SCHEME_PREFIXES: &[(&[u8], usize)] = &[(b"http:///", 7), (b"https:///", 8)];

/// Repairs the `http:///` / `https:///` artifact in a request line.
///
/// When the start-line carries the empty-host form and the proxy's URL
/// accessor reports a URL with the same prefix, the scheme and empty
/// host are deleted at the URL's position, leaving the path. The URL
/// length decides where the HTTP-version suffix begins; if the line is
/// too short to hold it the accounting disagrees and the transaction
/// must fail with a 400.
///
/// A start-line without the artifact is returned verbatim.
pub fn normalize_request_line(line: &[u8], url: &[u8]) -> WafResult<Bytes> {
    for &(prefix, scheme_len) in SCHEME_PREFIXES {
        let Some(at) = memmem::find(line, prefix) else {
            continue;
        };
        if !url.starts_with(prefix) {
            continue;
        }

        let suffix_at = at + url.len();
        if suffix_at > line.len() || (suffix_at < line.len() && line[suffix_at] != b' ') {
            return Err(WafError::Malformed(format!(
                "request-line fixup mismatch: URL length {} does not fit the start-line",
                url.len()
            )));
        }

        let mut fixed = BytesMut::with_capacity(line.len());
        fixed.extend_from_slice(&line[..at]);
        fixed.extend_from_slice(&url[scheme_len..]);
        fixed.extend_from_slice(&line[suffix_at..]);
        log::debug!(
            "Normalized request line: {:?}",
            String::from_utf8_lossy(&fixed)
        );
        return Ok(fixed.freeze());
    }
    Ok(Bytes::copy_from_slice(line))
}

/// Serializes a head back to a CRLF-separated block.
pub fn render_block(start_line: &[u8], fields: &[HeaderField]) -> Bytes {
    let mut out = BytesMut::with_capacity(
        start_line.len() + 4 + fields.iter().map(|f| f.name.len() + f.value.len() + 4).sum::<usize>(),
    );
    out.extend_from_slice(start_line);
    out.extend_from_slice(b"\r\n");
    for field in fields {
        out.extend_from_slice(&field.name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(&field.value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.freeze()
}
