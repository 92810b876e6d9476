//! Part header block parsing
//!
//! Only `Content-Disposition` and `Content-Type` matter to the parser; other
//! headers are accepted and ignored. Header names are case-insensitive.

use nimbus_core::{NimbusError, NimbusResult};

/// The parsed header block of one multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeaders {
    /// Form field name from `Content-Disposition: form-data; name=...`
    pub name: String,
    /// Final path component of the submitted filename, if any.
    ///
    /// `Some("")` is an empty file input and produces no file.
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl PartHeaders {
    /// A part is a file part iff its disposition carries a filename.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Parse a header block (without the terminating blank line).
pub fn parse_part_headers(block: &[u8]) -> NimbusResult<PartHeaders> {
    let text = std::str::from_utf8(block)
        .map_err(|_| NimbusError::Malformed("part headers are not valid UTF-8".into()))?;

    let mut disposition = None;
    let mut content_type = None;

    for line in text.split("\r\n").filter(|l| !l.trim().is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| NimbusError::Malformed(format!("invalid header line: {line:?}")))?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("content-disposition") {
            disposition = Some(value.trim());
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        }
    }

    let disposition = disposition
        .ok_or_else(|| NimbusError::Malformed("part is missing Content-Disposition".into()))?;
    let (kind, params) = disposition.split_once(';').unwrap_or((disposition, ""));
    if !kind.trim().eq_ignore_ascii_case("form-data") {
        return Err(NimbusError::Malformed(format!(
            "unsupported disposition type {:?}",
            kind.trim()
        )));
    }

    let mut name = None;
    let mut filename = None;
    let mut filename_ext = None;
    for (key, value) in parse_params(params) {
        match key.as_str() {
            "name" => name = Some(value),
            "filename" => filename = Some(value),
            "filename*" => filename_ext = decode_ext_value(&value),
            _ => {}
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| NimbusError::Malformed("part is missing a field name".into()))?;
    let filename = filename_ext.or(filename).map(|f| basename(&f).to_string());

    Ok(PartHeaders {
        name,
        filename,
        content_type,
    })
}

/// Split `; key=value; key="quoted"` parameters. Keys are lowercased.
///
/// Inside quotes a backslash escapes only `"` and `\`, so Windows paths
/// sent by older browsers survive intact.
pub(crate) fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ';' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            key.push(c);
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' if matches!(chars.peek(), Some('"') | Some('\\')) => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        _ => value.push(c),
                    }
                }
                while matches!(chars.peek(), Some(c) if *c != ';') {
                    chars.next();
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
        }

        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() {
            params.push((key, value));
        }
    }
    params
}

/// Decode an RFC 5987 extended value: `charset'language'percent-encoded`.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;

    let bytes = percent_decode(encoded);
    if charset.eq_ignore_ascii_case("utf-8") {
        String::from_utf8(bytes).ok()
    } else {
        // Only ASCII is decoded faithfully for other charsets
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let decoded = bytes
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Final path component; clients may send full or relative paths.
fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
