//! `Content-Type: multipart/form-data; boundary=...` handling

use nimbus_core::{NimbusError, NimbusResult};

use crate::headers::parse_params;

/// Longest boundary permitted by RFC 2046.
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Extract the boundary from a request's `Content-Type` header value.
///
/// The media type must be `multipart/form-data`; the boundary may be quoted.
pub fn boundary_from_content_type(content_type: &str) -> NimbusResult<String> {
    let (media_type, params) = match content_type.split_once(';') {
        Some((media, rest)) => (media, rest),
        None => (content_type, ""),
    };

    if !media_type.trim().eq_ignore_ascii_case("multipart/form-data") {
        return Err(NimbusError::Malformed(format!(
            "expected multipart/form-data, got {:?}",
            media_type.trim()
        )));
    }

    let boundary = parse_params(params)
        .into_iter()
        .find(|(name, _)| name == "boundary")
        .map(|(_, value)| value)
        .ok_or_else(|| NimbusError::Malformed("missing multipart boundary".into()))?;

    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(NimbusError::Malformed(format!(
            "boundary must be 1-{MAX_BOUNDARY_LEN} characters, got {}",
            boundary.len()
        )));
    }
    Ok(boundary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_boundary() {
        let b = boundary_from_content_type("multipart/form-data; boundary=----abc123").unwrap();
        assert_eq!(b, "----abc123");
    }

    #[test]
    fn quoted_boundary_and_case() {
        let b = boundary_from_content_type(
            "Multipart/Form-Data; charset=utf-8; BOUNDARY=\"with space;semi\"",
        )
        .unwrap();
        assert_eq!(b, "with space;semi");
    }

    #[test]
    fn missing_boundary_is_malformed() {
        let err = boundary_from_content_type("multipart/form-data").unwrap_err();
        assert!(matches!(err, NimbusError::Malformed(_)));
        let err = boundary_from_content_type("multipart/form-data; charset=utf-8").unwrap_err();
        assert!(matches!(err, NimbusError::Malformed(_)));
    }

    #[test]
    fn wrong_media_type_is_malformed() {
        let err = boundary_from_content_type("application/json; boundary=x").unwrap_err();
        assert!(matches!(err, NimbusError::Malformed(_)));
    }

    #[test]
    fn boundary_length_limits() {
        assert!(boundary_from_content_type("multipart/form-data; boundary=\"\"").is_err());
        let long = "b".repeat(71);
        assert!(
            boundary_from_content_type(&format!("multipart/form-data; boundary={long}")).is_err()
        );
        let max = "b".repeat(70);
        assert!(
            boundary_from_content_type(&format!("multipart/form-data; boundary={max}")).is_ok()
        );
    }
}
