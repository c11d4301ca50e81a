//! RFC 2397 `data:` URL parsing for inline images.
//!
//! OpenAI's `image_url.url` field accepts both `data:` URLs (the common case
//! for vision requests) and plain `http(s)://` URLs. Anthropic only accepts
//! base64-encoded bytes with an explicit media type. The schema mapper needs
//! to go both ways, so this module handles the `data:` scheme grammar:
//! `data:[<media>][;base64],<data>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// A decoded `data:` URL: its media type and base64-encoded payload.
pub struct DataUrl {
    pub media_type: String,
    pub base64_data: String,
}

const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Parses a `data:` URL per RFC 2397. Returns `None` for non-`data:` URLs.
///
/// When the `;base64` tag is absent, the payload is treated as
/// percent-encoded bytes and re-encoded as base64 so callers always get a
/// uniform representation. When the media type is absent, it defaults to
/// `application/octet-stream`. Malformed base64 in an explicit `;base64`
/// payload is rejected (returns `None`) rather than passed through, so
/// callers can drop the image part instead of failing the request.
pub fn parse(url: &str) -> Option<DataUrl> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;

    let (media_type, is_base64) = match header.strip_suffix(";base64") {
        Some(media) => (media, true),
        None => (header, false),
    };

    let media_type = if media_type.is_empty() {
        DEFAULT_MEDIA_TYPE.to_string()
    } else {
        media_type.to_string()
    };

    let base64_data = if is_base64 {
        BASE64.decode(data).ok()?;
        data.to_string()
    } else {
        let decoded = percent_decode(data);
        BASE64.encode(decoded)
    };

    Some(DataUrl { media_type, base64_data })
}

/// Builds a `data:<media-type>;base64,<data>` URL from parts.
pub fn build(media_type: &str, base64_data: &str) -> String {
    format!("data:{media_type};base64,{base64_data}")
}

/// Decodes `%XX` escapes. Bytes that fail to parse as hex are passed through
/// literally rather than rejected, matching the leniency of most `data:` URL
/// producers.
fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_data_url() {
        let parsed = parse("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(parsed.media_type, "image/png");
        assert_eq!(parsed.base64_data, "iVBORw0KGgo=");
    }

    #[test]
    fn rejects_plain_url() {
        assert!(parse("https://example.com/cat.png").is_none());
    }

    #[test]
    fn rejects_invalid_base64_payload() {
        assert!(parse("data:image/png;base64,not-valid-base64!!").is_none());
    }

    #[test]
    fn percent_decodes_non_base64_payload() {
        let parsed = parse("data:text/plain,hello%20world").unwrap();
        assert_eq!(parsed.media_type, "text/plain");
        assert_eq!(BASE64.decode(&parsed.base64_data).unwrap(), b"hello world");
    }

    #[test]
    fn defaults_missing_media_type() {
        let parsed = parse("data:;base64,aGVsbG8=").unwrap();
        assert_eq!(parsed.media_type, DEFAULT_MEDIA_TYPE);
    }

    #[test]
    fn defaults_missing_media_type_without_base64_tag() {
        let parsed = parse("data:,hello").unwrap();
        assert_eq!(parsed.media_type, DEFAULT_MEDIA_TYPE);
        assert_eq!(BASE64.decode(&parsed.base64_data).unwrap(), b"hello");
    }

    #[test]
    fn roundtrips() {
        let url = build("image/jpeg", "abcd");
        let parsed = parse(&url).unwrap();
        assert_eq!(parsed.media_type, "image/jpeg");
        assert_eq!(parsed.base64_data, "abcd");
    }
}
