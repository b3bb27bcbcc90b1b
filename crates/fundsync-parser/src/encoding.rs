//! Charset detection and strict decoding of raw export bytes.

use encoding_rs::{DecoderResult, Encoding, UTF_8};

use crate::ParseError;

/// Best-guess charset for a payload plus the detector's confidence (0..=1).
#[derive(Debug, Clone, Copy)]
pub struct DetectedEncoding {
    pub encoding: &'static Encoding,
    pub confidence: f32,
}

impl DetectedEncoding {
    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }
}

pub fn lookup_encoding(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// A BOM or well-formed UTF-8 is certain; anything else goes through the
/// statistical detector.
pub fn detect_encoding(bytes: &[u8]) -> DetectedEncoding {
    if let Some((encoding, _bom_len)) = Encoding::for_bom(bytes) {
        return DetectedEncoding {
            encoding,
            confidence: 1.0,
        };
    }
    if std::str::from_utf8(bytes).is_ok() {
        return DetectedEncoding {
            encoding: UTF_8,
            confidence: 1.0,
        };
    }

    let (charset, confidence, _language) = chardet::detect(bytes);
    match lookup_encoding(chardet::charset2encoding(&charset)).or_else(|| lookup_encoding(&charset)) {
        Some(encoding) => DetectedEncoding {
            encoding,
            confidence,
        },
        None => DetectedEncoding {
            encoding: UTF_8,
            confidence: 0.0,
        },
    }
}

/// Decodes without replacement characters; the first malformed sequence is
/// reported as a half-open byte range into `bytes`.
pub fn decode_strict(bytes: &[u8], encoding: &'static Encoding) -> Result<String, ParseError> {
    let mut decoder = encoding.new_decoder_with_bom_removal();
    let capacity = decoder
        .max_utf8_buffer_length_without_replacement(bytes.len())
        .unwrap_or(bytes.len());
    let mut out = String::with_capacity(capacity);
    let mut total_read = 0usize;

    loop {
        let (result, read) =
            decoder.decode_to_string_without_replacement(&bytes[total_read..], &mut out, true);
        total_read += read;
        match result {
            DecoderResult::InputEmpty => return Ok(out),
            DecoderResult::OutputFull => {
                let remaining = bytes.len() - total_read;
                out.reserve(remaining.saturating_mul(3).max(16));
            }
            DecoderResult::Malformed(bad_len, consumed_after) => {
                let end = total_read.saturating_sub(consumed_after as usize);
                let start = end.saturating_sub(bad_len as usize);
                return Err(ParseError::Decode {
                    encoding: encoding.name(),
                    start,
                    end,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_16LE, WINDOWS_1252};

    #[test]
    fn valid_utf8_is_certain() {
        let detected = detect_encoding("trade_date,stock\n2025-12-09,Société\n".as_bytes());
        assert_eq!(detected.encoding, UTF_8);
        assert_eq!(detected.confidence, 1.0);
    }

    #[test]
    fn bom_wins_over_detection() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "a,b".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let detected = detect_encoding(&bytes);
        assert_eq!(detected.encoding, UTF_16LE);
        assert_eq!(decode_strict(&bytes, detected.encoding).unwrap(), "a,b");
    }

    #[test]
    fn utf8_bom_is_removed() {
        let bytes = b"\xEF\xBB\xBFtrade_date";
        assert_eq!(decode_strict(bytes, UTF_8).unwrap(), "trade_date");
    }

    #[test]
    fn malformed_utf8_names_byte_range() {
        let bytes = b"abc\xFFdef";
        match decode_strict(bytes, UTF_8) {
            Err(ParseError::Decode { encoding, start, end }) => {
                assert_eq!(encoding, "UTF-8");
                assert_eq!((start, end), (3, 4));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn single_byte_charsets_decode_legacy_exports() {
        let bytes = b"Soci\xE9t\xE9";
        assert_eq!(decode_strict(bytes, WINDOWS_1252).unwrap(), "Société");
    }

    #[test]
    fn labels_resolve_case_insensitively() {
        assert_eq!(lookup_encoding(" Windows-1252 "), Some(WINDOWS_1252));
        assert_eq!(lookup_encoding("utf8"), Some(UTF_8));
        assert!(lookup_encoding("not-a-charset").is_none());
    }
}
