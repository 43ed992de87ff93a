//! Charset resolution with deterministic fallbacks
//!
//! Order: declared charset, UTF-8, regional multi-byte encodings
//! (EUC-KR, Shift_JIS, GBK), then windows-1252. The last step maps every
//! byte, so decoding never fails.

use encoding_rs::{EUC_KR, Encoding, GBK, SHIFT_JIS, WINDOWS_1252};

/// Legacy labels seen in the wild that the WHATWG registry lacks
const ALIASES: &[(&str, &str)] = &[
    ("ks_c_5601-1987", "euc-kr"),
    ("ks_c_5601", "euc-kr"),
    ("cp949", "euc-kr"),
    ("ms949", "euc-kr"),
    ("cp932", "shift_jis"),
    ("cp936", "gbk"),
    ("unknown-8bit", "windows-1252"),
    ("x-unknown", "windows-1252"),
];

const REGIONAL_FALLBACKS: [&Encoding; 3] = [EUC_KR, SHIFT_JIS, GBK];

/// Resolve a charset label, honouring legacy aliases
///
/// ASCII labels resolve to nothing: mislabelled 8-bit text is common and
/// the fallback chain handles it better than windows-1252 would.
pub fn lookup(label: &str) -> Option<&'static Encoding> {
    let label = label.trim().trim_matches('"').to_ascii_lowercase();
    if label.is_empty() || label == "us-ascii" || label == "ascii" {
        return None;
    }
    let label = ALIASES
        .iter()
        .find(|(alias, _)| *alias == label)
        .map(|(_, target)| *target)
        .unwrap_or(label.as_str());
    Encoding::for_label(label.as_bytes())
}

/// Decode bytes to text, never failing
pub fn decode(bytes: &[u8], declared: Option<&str>) -> String {
    if bytes.is_ascii() {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    if let Some(encoding) = declared.and_then(lookup)
        && let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes)
    {
        return text.into_owned();
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    for encoding in REGIONAL_FALLBACKS {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return text.into_owned();
        }
    }

    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_charset_wins() {
        let (bytes, _, _) = EUC_KR.encode("안녕하세요");
        assert_eq!(decode(&bytes, Some("ks_c_5601-1987")), "안녕하세요");
        assert_eq!(decode(&bytes, Some("EUC-KR")), "안녕하세요");
    }

    #[test]
    fn test_wrong_declaration_falls_back_to_utf8() {
        // Invalid as EUC-KR, valid as UTF-8
        assert_eq!(decode("naïve ✓".as_bytes(), Some("euc-kr")), "naïve ✓");
    }

    #[test]
    fn test_undeclared_regional_fallback() {
        let (bytes, _, _) = EUC_KR.encode("한국어");
        assert_eq!(decode(&bytes, None), "한국어");
    }

    #[test]
    fn test_final_fallback_preserves_bytes() {
        // Lone high bytes are rejected by the multi-byte decoders
        assert_eq!(decode(b"caf\xe9", None), "café");
        assert_eq!(decode(b"caf\xe9", Some("no-such-charset")), "café");
    }

    #[test]
    fn test_ascii_label_is_ignored() {
        assert_eq!(decode("é".as_bytes(), Some("us-ascii")), "é");
        assert!(lookup("US-ASCII").is_none());
        assert_eq!(lookup("cp949"), Some(EUC_KR));
    }
}
