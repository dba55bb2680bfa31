use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use crate::error::{ImportError, ImportResult};
use crate::value::Value;

/// Converts legacy text into UTF-8, optionally decoding HTML entities the source stored escaped.
#[derive(Debug, Clone, Copy)]
pub struct TextConverter {
    encoding: &'static Encoding,
    convert_html: bool,
}

impl Default for TextConverter {
    fn default() -> Self {
        Self::utf8()
    }
}

impl TextConverter {
    #[must_use]
    pub fn utf8() -> Self {
        Self { encoding: UTF_8, convert_html: false }
    }

    /// Resolves a source charset label. An empty label means the source is already UTF-8.
    ///
    /// ISO-8859-1 is decoded as Windows-1252, which is what legacy forums actually stored
    /// under that label.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when the label names no known encoding.
    pub fn for_label(label: &str, convert_html: bool) -> ImportResult<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        let encoding = match normalized.as_str() {
            "" | "utf8" | "utf-8" => UTF_8,
            "iso-8859-1" | "iso8859-1" | "latin1" => WINDOWS_1252,
            other => Encoding::for_label(other.as_bytes()).ok_or_else(|| {
                ImportError::Configuration(format!("unknown source charset `{label}`"))
            })?,
        };
        Ok(Self { encoding, convert_html })
    }

    #[must_use]
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    #[must_use]
    pub fn convert_bytes(&self, bytes: &[u8]) -> String {
        let (decoded, _, _) = self.encoding.decode(bytes);
        self.finish(decoded.into_owned())
    }

    #[must_use]
    pub fn convert_str(&self, text: &str) -> String {
        self.finish(text.to_string())
    }

    /// Converts text-bearing values; everything else passes through untouched.
    #[must_use]
    pub fn convert(&self, value: Value) -> Value {
        match value {
            Value::Text(text) => Value::Text(self.convert_str(&text)),
            Value::Bytes(bytes) => Value::Text(self.convert_bytes(&bytes)),
            other => other,
        }
    }

    fn finish(&self, text: String) -> String {
        if self.convert_html && text.contains('&') {
            decode_html_entities(&text)
        } else {
            text
        }
    }
}

/// Decodes named and numeric HTML entities. Unknown or malformed entities are kept verbatim.
#[must_use]
pub fn decode_html_entities(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        output.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate
            .find(';')
            .filter(|end| *end <= 12)
            .and_then(|end| decode_entity(&candidate[1..end]).map(|ch| (ch, end)));

        match decoded {
            Some((ch, end)) => {
                output.push(ch);
                rest = &candidate[end + 1..];
            }
            None => {
                output.push('&');
                rest = &candidate[1..];
            }
        }
    }

    output.push_str(rest);
    output
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(numeric) = name.strip_prefix('#') {
        let code = match numeric.strip_prefix('x').or_else(|| numeric.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => numeric.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }

    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        "copy" => Some('\u{a9}'),
        "reg" => Some('\u{ae}'),
        "hellip" => Some('\u{2026}'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_label_decodes_as_windows_1252() {
        let converter = TextConverter::for_label("ISO-8859-1", false)
            .unwrap_or_else(|err| panic!("latin1 should resolve: {err}"));
        assert_eq!(converter.encoding_name(), "windows-1252");
        assert_eq!(converter.convert_bytes(&[0x63, 0x61, 0x66, 0xe9, 0x80]), "café€");
    }

    #[test]
    fn unknown_charset_is_a_configuration_error() {
        assert!(matches!(
            TextConverter::for_label("klingon-8", false),
            Err(ImportError::Configuration(_))
        ));
    }

    #[test]
    fn html_entities_decode_only_when_enabled() {
        let plain = TextConverter::utf8();
        let html = TextConverter::for_label("utf-8", true)
            .unwrap_or_else(|err| panic!("utf-8 should resolve: {err}"));
        assert_eq!(plain.convert_str("Tom &amp; Jerry"), "Tom &amp; Jerry");
        assert_eq!(html.convert_str("Tom &amp; Jerry &#33; &#x41;"), "Tom & Jerry ! A");
    }

    #[test]
    fn malformed_entities_are_left_alone() {
        assert_eq!(decode_html_entities("a & b &bogus; &#zz;"), "a & b &bogus; &#zz;");
    }

    #[test]
    fn non_text_values_pass_through() {
        let converter = TextConverter::utf8();
        assert_eq!(converter.convert(Value::Int(3)), Value::Int(3));
        assert_eq!(converter.convert(Value::Bytes(b"hi".to_vec())), Value::from("hi"));
    }
}
