//! DER encoder for entitlements.
//!
//! Converts the entitlements plist dictionary to the ASN.1 DER form stored
//! in the `0xfade7172` blob (special slot -6). Dictionaries become a SET of
//! SEQUENCE { key, value } pairs; values are encoded per type:
//!
//! - 0x01 BOOLEAN
//! - 0x02 INTEGER
//! - 0x04 OCTET STRING (plist data)
//! - 0x0c UTF8String
//! - 0x30 SEQUENCE (arrays, key/value pairs)
//! - 0x31 SET (dictionaries)

use plist::Value;

const DER_TAG_BOOLEAN: u8 = 0x01;
const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_OCTET_STRING: u8 = 0x04;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;
const DER_TAG_SET: u8 = 0x31;

/// DER length: short form below 128, long form otherwise.
fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        let bytes_needed = ((64 - (length as u64).leading_zeros() as usize) + 7) / 8;
        output.push(0x80 | bytes_needed as u8);
        for i in (0..bytes_needed).rev() {
            output.push(((length >> (i * 8)) & 0xff) as u8);
        }
    }
}

fn encode_utf8_string(output: &mut Vec<u8>, text: &str) {
    output.push(DER_TAG_UTF8STRING);
    encode_length(output, text.len());
    output.extend(text.as_bytes());
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut output = Vec::new();

    match value {
        Value::Boolean(b) => {
            output.push(DER_TAG_BOOLEAN);
            output.push(1);
            output.push(if *b { 1 } else { 0 });
        }
        Value::Integer(i) => {
            let val = i.as_signed().unwrap_or(0) as u64;
            output.push(DER_TAG_INTEGER);

            if val == 0 {
                output.push(1);
                output.push(0);
            } else {
                let significant_bits = 64 - val.leading_zeros() as usize;
                let mut bytes_needed = significant_bits.div_ceil(8);
                // A set MSB would read as negative; prepend a zero byte.
                let needs_sign_pad = (val >> (bytes_needed * 8 - 1)) & 1 == 1;
                if needs_sign_pad {
                    bytes_needed += 1;
                }

                encode_length(&mut output, bytes_needed);
                if needs_sign_pad {
                    output.push(0x00);
                    bytes_needed -= 1;
                }
                for i in (0..bytes_needed).rev() {
                    output.push(((val >> (i * 8)) & 0xff) as u8);
                }
            }
        }
        Value::String(s) => encode_utf8_string(&mut output, s),
        Value::Data(d) => {
            output.push(DER_TAG_OCTET_STRING);
            encode_length(&mut output, d.len());
            output.extend(d);
        }
        Value::Array(arr) => {
            let mut content = Vec::new();
            for item in arr {
                content.extend(encode_value(item));
            }
            output.push(DER_TAG_SEQUENCE);
            encode_length(&mut output, content.len());
            output.extend(content);
        }
        Value::Dictionary(dict) => {
            let mut set_content = Vec::new();
            for (key, val) in dict {
                let mut key_encoded = Vec::new();
                encode_utf8_string(&mut key_encoded, key);
                let val_encoded = encode_value(val);

                set_content.push(DER_TAG_SEQUENCE);
                encode_length(&mut set_content, key_encoded.len() + val_encoded.len());
                set_content.extend(key_encoded);
                set_content.extend(val_encoded);
            }
            output.push(DER_TAG_SET);
            encode_length(&mut output, set_content.len());
            output.extend(set_content);
        }
        // Dates and reals do not occur in entitlements.
        _ => {}
    }

    output
}

/// Encode entitlements plist bytes (XML or binary) as DER.
///
/// Returns `None` if the plist cannot be parsed or yields nothing encodable.
pub fn plist_to_der(plist_bytes: &[u8]) -> Option<Vec<u8>> {
    let value: Value = plist::from_bytes(plist_bytes).ok()?;
    let der = encode_value(&value);
    if der.is_empty() {
        None
    } else {
        Some(der)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_short_form() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 10);
        assert_eq!(buf, vec![10]);
    }

    #[test]
    fn length_long_form() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 256);
        assert_eq!(buf, vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn booleans() {
        assert_eq!(encode_value(&Value::Boolean(true)), vec![0x01, 0x01, 0x01]);
        assert_eq!(encode_value(&Value::Boolean(false)), vec![0x01, 0x01, 0x00]);
    }

    #[test]
    fn strings() {
        assert_eq!(
            encode_value(&Value::String("test".into())),
            vec![0x0c, 0x04, b't', b'e', b's', b't']
        );
    }

    #[test]
    fn integers_with_sign_padding() {
        assert_eq!(encode_value(&Value::Integer(42.into())), vec![0x02, 0x01, 0x2a]);
        // 128 and 255 need a leading zero to stay positive
        assert_eq!(
            encode_value(&Value::Integer(128.into())),
            vec![0x02, 0x02, 0x00, 0x80]
        );
        assert_eq!(
            encode_value(&Value::Integer(255.into())),
            vec![0x02, 0x02, 0x00, 0xff]
        );
        assert_eq!(
            encode_value(&Value::Integer(256.into())),
            vec![0x02, 0x02, 0x01, 0x00]
        );
    }

    #[test]
    fn data_as_octet_string() {
        let der = encode_value(&Value::Data(vec![0xde, 0xad]));
        assert_eq!(der, vec![0x04, 0x02, 0xde, 0xad]);
    }

    #[test]
    fn dictionary_as_set_of_pairs() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>get-task-allow</key>
    <true/>
</dict>
</plist>"#;

        let der = plist_to_der(xml).unwrap();
        assert_eq!(der[0], DER_TAG_SET);
        // SET > SEQUENCE > UTF8String key
        assert_eq!(der[2], DER_TAG_SEQUENCE);
        assert_eq!(der[4], DER_TAG_UTF8STRING);
    }

    #[test]
    fn empty_dict() {
        let xml = br#"<plist version="1.0"><dict/></plist>"#;
        assert_eq!(plist_to_der(xml).unwrap(), vec![0x31, 0x00]);
    }

    #[test]
    fn unparseable_plist_is_none() {
        assert!(plist_to_der(b"not a plist").is_none());
    }
}
