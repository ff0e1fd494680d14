//! CBOR encoding: one pass over the value tree into a byte buffer.

use super::{
    MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NEGATIVE, MAJOR_SIMPLE, MAJOR_TAG, MAJOR_TEXT,
    MAJOR_UNSIGNED, TAG_BIGNUM, TAG_NEG_BIGNUM, Value,
};

const FLOAT_MARKER: u8 = 0xfa;
const DOUBLE_MARKER: u8 = 0xfb;

/// Encode a single value to RFC 8949 bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    encode_value(&mut buf, value);
    buf
}

/// Incremental encoder. Items are appended back to back, so a sequence of
/// `push` calls produces a CBOR sequence.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    pub fn push(&mut self, value: &Value) -> &mut Self {
        encode_value(&mut self.buf, value);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Write a major type head with the narrowest argument width.
#[inline]
fn write_head(buf: &mut Vec<u8>, major: u8, value: u64) {
    let major = major << 5;
    match value {
        0..=23 => buf.push(major | value as u8),
        24..=0xff => {
            buf.push(major | 24);
            buf.push(value as u8);
        }
        0x100..=0xffff => {
            buf.push(major | 25);
            buf.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(major | 26);
            buf.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            buf.push(major | 27);
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }
}

#[inline]
fn write_f32(buf: &mut Vec<u8>, value: f32) {
    buf.push(FLOAT_MARKER);
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Emit four bytes when the value survives an exact round trip through
/// f32, eight otherwise. NaN always narrows.
#[inline]
fn write_auto_float(buf: &mut Vec<u8>, value: f64) {
    if value.is_nan() {
        write_f32(buf, value as f32);
        return;
    }
    let single = value as f32;
    if f64::from(single) == value {
        write_f32(buf, single);
    } else {
        buf.push(DOUBLE_MARKER);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Uint(v) => write_head(buf, MAJOR_UNSIGNED, *v),
        Value::NegInt(n) => write_head(buf, MAJOR_NEGATIVE, *n),
        Value::Bignum {
            negative,
            magnitude,
        } => {
            let tag = if *negative { TAG_NEG_BIGNUM } else { TAG_BIGNUM };
            write_head(buf, MAJOR_TAG, tag);
            write_head(buf, MAJOR_BYTES, magnitude.len() as u64);
            buf.extend_from_slice(magnitude);
        }
        Value::F32(v) => write_f32(buf, *v),
        Value::F64(v) => write_auto_float(buf, *v),
        Value::Text(s) => {
            write_head(buf, MAJOR_TEXT, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            write_head(buf, MAJOR_BYTES, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Array(items) => {
            write_head(buf, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(entries) => {
            write_head(buf, MAJOR_MAP, entries.len() as u64);
            for (key, val) in entries {
                encode_value(buf, key);
                encode_value(buf, val);
            }
        }
        Value::Tag(tag, inner) => {
            write_head(buf, MAJOR_TAG, *tag);
            encode_value(buf, inner);
        }
        Value::Bool(false) => write_head(buf, MAJOR_SIMPLE, 20),
        Value::Bool(true) => write_head(buf, MAJOR_SIMPLE, 21),
        Value::Null => write_head(buf, MAJOR_SIMPLE, 22),
        Value::Undefined => write_head(buf, MAJOR_SIMPLE, 23),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heads_use_minimal_width() {
        assert_eq!(encode(&Value::Uint(0)), [0x00]);
        assert_eq!(encode(&Value::Uint(23)), [0x17]);
        assert_eq!(encode(&Value::Uint(24)), [0x18, 0x18]);
        assert_eq!(encode(&Value::Uint(256)), [0x19, 0x01, 0x00]);
        assert_eq!(encode(&Value::Uint(65_536)), [0x1a, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(
            encode(&Value::Uint(u64::MAX)),
            [0x1b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn negative_integers_use_major_one() {
        // -1 encodes as NegInt(0).
        assert_eq!(encode(&Value::NegInt(0)), [0x20]);
        // -24
        assert_eq!(encode(&Value::NegInt(23)), [0x37]);
        // -25
        assert_eq!(encode(&Value::NegInt(24)), [0x38, 0x18]);
    }

    #[test]
    fn simple_values_match_rfc_examples() {
        assert_eq!(encode(&Value::Bool(false)), [0xf4]);
        assert_eq!(encode(&Value::Bool(true)), [0xf5]);
        assert_eq!(encode(&Value::Null), [0xf6]);
        assert_eq!(encode(&Value::Undefined), [0xf7]);
    }

    #[test]
    fn encoder_appends_a_sequence() {
        let mut enc = Encoder::new();
        enc.push(&Value::Uint(1)).push(&Value::Uint(2));
        assert_eq!(enc.bytes(), [0x01, 0x02]);
        assert_eq!(enc.into_bytes(), vec![0x01, 0x02]);
    }

    #[test]
    fn rfc_appendix_a_spot_checks() {
        assert_eq!(
            encode(&Value::Text("IETF".into())),
            [0x64, 0x49, 0x45, 0x54, 0x46]
        );
        assert_eq!(
            encode(&Value::Array(vec![
                Value::Uint(1),
                Value::Uint(2),
                Value::Uint(3)
            ])),
            [0x83, 0x01, 0x02, 0x03]
        );
        // 1.0e+300 needs the full double width.
        assert_eq!(
            encode(&Value::F64(1.0e300)),
            [0xfb, 0x7e, 0x37, 0xe4, 0x3c, 0x88, 0x00, 0x75, 0x9c]
        );
    }
}
