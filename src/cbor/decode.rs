//! CBOR decoding: exactly one complete item per call, trailing bytes
//! rejected.

use super::{BREAK, TAG_BIGNUM, TAG_NEG_BIGNUM, Value};
use crate::error::{CodecErrorKind, Error, Result};

/// Decode one complete item and require the input to be fully consumed.
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut decoder = Decoder::new(data);
    decoder.decode()
}

/// Cursor-based decoder over a borrowed buffer.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode one item; trailing bytes raise `ExtraBytes`.
    pub fn decode(&mut self) -> Result<Value> {
        let value = self.decode_value()?;
        if self.pos < self.data.len() {
            return Err(Error::codec(
                CodecErrorKind::ExtraBytes,
                format!("{} bytes remaining after decode", self.data.len() - self.pos),
            ));
        }
        Ok(value)
    }

    fn out_of_bytes(&self, wanted: usize) -> Error {
        Error::codec(
            CodecErrorKind::OutOfBytes,
            format!(
                "trying to read {wanted} bytes but buffer contains only {}",
                self.data.len().saturating_sub(self.pos)
            ),
        )
    }

    #[inline]
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.out_of_bytes(1))
    }

    #[inline]
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.out_of_bytes(n))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read the initial byte, returning `(major type, additional info)`.
    #[inline]
    fn read_info(&mut self) -> Result<(u8, u8)> {
        let b = self.take(1)?[0];
        Ok((b >> 5, b & 0x1f))
    }

    /// Resolve the argument for an additional-information value.
    #[inline]
    fn read_count(&mut self, ai: u8) -> Result<u64> {
        match ai {
            0..=23 => Ok(u64::from(ai)),
            24 => Ok(u64::from(self.take(1)?[0])),
            25 => {
                let b = self.take(2)?;
                Ok(u64::from(u16::from_be_bytes([b[0], b[1]])))
            }
            26 => {
                let b = self.take(4)?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            27 => {
                let b = self.take(8)?;
                Ok(u64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            _ => Err(Error::codec(
                CodecErrorKind::UnexpectedAdditionalInfo,
                format!("additional information {ai}"),
            )),
        }
    }

    fn read_length(&mut self, ai: u8) -> Result<usize> {
        let count = self.read_count(ai)?;
        usize::try_from(count).map_err(|_| {
            Error::codec(
                CodecErrorKind::OutOfBytes,
                format!("length {count} exceeds the address space"),
            )
        })
    }

    fn decode_value(&mut self) -> Result<Value> {
        let ib = self.peek()?;
        let major = ib >> 5;
        let ai = ib & 0x1f;

        // Fast paths: single-byte integers and short text dominate typed
        // trees, so dispatch them without the general head machinery.
        match major {
            0 if ai < 24 => {
                self.pos += 1;
                return Ok(Value::Uint(u64::from(ai)));
            }
            1 if ai < 24 => {
                self.pos += 1;
                return Ok(Value::NegInt(u64::from(ai)));
            }
            3 if ai < 24 => {
                let start = self.pos + 1;
                let end = start + ai as usize;
                if end <= self.data.len() {
                    self.pos = end;
                    return text_value(&self.data[start..end]);
                }
            }
            _ => {}
        }

        match major {
            0 => {
                let (_, ai) = self.read_info()?;
                Ok(Value::Uint(self.read_count(ai)?))
            }
            1 => {
                let (_, ai) = self.read_info()?;
                Ok(Value::NegInt(self.read_count(ai)?))
            }
            2 if ai == 31 => self.decode_indefinite_bytes(),
            2 => {
                let (_, ai) = self.read_info()?;
                let len = self.read_length(ai)?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            3 if ai == 31 => self.decode_indefinite_text(),
            3 => {
                let (_, ai) = self.read_info()?;
                let len = self.read_length(ai)?;
                text_value(self.take(len)?)
            }
            4 if ai == 31 => self.decode_indefinite_array(),
            4 => {
                let (_, ai) = self.read_info()?;
                let len = self.read_length(ai)?;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.decode_value()?);
                }
                Ok(Value::Array(items))
            }
            5 if ai == 31 => self.decode_indefinite_map(),
            5 => {
                let (_, ai) = self.read_info()?;
                let len = self.read_length(ai)?;
                let mut entries = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    let key = self.decode_value()?;
                    let val = self.decode_value()?;
                    entries.push((key, val));
                }
                Ok(Value::Map(entries))
            }
            6 => self.decode_tag(),
            7 => self.decode_simple(ai),
            _ => unreachable!("major type is three bits"),
        }
    }

    fn decode_simple(&mut self, ai: u8) -> Result<Value> {
        match ai {
            20 => {
                self.pos += 1;
                Ok(Value::Bool(false))
            }
            21 => {
                self.pos += 1;
                Ok(Value::Bool(true))
            }
            22 => {
                self.pos += 1;
                Ok(Value::Null)
            }
            23 => {
                self.pos += 1;
                Ok(Value::Undefined)
            }
            25 => {
                self.pos += 1;
                let b = self.take(2)?;
                Ok(Value::F64(half_to_f64(u16::from_be_bytes([b[0], b[1]]))))
            }
            26 => {
                self.pos += 1;
                let b = self.take(4)?;
                Ok(Value::F32(f32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            27 => {
                self.pos += 1;
                let b = self.take(8)?;
                Ok(Value::F64(f64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ])))
            }
            31 => Err(Error::codec(
                CodecErrorKind::UnexpectedBreak,
                "break stop code outside an indefinite-length item",
            )),
            28..=30 => Err(Error::codec(
                CodecErrorKind::UnexpectedAdditionalInfo,
                format!("additional information {ai}"),
            )),
            _ => {
                self.pos += 1;
                Err(Error::codec(
                    CodecErrorKind::UnknownType,
                    format!("unsupported simple value {ai}"),
                ))
            }
        }
    }

    fn decode_tag(&mut self) -> Result<Value> {
        let (_, ai) = self.read_info()?;
        let tag = self.read_count(ai)?;
        match tag {
            TAG_BIGNUM | TAG_NEG_BIGNUM => {
                let payload = self.decode_value()?;
                let Value::Bytes(magnitude) = payload else {
                    return Err(Error::codec(
                        CodecErrorKind::UnknownType,
                        format!("bignum payload must be a byte string, got {}", payload.type_name()),
                    ));
                };
                Ok(Value::Bignum {
                    negative: tag == TAG_NEG_BIGNUM,
                    magnitude,
                })
            }
            _ => Ok(Value::Tag(tag, Box::new(self.decode_value()?))),
        }
    }

    fn decode_indefinite_array(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.peek()? == BREAK {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.decode_value()?);
        }
    }

    fn decode_indefinite_map(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut entries = Vec::new();
        loop {
            if self.peek()? == BREAK {
                self.pos += 1;
                return Ok(Value::Map(entries));
            }
            let key = self.decode_value()?;
            let val = self.decode_value()?;
            entries.push((key, val));
        }
    }

    fn decode_indefinite_bytes(&mut self) -> Result<Value> {
        Ok(Value::Bytes(self.concat_segments(2)?))
    }

    fn decode_indefinite_text(&mut self) -> Result<Value> {
        let bytes = self.concat_segments(3)?;
        text_value(&bytes)
    }

    /// Concatenate the definite-length segments of an indefinite string.
    fn concat_segments(&mut self, expected_major: u8) -> Result<Vec<u8>> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            if self.peek()? == BREAK {
                self.pos += 1;
                return Ok(out);
            }
            let (major, ai) = self.read_info()?;
            if major != expected_major || ai == 31 {
                return Err(Error::codec(
                    CodecErrorKind::UnknownType,
                    "indefinite-length string segments must be definite strings of the same kind",
                ));
            }
            let len = self.read_length(ai)?;
            out.extend_from_slice(self.take(len)?);
        }
    }
}

fn text_value(bytes: &[u8]) -> Result<Value> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(Value::Text(s.to_string())),
        Err(_) => Err(Error::codec(
            CodecErrorKind::UnknownType,
            "text string is not valid UTF-8",
        )),
    }
}

/// Expand an IEEE 754 half-precision bit pattern.
fn half_to_f64(bits: u16) -> f64 {
    let exp = i32::from((bits >> 10) & 0x1f);
    let mant = f64::from(bits & 0x3ff);
    let value = match exp {
        0 => mant * 2f64.powi(-24),
        31 => {
            if mant == 0.0 {
                f64::INFINITY
            } else {
                f64::NAN
            }
        }
        _ => (1024.0 + mant) * 2f64.powi(exp - 25),
    };
    if bits >> 15 == 0 { value } else { -value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multibyte_integers_decode() {
        assert_eq!(decode(&[0x18, 0x18]).unwrap(), Value::Uint(24));
        assert_eq!(decode(&[0x19, 0x03, 0xe8]).unwrap(), Value::Uint(1000));
        assert_eq!(
            decode(&[0x1b, 0x00, 0x00, 0x00, 0xe8, 0xd4, 0xa5, 0x10, 0x00]).unwrap(),
            Value::Uint(1_000_000_000_000)
        );
        // -1000
        assert_eq!(decode(&[0x39, 0x03, 0xe7]).unwrap(), Value::NegInt(999));
    }

    #[test]
    fn decoder_reports_positions_left() {
        let err = decode(&[0x62, b'a']).unwrap_err();
        assert!(err.to_string().contains("out of bytes"));
    }

    #[test]
    fn invalid_utf8_text_is_an_error() {
        let err = decode(&[0x62, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::UnknownType,
                ..
            }
        ));
    }

    #[test]
    fn bignum_with_non_bytes_payload_is_rejected() {
        // Tag 2 wrapping an integer.
        let err = decode(&[0xc2, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::UnknownType,
                ..
            }
        ));
    }

    #[test]
    fn unterminated_indefinite_array_runs_out_of_bytes() {
        let err = decode(&[0x9f, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec {
                kind: CodecErrorKind::OutOfBytes,
                ..
            }
        ));
    }

    #[test]
    fn half_precision_tables() {
        assert_eq!(half_to_f64(0x0000), 0.0);
        assert_eq!(half_to_f64(0x3c00), 1.0);
        assert_eq!(half_to_f64(0xc000), -2.0);
        assert_eq!(half_to_f64(0x7c00), f64::INFINITY);
        assert_eq!(half_to_f64(0x0001), 5.960464477539063e-8);
        assert!(half_to_f64(0x7e00).is_nan());
    }
}
