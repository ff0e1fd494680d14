//! Codec scenarios over the public API.

use stevedore::cbor::{self, Value};
use stevedore::{CodecErrorKind, Error};

#[test]
fn small_map_roundtrips_with_key_order() {
    let value = Value::Map(vec![
        (Value::from("id"), Value::Uint(1)),
        (
            Value::from("tags"),
            Value::Array(vec![Value::from("a"), Value::from("b")]),
        ),
        (Value::from("active"), Value::Bool(true)),
    ]);

    let bytes = cbor::encode(&value);
    let decoded = cbor::decode(&bytes).unwrap();
    assert_eq!(decoded, value);

    let Value::Map(entries) = decoded else {
        panic!("expected map");
    };
    let keys: Vec<&Value> = entries.iter().map(|(k, _)| k).collect();
    assert_eq!(
        keys,
        [
            &Value::from("id"),
            &Value::from("tags"),
            &Value::from("active")
        ]
    );
}

#[test]
fn concatenated_items_raise_extra_bytes() {
    let mut bytes = cbor::encode(&Value::Map(vec![(Value::from("k"), Value::Uint(1))]));
    bytes.extend_from_slice(&cbor::encode(&Value::Bool(true)));

    let err = cbor::decode(&bytes).unwrap_err();
    assert!(matches!(
        err,
        Error::Codec {
            kind: CodecErrorKind::ExtraBytes,
            ..
        }
    ));
}

#[test]
fn special_values_survive_the_wire() {
    // Bignums above 2^64.
    let big = Value::integer((340_282_366_920_938_463_463_374_607_431_768_211_455u128 / 7) as i128);
    assert_eq!(cbor::decode(&cbor::encode(&big)).unwrap(), big);

    // Decimal fractions as tag 4.
    let price = Value::decimal_fraction(-2, 19_999);
    assert_eq!(cbor::decode(&cbor::encode(&price)).unwrap(), price);

    // Epoch times as tag 1.
    let time = Value::epoch_time(1_700_000_000.5);
    assert_eq!(cbor::decode(&cbor::encode(&time)).unwrap(), time);

    // Binary and text strings stay distinct on the wire.
    let text = Value::from("héllo wörld");
    let binary = Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(cbor::decode(&cbor::encode(&text)).unwrap(), text);
    assert_eq!(cbor::decode(&cbor::encode(&binary)).unwrap(), binary);
}

#[test]
fn incremental_encoder_produces_a_decodable_sequence() {
    let mut encoder = cbor::Encoder::new();
    encoder.push(&Value::Uint(1));
    encoder.push(&Value::from("two"));
    let bytes = encoder.into_bytes();

    let mut decoder = cbor::Decoder::new(&bytes);
    // The first item decodes, but a strict single-item decode rejects the
    // remainder of the sequence.
    let err = decoder.decode().unwrap_err();
    assert!(matches!(
        err,
        Error::Codec {
            kind: CodecErrorKind::ExtraBytes,
            ..
        }
    ));
}
