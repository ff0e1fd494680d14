//! SigV4 request signing over ordered header lists.

use hmac::{Hmac, Mac as _};
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;

use crate::error::Result;
use crate::s3::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SERVICE: &str = "s3";

pub(crate) fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

pub(crate) fn payload_hash_empty() -> String {
    payload_hash(b"")
}

/// Sign a request in place: appends `Host`, `x-amz-date`,
/// `x-amz-content-sha256`, the session token when present, and
/// `Authorization`.
///
/// `canonical_uri` must already be percent-encoded the SigV4 way and
/// `canonical_query` sorted and encoded (see [`canonical_query_string`]).
pub(crate) fn sign_request(
    method: &str,
    canonical_uri: &str,
    canonical_query: &str,
    host: &str,
    headers: &mut Vec<(String, String)>,
    payload_hash: &str,
    region: &str,
    credentials: &Credentials,
    now: OffsetDateTime,
) -> Result<()> {
    headers.push(("Host".to_string(), host.to_string()));
    headers.push(("x-amz-date".to_string(), amz_datetime(now)));
    headers.push((
        "x-amz-content-sha256".to_string(),
        payload_hash.to_string(),
    ));
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }

    let (canonical_headers, signed_headers) = canonicalize_headers(headers);

    let canonical_request = format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let scope = credential_scope(region, now);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{scope}\n{}",
        amz_datetime(now),
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signature = signature(credentials, region, now, &string_to_sign);

    headers.push((
        "Authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    ));

    Ok(())
}

/// Lowercase, trim, and sort every signable header.
fn canonicalize_headers(headers: &[(String, String)]) -> (String, String) {
    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| should_sign_header(name))
        .map(|(name, value)| (name.to_ascii_lowercase(), normalize_header_value(value)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut canonical = String::new();
    let mut signed = String::new();
    for (idx, (name, value)) in pairs.into_iter().enumerate() {
        canonical.push_str(&name);
        canonical.push(':');
        canonical.push_str(&value);
        canonical.push('\n');
        if idx > 0 {
            signed.push(';');
        }
        signed.push_str(&name);
    }
    (canonical, signed)
}

fn should_sign_header(name: &str) -> bool {
    !(name.eq_ignore_ascii_case("authorization")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("user-agent"))
}

fn normalize_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_ws = false;
    for c in value.trim().chars() {
        if c.is_whitespace() {
            in_ws = true;
            continue;
        }
        if in_ws && !out.is_empty() {
            out.push(' ');
        }
        in_ws = false;
        out.push(c);
    }
    out
}

fn signature(
    credentials: &Credentials,
    region: &str,
    now: OffsetDateTime,
    string_to_sign: &str,
) -> String {
    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date_stamp(now).as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn date_stamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day()
    )
}

fn amz_datetime(now: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn credential_scope(region: &str, now: OffsetDateTime) -> String {
    format!("{}/{region}/{SERVICE}/aws4_request", date_stamp(now))
}

// ---------------------------------------------------------------------------
// SigV4 percent encoding
// ---------------------------------------------------------------------------

fn is_unreserved(byte: u8) -> bool {
    matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~')
}

pub(crate) fn aws_percent_encode(input: &str) -> String {
    aws_percent_encode_impl(input, false)
}

/// Like [`aws_percent_encode`] but preserves `/` separators.
pub(crate) fn aws_percent_encode_path(input: &str) -> String {
    aws_percent_encode_impl(input, true)
}

fn aws_percent_encode_impl(input: &str, preserve_slash: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if is_unreserved(b) || (preserve_slash && b == b'/') {
            out.push(b as char);
            continue;
        }
        out.push('%');
        out.push(hex_upper(b >> 4));
        out.push(hex_upper(b & 0x0f));
    }
    out
}

fn hex_upper(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'A' + (nibble - 10)) as char,
    }
}

/// Encode and sort query parameters into canonical form.
pub(crate) fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut items: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (aws_percent_encode(k), aws_percent_encode(v)))
        .collect();
    items.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut out = String::new();
    for (idx, (k, v)) in items.into_iter().enumerate() {
        if idx > 0 {
            out.push('&');
        }
        out.push_str(&k);
        out.push('=');
        out.push_str(&v);
    }
    out
}
