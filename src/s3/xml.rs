//! S3 XML documents used by the multipart protocol.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::s3::checksum::ChecksumAlgorithm;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

/// Extract the `UploadId` from a CreateMultipartUpload response.
pub(crate) fn parse_upload_id(body: &str) -> Result<String> {
    let parsed: InitiateMultipartUploadResult = quick_xml::de::from_str(body).map_err(|e| {
        Error::connection(
            "S3_PROTOCOL_ERROR",
            format!("failed to parse InitiateMultipartUploadResult: {e}"),
        )
    })?;

    if parsed.upload_id.is_empty() {
        return Err(Error::connection(
            "S3_PROTOCOL_ERROR",
            "InitiateMultipartUploadResult carried an empty UploadId",
        ));
    }
    Ok(parsed.upload_id)
}

/// The S3 error document, when a failure body carries one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorDocument {
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

pub fn parse_error_document(body: &str) -> Option<ErrorDocument> {
    if body.trim().is_empty() {
        return None;
    }
    quick_xml::de::from_str(body).ok()
}

/// One part in a CompleteMultipartUpload request.
pub(crate) struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub checksum: Option<(ChecksumAlgorithm, String)>,
}

/// Build the CompleteMultipartUpload request body. Parts must already be
/// in part-number order.
pub(crate) fn complete_multipart_xml(parts: &[CompletedPart]) -> String {
    let mut xml = String::with_capacity(128 + parts.len() * 96);
    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    xml.push_str(r#"<CompleteMultipartUpload xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#);
    for part in parts {
        xml.push_str("<Part>");
        xml.push_str("<PartNumber>");
        xml.push_str(&part.part_number.to_string());
        xml.push_str("</PartNumber>");
        xml.push_str("<ETag>");
        xml.push_str(&escape_text(&part.etag));
        xml.push_str("</ETag>");
        if let Some((algorithm, value)) = &part.checksum {
            let element = checksum_element(*algorithm);
            xml.push('<');
            xml.push_str(element);
            xml.push('>');
            xml.push_str(&escape_text(value));
            xml.push_str("</");
            xml.push_str(element);
            xml.push('>');
        }
        xml.push_str("</Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn checksum_element(algorithm: ChecksumAlgorithm) -> &'static str {
    match algorithm {
        ChecksumAlgorithm::Crc32 => "ChecksumCRC32",
        ChecksumAlgorithm::Crc32c => "ChecksumCRC32C",
        ChecksumAlgorithm::Sha1 => "ChecksumSHA1",
        ChecksumAlgorithm::Sha256 => "ChecksumSHA256",
    }
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upload_id() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Bucket>my-bucket</Bucket>
  <Key>big/object.bin</Key>
  <UploadId>VXBsb2FkSWQ</UploadId>
</InitiateMultipartUploadResult>"#;

        assert_eq!(parse_upload_id(body).unwrap(), "VXBsb2FkSWQ");
    }

    #[test]
    fn malformed_initiate_response_is_an_error() {
        assert!(parse_upload_id("<NotTheRightDocument/>").is_err());
        assert!(parse_upload_id("not xml at all").is_err());
    }

    #[test]
    fn parses_error_documents() {
        let body = r#"<Error>
  <Code>NoSuchKey</Code>
  <Message>The specified key does not exist.</Message>
  <RequestId>req-1</RequestId>
</Error>"#;

        let doc = parse_error_document(body).unwrap();
        assert_eq!(doc.code.as_deref(), Some("NoSuchKey"));
        assert_eq!(doc.request_id.as_deref(), Some("req-1"));

        assert!(parse_error_document("").is_none());
    }

    #[test]
    fn complete_xml_lists_parts_in_order() {
        let xml = complete_multipart_xml(&[
            CompletedPart {
                part_number: 1,
                etag: "\"abc\"".to_string(),
                checksum: None,
            },
            CompletedPart {
                part_number: 2,
                etag: "\"def\"".to_string(),
                checksum: Some((ChecksumAlgorithm::Crc32, "NhCmhg==".to_string())),
            },
        ]);

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        let first = xml.find("<PartNumber>1</PartNumber>").unwrap();
        let second = xml.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(first < second);
        assert!(xml.contains("<ETag>&quot;abc&quot;</ETag>"));
        assert!(xml.contains("<ChecksumCRC32>NhCmhg==</ChecksumCRC32>"));
    }
}
