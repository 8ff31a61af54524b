//! Naming scheme and header codec for the KV ⇄ stream mapping.
//!
//! A bucket `B` is backed by the stream `KV_B` whose single subject filter is
//! `$KV.B.>`; the entry for key `K` lives on the subject `$KV.B.K`. All name
//! validation happens here, before anything is put on the wire.

use crate::error::{Error, Result};

/// Streams backing a bucket are named `KV_<bucket>`.
pub(crate) const KV_STREAM_PREFIX: &str = "KV_";
/// Entry subjects are `$KV.<bucket>.<key>`.
pub(crate) const KV_SUBJECT_PREFIX: &str = "$KV.";

/// Carries the entry operation for tombstones: `DEL` or `PURGE`.
pub(crate) const KV_OPERATION_HDR: &str = "KV-Operation";
pub(crate) const KV_OPERATION_DEL: &str = "DEL";
pub(crate) const KV_OPERATION_PURGE: &str = "PURGE";
/// Instructs the server to collapse prior per-subject history into this message.
pub(crate) const ROLLUP_HDR: &str = "Nats-Rollup";
pub(crate) const ROLLUP_SUBJECT: &str = "sub";
/// Optimistic concurrency check on the per-subject last sequence.
pub(crate) const EXPECTED_LAST_SUBJECT_SEQ_HDR: &str = "Nats-Expected-Last-Subject-Sequence";
/// Payload size of a headers-only delivery.
pub(crate) const MSG_SIZE_HDR: &str = "Nats-Msg-Size";

pub(crate) fn stream_name(bucket: &str) -> String {
    format!("{KV_STREAM_PREFIX}{bucket}")
}

/// The wildcard filter covering every entry of the bucket.
pub(crate) fn stream_subject(bucket: &str) -> String {
    format!("{KV_SUBJECT_PREFIX}{bucket}.>")
}

pub(crate) fn entry_subject(bucket: &str, key: &str) -> String {
    format!("{KV_SUBJECT_PREFIX}{bucket}.{key}")
}

/// Recovers the key from a message subject by stripping the bucket prefix.
/// Returns `None` when the subject does not belong to the bucket.
pub(crate) fn key_from_subject<'a>(bucket: &str, subject: &'a str) -> Option<&'a str> {
    subject
        .strip_prefix(KV_SUBJECT_PREFIX)?
        .strip_prefix(bucket)?
        .strip_prefix('.')
        .filter(|key| !key.is_empty())
}

fn is_bucket_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '=')
}

/// Bucket names may only contain ASCII letters, digits, `-` and `_`.
pub(crate) fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.is_empty() || !bucket.chars().all(is_bucket_char) {
        return Err(Error::InvalidArgument(format!(
            "invalid bucket name '{bucket}'"
        )));
    }
    Ok(())
}

/// Keys are dot-separated label sequences over a conservative alphabet.
/// Empty tokens (leading, trailing or doubled dots) are rejected.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    for token in key.split('.') {
        if token.is_empty() || !token.chars().all(is_key_char) {
            return Err(Error::InvalidArgument(format!("invalid key '{key}'")));
        }
    }
    Ok(())
}

/// Like [`validate_key`] but admits subject wildcards: a `*` token anywhere,
/// a `>` token only in last position. `>` on its own covers the whole bucket.
pub(crate) fn validate_key_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidArgument(
            "key pattern must not be empty".to_string(),
        ));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        match *token {
            "*" => continue,
            ">" if i == tokens.len() - 1 => continue,
            t if !t.is_empty() && t.chars().all(is_key_char) => continue,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "invalid key pattern '{pattern}'"
                )));
            }
        }
    }
    Ok(())
}

/// Parses a raw `NATS/1.0` header block as carried (base64-encoded) in
/// message-get responses.
pub(crate) fn parse_header_block(block: &[u8]) -> Result<Vec<(String, String)>> {
    let text = std::str::from_utf8(block)
        .map_err(|e| Error::Other(format!("header block is not valid UTF-8: {e}")))?;
    let mut lines = text.split("\r\n");
    match lines.next() {
        Some(version) if version.starts_with("NATS/1.0") => {}
        _ => {
            return Err(Error::Other(
                "header block is missing the NATS/1.0 version line".to_string(),
            ));
        }
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Other(format!("malformed header line '{line}'")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_and_subject_names() {
        assert_eq!(stream_name("orders"), "KV_orders");
        assert_eq!(stream_subject("orders"), "$KV.orders.>");
        assert_eq!(entry_subject("orders", "eu.paris"), "$KV.orders.eu.paris");
    }

    #[test]
    fn test_key_from_subject() {
        assert_eq!(key_from_subject("b", "$KV.b.k"), Some("k"));
        assert_eq!(key_from_subject("b", "$KV.b.a.b.c"), Some("a.b.c"));
        assert_eq!(key_from_subject("b", "$KV.other.k"), None);
        assert_eq!(key_from_subject("b", "$KV.b."), None);
        assert_eq!(key_from_subject("b", "foo.bar"), None);
    }

    #[test]
    fn test_validate_bucket_name() {
        for ok in ["b", "Bucket-1", "under_score", "0123"] {
            assert!(validate_bucket_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "dot.ted", "spa ce", "star*", "gt>", "pct%"] {
            assert!(validate_bucket_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_validate_key() {
        for ok in ["k", "a.b.c", "key_1", "eu/west", "base=64", "-dash"] {
            assert!(validate_key(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", ".lead", "trail.", "dou..ble", "sp ace", "*", ">", "a.*"] {
            assert!(validate_key(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_validate_key_pattern() {
        for ok in ["k", "a.b", "key.*", "key.>", "*.end", ">", "a.*.c"] {
            assert!(validate_key_pattern(ok).is_ok(), "{ok}");
        }
        for bad in ["", ">.more", "a.>b", "sp ace", "a..b"] {
            assert!(validate_key_pattern(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_header_block() {
        let block = b"NATS/1.0\r\nKV-Operation: DEL\r\nNats-Rollup: sub\r\n\r\n";
        let headers = parse_header_block(block).unwrap();
        assert_eq!(
            headers,
            vec![
                ("KV-Operation".to_string(), "DEL".to_string()),
                ("Nats-Rollup".to_string(), "sub".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_header_block_rejects_garbage() {
        assert!(parse_header_block(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(parse_header_block(b"NATS/1.0\r\nno-colon-here\r\n\r\n").is_err());
    }
}
