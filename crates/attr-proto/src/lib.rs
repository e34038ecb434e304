//! The attribute wire protocol used between routing services.
//!
//! A request or reply is one *frame*: a sequence of typed name/value
//! attributes followed by an end marker. On the wire each attribute is
//!
//! ```text
//! tag:u8  name_len:u16  name…  payload
//! ```
//!
//! with big-endian integers. Tag 1 carries a UTF-8 string payload prefixed
//! by a `u32` length; tag 2 carries a bare big-endian `u32`. A single zero
//! tag byte terminates the frame. Names and values are bounded; anything
//! outside the envelope is a framing error and the peer is expected to
//! drop the connection.

use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const TAG_END: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_U32: u8 = 2;

/// Longest permitted attribute name.
pub const MAX_NAME_LEN: usize = 64;
/// Longest permitted string value.
pub const MAX_VALUE_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum AttrError {
    #[error("attribute stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown attribute tag {0}")]
    UnknownTag(u8),
    #[error("attribute name of {0} bytes exceeds limit")]
    NameTooLong(usize),
    #[error("attribute value of {0} bytes exceeds limit")]
    ValueTooLong(usize),
    #[error("attribute {0} is not valid UTF-8")]
    NotUtf8(String),
    #[error("expected attribute {expected}, got {got}")]
    UnexpectedAttr { expected: String, got: String },
    #[error("attribute {name} has the wrong type")]
    WrongType { name: String },
    #[error("frame ended before attribute {expected}")]
    Truncated { expected: String },
}

/// A borrowed attribute value for writing.
#[derive(Debug, Clone, Copy)]
pub enum Attr<'a> {
    Str(&'a str),
    U32(u32),
}

/// An owned attribute value produced by [`read_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    U32(u32),
}

/// Encode and send one frame, then flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    attrs: &[(&str, Attr<'_>)],
) -> Result<(), AttrError> {
    let mut buf = Vec::new();
    for (name, value) in attrs {
        if name.len() > MAX_NAME_LEN {
            return Err(AttrError::NameTooLong(name.len()));
        }
        match value {
            Attr::Str(text) => {
                if text.len() > MAX_VALUE_LEN {
                    return Err(AttrError::ValueTooLong(text.len()));
                }
                buf.push(TAG_STRING);
                buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
            Attr::U32(num) => {
                buf.push(TAG_U32);
                buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&num.to_be_bytes());
            }
        }
    }
    buf.push(TAG_END);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_name<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String, AttrError> {
    let len = stream.read_u16().await? as usize;
    if len > MAX_NAME_LEN {
        return Err(AttrError::NameTooLong(len));
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    String::from_utf8(raw).map_err(|_| AttrError::NotUtf8("<name>".to_string()))
}

/// Read one frame. Returns `None` when the peer closed the stream cleanly
/// at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Vec<(String, Value)>>, AttrError> {
    let mut attrs = Vec::new();
    loop {
        let tag = match stream.read_u8().await {
            Ok(tag) => tag,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof && attrs.is_empty() => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        match tag {
            TAG_END => return Ok(Some(attrs)),
            TAG_STRING => {
                let name = read_name(stream).await?;
                let len = stream.read_u32().await? as usize;
                if len > MAX_VALUE_LEN {
                    return Err(AttrError::ValueTooLong(len));
                }
                let mut raw = vec![0u8; len];
                stream.read_exact(&mut raw).await?;
                let text =
                    String::from_utf8(raw).map_err(|_| AttrError::NotUtf8(name.clone()))?;
                attrs.push((name, Value::Str(text)));
            }
            TAG_U32 => {
                let name = read_name(stream).await?;
                let num = stream.read_u32().await?;
                attrs.push((name, Value::U32(num)));
            }
            other => return Err(AttrError::UnknownTag(other)),
        }
    }
}

/// Strict accessor: the attribute at `index` must exist, be named `name`,
/// and carry a string value.
pub fn expect_str<'a>(
    attrs: &'a [(String, Value)],
    index: usize,
    name: &str,
) -> Result<&'a str, AttrError> {
    match attrs.get(index) {
        None => Err(AttrError::Truncated {
            expected: name.to_string(),
        }),
        Some((got, _)) if got != name => Err(AttrError::UnexpectedAttr {
            expected: name.to_string(),
            got: got.clone(),
        }),
        Some((_, Value::Str(text))) => Ok(text),
        Some((_, Value::U32(_))) => Err(AttrError::WrongType {
            name: name.to_string(),
        }),
    }
}

/// Strict accessor for a `u32` attribute; see [`expect_str`].
pub fn expect_u32(attrs: &[(String, Value)], index: usize, name: &str) -> Result<u32, AttrError> {
    match attrs.get(index) {
        None => Err(AttrError::Truncated {
            expected: name.to_string(),
        }),
        Some((got, _)) if got != name => Err(AttrError::UnexpectedAttr {
            expected: name.to_string(),
            got: got.clone(),
        }),
        Some((_, Value::U32(num))) => Ok(*num),
        Some((_, Value::Str(_))) => Err(AttrError::WrongType {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(
            &mut client,
            &[
                ("transport", Attr::Str("smtp")),
                ("nexthop", Attr::Str("other.org")),
                ("recipient", Attr::Str("bob@other.org")),
                ("flags", Attr::U32(0x1000)),
            ],
        )
        .await
        .unwrap();

        let attrs = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(expect_str(&attrs, 0, "transport").unwrap(), "smtp");
        assert_eq!(expect_str(&attrs, 1, "nexthop").unwrap(), "other.org");
        assert_eq!(expect_str(&attrs, 2, "recipient").unwrap(), "bob@other.org");
        assert_eq!(expect_u32(&attrs, 3, "flags").unwrap(), 0x1000);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[TAG_STRING, 0, 4, b'a']).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[9]).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(AttrError::UnknownTag(9))
        ));
    }

    #[tokio::test]
    async fn strict_accessors_reject_surprises() {
        let attrs = vec![
            ("addr".to_string(), Value::Str("a@b".to_string())),
            ("flags".to_string(), Value::U32(7)),
        ];
        assert!(expect_str(&attrs, 0, "addr").is_ok());
        assert!(matches!(
            expect_str(&attrs, 0, "rule"),
            Err(AttrError::UnexpectedAttr { .. })
        ));
        assert!(matches!(
            expect_str(&attrs, 1, "flags"),
            Err(AttrError::WrongType { .. })
        ));
        assert!(matches!(
            expect_u32(&attrs, 2, "more"),
            Err(AttrError::Truncated { .. })
        ));
    }
}
