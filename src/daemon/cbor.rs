//! Shared CBOR plumbing for the channel and application protocols.
//!
//! Every message is a three-entry map `{v, type, body}`. Decoding is strict:
//! indefinite-length items, unknown message types and trailing bytes are all
//! rejected, and every container is checked against [`Limits`].

use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::error::details::InvalidRequestDetails;
use crate::core::{ErrorPayload, Limits, ProtocolErrorCode};

pub(crate) type CborEncoder<'a> = Encoder<&'a mut Vec<u8>>;

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("unsupported protocol version {got} (expected {expected})")]
    UnsupportedVersion { expected: u32, got: u32 },
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

impl ProtoDecodeError {
    pub fn as_error_payload(&self) -> ErrorPayload {
        match self {
            ProtoDecodeError::MissingField(field) => ErrorPayload::new(
                ProtocolErrorCode::InvalidRequest,
                format!("missing field {field}"),
                false,
            )
            .with_details(InvalidRequestDetails {
                field: Some(field.to_string()),
                reason: None,
            }),
            ProtoDecodeError::InvalidField { field, reason } => ErrorPayload::new(
                ProtocolErrorCode::InvalidRequest,
                format!("invalid field {field}: {reason}"),
                false,
            )
            .with_details(InvalidRequestDetails {
                field: Some(field.to_string()),
                reason: Some(reason.clone()),
            }),
            ProtoDecodeError::UnknownMessageType(raw) => ErrorPayload::new(
                ProtocolErrorCode::InvalidRequest,
                format!("unknown message type {raw}"),
                false,
            )
            .with_details(InvalidRequestDetails {
                field: Some("type".into()),
                reason: Some(format!("unknown message type {raw}")),
            }),
            ProtoDecodeError::UnsupportedVersion { .. } => ErrorPayload::new(
                ProtocolErrorCode::VersionIncompatible,
                self.to_string(),
                false,
            ),
            ProtoDecodeError::DecodeLimit(_)
            | ProtoDecodeError::IndefiniteLength
            | ProtoDecodeError::TrailingBytes
            | ProtoDecodeError::Cbor(_) => ErrorPayload::new(
                ProtocolErrorCode::MalformedPayload,
                format!("failed to decode CBOR payload: {self}"),
                false,
            ),
        }
    }
}

/// Writes the `{v, type, body}` header; the caller encodes the body next.
pub(crate) fn encode_envelope_header(
    enc: &mut CborEncoder<'_>,
    version: u32,
    message_type: &str,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(version)?;
    enc.str("type")?;
    enc.str(message_type)?;
    enc.str("body")?;
    Ok(())
}

/// A decoded envelope whose body has not been interpreted yet.
pub(crate) struct RawEnvelope<'a> {
    pub message_type: &'a str,
    pub body: &'a [u8],
}

pub(crate) fn split_envelope<'a>(
    bytes: &'a [u8],
    expected_version: u32,
    limits: &Limits,
) -> Result<RawEnvelope<'a>, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => message_type = Some(decode_text(&mut dec, limits)?),
            "body" => {
                let start = dec.position();
                skip_value(&mut dec)?;
                body_span = Some((start, dec.position()));
            }
            _ => skip_value(&mut dec)?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    if version != expected_version {
        return Err(ProtoDecodeError::UnsupportedVersion {
            expected: expected_version,
            got: version,
        });
    }
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    Ok(RawEnvelope {
        message_type,
        body: &bytes[start..end],
    })
}

/// Fails if a body decoder left bytes behind.
pub(crate) fn ensure_consumed(dec: &Decoder) -> Result<(), ProtoDecodeError> {
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(())
}

pub(crate) fn skip_value(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if is_indefinite(dec)? {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

pub(crate) fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let Some(len) = dec.map()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_map_entries"))
}

pub(crate) fn decode_array_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let Some(len) = dec.array()? else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_array_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_array_entries"))
}

pub(crate) fn decode_text<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
) -> Result<&'a str, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(s)
}

pub(crate) fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_cbor_bytes_string_len {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds limit".into(),
        });
    }
    Ok(bytes)
}

pub(crate) fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: format!("value {value} out of range for u32"),
    })
}

/// Encodes `Some(v)` as `v` and `None` as CBOR null.
pub(crate) fn encode_opt_u64(
    enc: &mut CborEncoder<'_>,
    value: Option<u64>,
) -> Result<(), ProtoEncodeError> {
    match value {
        Some(v) => enc.u64(v)?,
        None => enc.null()?,
    };
    Ok(())
}

pub(crate) fn decode_opt_u64(dec: &mut Decoder) -> Result<Option<u64>, ProtoDecodeError> {
    if matches!(dec.datatype()?, Type::Null) {
        dec.null()?;
        return Ok(None);
    }
    Ok(Some(dec.u64()?))
}

pub(crate) fn encode_error_payload(
    enc: &mut CborEncoder<'_>,
    payload: &ErrorPayload,
) -> Result<(), ProtoEncodeError> {
    let details = payload
        .details
        .as_ref()
        .and_then(|value| serde_json::to_string(value).ok());
    enc.map(if details.is_some() { 4 } else { 3 })?;
    enc.str("code")?;
    enc.str(payload.code.as_str())?;
    enc.str("message")?;
    enc.str(&payload.message)?;
    enc.str("retryable")?;
    enc.bool(payload.retryable)?;
    if let Some(details) = details {
        enc.str("details")?;
        enc.str(&details)?;
    }
    Ok(())
}

pub(crate) fn decode_error_payload(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<ErrorPayload, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, depth)?;
    let mut code = None;
    let mut message = None;
    let mut retryable = None;
    let mut details = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "code" => {
                let raw = decode_text(dec, limits)?;
                code = Some(ProtocolErrorCode::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "code",
                        reason: format!("unknown error code {raw}"),
                    }
                })?);
            }
            "message" => message = Some(decode_text(dec, limits)?.to_string()),
            "retryable" => retryable = Some(dec.bool()?),
            "details" => {
                let raw = decode_text(dec, limits)?;
                details = Some(serde_json::from_str(raw).map_err(|e| {
                    ProtoDecodeError::InvalidField {
                        field: "details",
                        reason: e.to_string(),
                    }
                })?);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(ErrorPayload {
        code: code.ok_or(ProtoDecodeError::MissingField("code"))?,
        message: message.ok_or(ProtoDecodeError::MissingField("message"))?,
        retryable: retryable.ok_or(ProtoDecodeError::MissingField("retryable"))?,
        details,
    })
}

fn ensure_depth(limits: &Limits, depth: usize) -> Result<(), ProtoDecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}

fn is_indefinite(dec: &Decoder) -> Result<bool, ProtoDecodeError> {
    let ty = dec.datatype()?;
    Ok(matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}
