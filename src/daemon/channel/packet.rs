//! Channel-level packets and their CBOR encoding.

use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::core::{ChannelSessionId, ErrorPayload, Limits};
use crate::daemon::cbor::{
    CborEncoder, ProtoDecodeError, ProtoEncodeError, decode_bytes, decode_error_payload,
    decode_map_len, decode_text, encode_envelope_header, encode_error_payload, ensure_consumed,
    skip_value, split_envelope,
};

pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

/// Opens or resumes a channel session.
///
/// `next_expected` is the first sequence number the sender has not yet
/// delivered; the peer retransmits everything from there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Open {
    pub session: ChannelSessionId,
    pub next_expected: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    pub seq: u64,
    /// Piggy-backed cumulative ack.
    pub ack: u64,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Open(Open),
    OpenAck(Open),
    Data(Data),
    /// Everything up to and including `seq` was delivered.
    Ack { seq: u64 },
    /// The inclusive range `from..=to` is missing.
    Nak { from: u64, to: u64 },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Close { error: Option<ErrorPayload> },
}

impl Packet {
    fn type_name(&self) -> &'static str {
        match self {
            Packet::Open(_) => "open",
            Packet::OpenAck(_) => "open_ack",
            Packet::Data(_) => "data",
            Packet::Ack { .. } => "ack",
            Packet::Nak { .. } => "nak",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
            Packet::Close { .. } => "close",
        }
    }
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_envelope_header(&mut enc, CHANNEL_PROTOCOL_VERSION, packet.type_name())?;
    match packet {
        Packet::Open(open) | Packet::OpenAck(open) => {
            enc.map(2)?;
            enc.str("session")?;
            enc.bytes(open.session.as_bytes())?;
            enc.str("next_expected")?;
            enc.u64(open.next_expected)?;
        }
        Packet::Data(data) => {
            enc.map(3)?;
            enc.str("seq")?;
            enc.u64(data.seq)?;
            enc.str("ack")?;
            enc.u64(data.ack)?;
            enc.str("payload")?;
            enc.bytes(&data.payload)?;
        }
        Packet::Ack { seq } => {
            enc.map(1)?;
            enc.str("seq")?;
            enc.u64(*seq)?;
        }
        Packet::Nak { from, to } => {
            enc.map(2)?;
            enc.str("from")?;
            enc.u64(*from)?;
            enc.str("to")?;
            enc.u64(*to)?;
        }
        Packet::Ping { nonce } | Packet::Pong { nonce } => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(*nonce)?;
        }
        Packet::Close { error } => encode_close(&mut enc, error.as_ref())?,
    }
    Ok(buf)
}

fn encode_close(
    enc: &mut CborEncoder<'_>,
    error: Option<&ErrorPayload>,
) -> Result<(), ProtoEncodeError> {
    match error {
        Some(error) => {
            enc.map(1)?;
            enc.str("error")?;
            encode_error_payload(enc, error)?;
        }
        None => {
            enc.map(0)?;
        }
    }
    Ok(())
}

pub fn decode_packet(bytes: &[u8], limits: &Limits) -> Result<Packet, ProtoDecodeError> {
    let raw = split_envelope(bytes, CHANNEL_PROTOCOL_VERSION, limits)?;
    let mut dec = Decoder::new(raw.body);
    let packet = match raw.message_type {
        "open" => Packet::Open(decode_open(&mut dec, limits)?),
        "open_ack" => Packet::OpenAck(decode_open(&mut dec, limits)?),
        "data" => Packet::Data(decode_data(&mut dec, limits)?),
        "ack" => {
            let fields = decode_u64_fields(&mut dec, limits, &["seq"])?;
            Packet::Ack { seq: fields[0] }
        }
        "nak" => {
            let fields = decode_u64_fields(&mut dec, limits, &["from", "to"])?;
            if fields[0] == 0 || fields[0] > fields[1] {
                return Err(ProtoDecodeError::InvalidField {
                    field: "from",
                    reason: format!("invalid range {}..={}", fields[0], fields[1]),
                });
            }
            Packet::Nak {
                from: fields[0],
                to: fields[1],
            }
        }
        "ping" => {
            let fields = decode_u64_fields(&mut dec, limits, &["nonce"])?;
            Packet::Ping { nonce: fields[0] }
        }
        "pong" => {
            let fields = decode_u64_fields(&mut dec, limits, &["nonce"])?;
            Packet::Pong { nonce: fields[0] }
        }
        "close" => Packet::Close {
            error: decode_close(&mut dec, limits)?,
        },
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    ensure_consumed(&dec)?;
    Ok(packet)
}

fn decode_open(dec: &mut Decoder, limits: &Limits) -> Result<Open, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut session = None;
    let mut next_expected = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "session" => {
                let raw = decode_bytes(dec, limits, "session")?;
                let bytes: [u8; 16] =
                    raw.try_into()
                        .map_err(|_| ProtoDecodeError::InvalidField {
                            field: "session",
                            reason: format!("expected 16 bytes, got {}", raw.len()),
                        })?;
                session = Some(ChannelSessionId::from_bytes(bytes));
            }
            "next_expected" => next_expected = Some(dec.u64()?),
            _ => skip_value(dec)?,
        }
    }
    let next_expected = next_expected.ok_or(ProtoDecodeError::MissingField("next_expected"))?;
    if next_expected == 0 {
        return Err(ProtoDecodeError::InvalidField {
            field: "next_expected",
            reason: "sequence numbers start at 1".into(),
        });
    }
    Ok(Open {
        session: session.ok_or(ProtoDecodeError::MissingField("session"))?,
        next_expected,
    })
}

fn decode_data(dec: &mut Decoder, limits: &Limits) -> Result<Data, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut seq = None;
    let mut ack = None;
    let mut payload = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "seq" => seq = Some(dec.u64()?),
            "ack" => ack = Some(dec.u64()?),
            "payload" => {
                payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "payload")?))
            }
            _ => skip_value(dec)?,
        }
    }
    let seq = seq.ok_or(ProtoDecodeError::MissingField("seq"))?;
    if seq == 0 {
        return Err(ProtoDecodeError::InvalidField {
            field: "seq",
            reason: "sequence numbers start at 1".into(),
        });
    }
    Ok(Data {
        seq,
        ack: ack.ok_or(ProtoDecodeError::MissingField("ack"))?,
        payload: payload.ok_or(ProtoDecodeError::MissingField("payload"))?,
    })
}

fn decode_close(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<Option<ErrorPayload>, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut error = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "error" => error = Some(decode_error_payload(dec, limits, 2)?),
            _ => skip_value(dec)?,
        }
    }
    Ok(error)
}

/// Decodes a flat map of required `u64` fields, returned in `names` order.
fn decode_u64_fields(
    dec: &mut Decoder,
    limits: &Limits,
    names: &[&'static str],
) -> Result<Vec<u64>, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut values: Vec<Option<u64>> = vec![None; names.len()];
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match names.iter().position(|name| *name == key) {
            Some(idx) => values[idx] = Some(dec.u64()?),
            None => skip_value(dec)?,
        }
    }
    names
        .iter()
        .zip(values)
        .map(|(name, value)| value.ok_or(ProtoDecodeError::MissingField(*name)))
        .collect()
}
