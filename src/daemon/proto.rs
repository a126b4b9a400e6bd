//! Application messages exchanged between clients and the coordinator.
//!
//! These ride inside `data` packets of a sequenced channel, so ordering and
//! exactly-once delivery are already taken care of here.

use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::core::{
    ClientId, ErrorPayload, GlobalTransactionId, Limits, LockContext, LockId, LockLevel,
    LockOutcome, LockResponse, NotifiedWaiter, NotifyKind, NotifyRequest, ObjectDelta, ObjectId,
    ObjectIdRange, SequenceId, ThreadId, TransactionBatch, TransactionId, TxnBatchId, TxnRecord,
    TxnType,
};
use crate::daemon::cbor::{
    CborEncoder, ProtoDecodeError, ProtoEncodeError, decode_array_len, decode_bytes,
    decode_error_payload, decode_map_len, decode_opt_u64, decode_text, encode_envelope_header,
    encode_error_payload, encode_opt_u64, ensure_consumed, skip_value, split_envelope,
};

pub const APP_PROTOCOL_VERSION: u32 = 1;

/// Everything a reconnecting (or first-time) client reports about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHandshake {
    pub client_id: ClientId,
    pub client_version: String,
    /// Objects the client holds references to; these drive broadcast interest.
    pub object_ids: Vec<ObjectId>,
    pub lock_contexts: Vec<LockContext>,
    pub wait_contexts: Vec<LockContext>,
    pub pending_lock_contexts: Vec<LockContext>,
    pub pending_try_lock_contexts: Vec<LockContext>,
    pub resent_sequence_ids: Vec<SequenceId>,
    pub resent_txn_ids: Vec<TransactionId>,
    pub request_object_ids: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOp {
    Acquire { level: LockLevel },
    TryAcquire { level: LockLevel },
    Release,
    Wait { timeout_ms: Option<u64> },
    Cancel,
}

impl LockOp {
    fn as_str(&self) -> &'static str {
        match self {
            LockOp::Acquire { .. } => "acquire",
            LockOp::TryAcquire { .. } => "try_acquire",
            LockOp::Release => "release",
            LockOp::Wait { .. } => "wait",
            LockOp::Cancel => "cancel",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub lock: LockId,
    pub thread: ThreadId,
    pub op: LockOp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Handshake(ClientHandshake),
    Commit(TransactionBatch),
    Lock(LockRequest),
    RequestObjectIds { count: u64 },
    /// Adds objects to the client's broadcast interest set.
    Subscribe { object_ids: Vec<ObjectId> },
}

impl ClientMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Handshake(_) => "handshake",
            ClientMessage::Commit(_) => "commit",
            ClientMessage::Lock(_) => "lock",
            ClientMessage::RequestObjectIds { .. } => "request_object_ids",
            ClientMessage::Subscribe { .. } => "subscribe",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Resent transactions the server had already applied; drop them.
    pub acknowledged: Vec<SequenceId>,
    /// Resent transactions the server still expects to receive.
    pub pending: Vec<SequenceId>,
    pub object_ids: Option<ObjectIdRange>,
    pub server_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    pub origin: ClientId,
    pub gid: GlobalTransactionId,
    pub txn_id: TransactionId,
    pub deltas: Vec<ObjectDelta>,
    /// Waiters of the receiving client released by this transaction.
    pub notified: Vec<NotifiedWaiter>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    HandshakeAck(HandshakeAck),
    HandshakeReject(ErrorPayload),
    Broadcast(Broadcast),
    TxnAck {
        txn_id: TransactionId,
        sequence_id: SequenceId,
    },
    LockResponse(LockResponse),
    ObjectIds(ObjectIdRange),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::HandshakeAck(_) => "handshake_ack",
            ServerMessage::HandshakeReject(_) => "handshake_reject",
            ServerMessage::Broadcast(_) => "broadcast",
            ServerMessage::TxnAck { .. } => "txn_ack",
            ServerMessage::LockResponse(_) => "lock_response",
            ServerMessage::ObjectIds(_) => "object_ids",
            ServerMessage::Error(_) => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_envelope_header(&mut enc, APP_PROTOCOL_VERSION, msg.type_name())?;
    match msg {
        ClientMessage::Handshake(hs) => encode_handshake(&mut enc, hs)?,
        ClientMessage::Commit(batch) => encode_batch(&mut enc, batch)?,
        ClientMessage::Lock(req) => encode_lock_request(&mut enc, req)?,
        ClientMessage::RequestObjectIds { count } => {
            enc.map(1)?;
            enc.str("count")?;
            enc.u64(*count)?;
        }
        ClientMessage::Subscribe { object_ids } => {
            enc.map(1)?;
            enc.str("object_ids")?;
            encode_u64s(&mut enc, object_ids.iter().map(|id| id.get()))?;
        }
    }
    Ok(buf)
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_envelope_header(&mut enc, APP_PROTOCOL_VERSION, msg.type_name())?;
    match msg {
        ServerMessage::HandshakeAck(ack) => {
            enc.map(4)?;
            enc.str("acknowledged")?;
            encode_u64s(&mut enc, ack.acknowledged.iter().map(|s| s.get()))?;
            enc.str("pending")?;
            encode_u64s(&mut enc, ack.pending.iter().map(|s| s.get()))?;
            enc.str("object_ids")?;
            match &ack.object_ids {
                Some(range) => encode_range(&mut enc, range)?,
                None => {
                    enc.null()?;
                }
            }
            enc.str("server_version")?;
            enc.str(&ack.server_version)?;
        }
        ServerMessage::HandshakeReject(payload) | ServerMessage::Error(payload) => {
            encode_error_payload(&mut enc, payload)?
        }
        ServerMessage::Broadcast(b) => {
            enc.map(5)?;
            enc.str("origin")?;
            enc.u64(b.origin.get())?;
            enc.str("gid")?;
            enc.u64(b.gid.get())?;
            enc.str("txn_id")?;
            enc.u64(b.txn_id.get())?;
            enc.str("deltas")?;
            enc.array(b.deltas.len() as u64)?;
            for delta in &b.deltas {
                encode_delta(&mut enc, delta)?;
            }
            enc.str("notified")?;
            enc.array(b.notified.len() as u64)?;
            for waiter in &b.notified {
                enc.map(3)?;
                enc.str("lock")?;
                encode_lock_id(&mut enc, &waiter.lock)?;
                enc.str("thread")?;
                enc.u64(waiter.thread.get())?;
                enc.str("level")?;
                enc.str(waiter.level.as_str())?;
            }
        }
        ServerMessage::TxnAck {
            txn_id,
            sequence_id,
        } => {
            enc.map(2)?;
            enc.str("txn_id")?;
            enc.u64(txn_id.get())?;
            enc.str("sequence_id")?;
            enc.u64(sequence_id.get())?;
        }
        ServerMessage::LockResponse(resp) => {
            enc.map(4)?;
            enc.str("lock")?;
            encode_lock_id(&mut enc, &resp.lock)?;
            enc.str("thread")?;
            enc.u64(resp.thread.get())?;
            enc.str("level")?;
            enc.str(resp.level.as_str())?;
            enc.str("outcome")?;
            enc.str(resp.outcome.as_str())?;
        }
        ServerMessage::ObjectIds(range) => encode_range(&mut enc, range)?,
    }
    Ok(buf)
}

fn encode_handshake(enc: &mut CborEncoder<'_>, hs: &ClientHandshake) -> Result<(), ProtoEncodeError> {
    enc.map(10)?;
    enc.str("client_id")?;
    enc.u64(hs.client_id.get())?;
    enc.str("client_version")?;
    enc.str(&hs.client_version)?;
    enc.str("object_ids")?;
    encode_u64s(enc, hs.object_ids.iter().map(|id| id.get()))?;
    for (name, contexts) in [
        ("lock_contexts", &hs.lock_contexts),
        ("wait_contexts", &hs.wait_contexts),
        ("pending_lock_contexts", &hs.pending_lock_contexts),
        ("pending_try_lock_contexts", &hs.pending_try_lock_contexts),
    ] {
        enc.str(name)?;
        enc.array(contexts.len() as u64)?;
        for ctx in contexts {
            encode_lock_context(enc, ctx)?;
        }
    }
    enc.str("resent_sequence_ids")?;
    encode_u64s(enc, hs.resent_sequence_ids.iter().map(|s| s.get()))?;
    enc.str("resent_txn_ids")?;
    encode_u64s(enc, hs.resent_txn_ids.iter().map(|t| t.get()))?;
    enc.str("request_object_ids")?;
    enc.bool(hs.request_object_ids)?;
    Ok(())
}

fn encode_batch(enc: &mut CborEncoder<'_>, batch: &TransactionBatch) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("batch_id")?;
    enc.u64(batch.batch_id.get())?;
    enc.str("transactions")?;
    enc.array(batch.transactions.len() as u64)?;
    for txn in &batch.transactions {
        enc.map(6)?;
        enc.str("txn_id")?;
        enc.u64(txn.txn_id.get())?;
        enc.str("sequence_id")?;
        enc.u64(txn.sequence_id.get())?;
        enc.str("lock_ids")?;
        enc.array(txn.lock_ids.len() as u64)?;
        for lock in &txn.lock_ids {
            encode_lock_id(enc, lock)?;
        }
        enc.str("deltas")?;
        enc.array(txn.deltas.len() as u64)?;
        for delta in &txn.deltas {
            encode_delta(enc, delta)?;
        }
        enc.str("notifies")?;
        enc.array(txn.notifies.len() as u64)?;
        for notify in &txn.notifies {
            enc.map(3)?;
            enc.str("lock")?;
            encode_lock_id(enc, &notify.lock)?;
            enc.str("thread")?;
            enc.u64(notify.thread.get())?;
            enc.str("kind")?;
            enc.str(notify.kind.as_str())?;
        }
        enc.str("txn_type")?;
        enc.str(txn.txn_type.as_str())?;
    }
    Ok(())
}

fn encode_lock_request(enc: &mut CborEncoder<'_>, req: &LockRequest) -> Result<(), ProtoEncodeError> {
    let level = match req.op {
        LockOp::Acquire { level } | LockOp::TryAcquire { level } => Some(level),
        _ => None,
    };
    let timeout = match req.op {
        LockOp::Wait { timeout_ms } => Some(timeout_ms),
        _ => None,
    };
    enc.map(3 + u64::from(level.is_some()) + u64::from(timeout.is_some()))?;
    enc.str("lock")?;
    encode_lock_id(enc, &req.lock)?;
    enc.str("thread")?;
    enc.u64(req.thread.get())?;
    enc.str("op")?;
    enc.str(req.op.as_str())?;
    if let Some(level) = level {
        enc.str("level")?;
        enc.str(level.as_str())?;
    }
    if let Some(timeout_ms) = timeout {
        enc.str("timeout_ms")?;
        encode_opt_u64(enc, timeout_ms)?;
    }
    Ok(())
}

fn encode_lock_id(enc: &mut CborEncoder<'_>, lock: &LockId) -> Result<(), ProtoEncodeError> {
    enc.map(1)?;
    match lock {
        LockId::Named(name) => {
            enc.str("name")?;
            enc.str(name)?;
        }
        LockId::Object(id) => {
            enc.str("object")?;
            enc.u64(id.get())?;
        }
    }
    Ok(())
}

fn encode_lock_context(enc: &mut CborEncoder<'_>, ctx: &LockContext) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("lock")?;
    encode_lock_id(enc, &ctx.lock)?;
    enc.str("thread")?;
    enc.u64(ctx.thread.get())?;
    enc.str("level")?;
    enc.str(ctx.level.as_str())?;
    enc.str("timeout_ms")?;
    encode_opt_u64(enc, ctx.timeout_ms)?;
    Ok(())
}

fn encode_delta(enc: &mut CborEncoder<'_>, delta: &ObjectDelta) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("object_id")?;
    enc.u64(delta.object_id.get())?;
    enc.str("new_object")?;
    enc.bool(delta.new_object)?;
    enc.str("payload")?;
    enc.bytes(&delta.payload)?;
    Ok(())
}

fn encode_range(enc: &mut CborEncoder<'_>, range: &ObjectIdRange) -> Result<(), ProtoEncodeError> {
    enc.map(2)?;
    enc.str("start")?;
    enc.u64(range.start.get())?;
    enc.str("end")?;
    enc.u64(range.end.get())?;
    Ok(())
}

fn encode_u64s(
    enc: &mut CborEncoder<'_>,
    values: impl ExactSizeIterator<Item = u64>,
) -> Result<(), ProtoEncodeError> {
    enc.array(values.len() as u64)?;
    for value in values {
        enc.u64(value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode_client_message(bytes: &[u8], limits: &Limits) -> Result<ClientMessage, ProtoDecodeError> {
    let raw = split_envelope(bytes, APP_PROTOCOL_VERSION, limits)?;
    let mut dec = Decoder::new(raw.body);
    let msg = match raw.message_type {
        "handshake" => ClientMessage::Handshake(decode_handshake(&mut dec, limits)?),
        "commit" => ClientMessage::Commit(decode_batch(&mut dec, limits)?),
        "lock" => ClientMessage::Lock(decode_lock_request(&mut dec, limits)?),
        "request_object_ids" => {
            let mut count = None;
            for _ in 0..decode_map_len(&mut dec, limits, 1)? {
                match decode_text(&mut dec, limits)? {
                    "count" => count = Some(dec.u64()?),
                    _ => skip_value(&mut dec)?,
                }
            }
            ClientMessage::RequestObjectIds {
                count: required(count, "count")?,
            }
        }
        "subscribe" => {
            let mut object_ids = None;
            for _ in 0..decode_map_len(&mut dec, limits, 1)? {
                match decode_text(&mut dec, limits)? {
                    "object_ids" => {
                        object_ids = Some(decode_u64s(&mut dec, limits, 2, ObjectId::new)?)
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            ClientMessage::Subscribe {
                object_ids: required(object_ids, "object_ids")?,
            }
        }
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    ensure_consumed(&dec)?;
    Ok(msg)
}

pub fn decode_server_message(bytes: &[u8], limits: &Limits) -> Result<ServerMessage, ProtoDecodeError> {
    let raw = split_envelope(bytes, APP_PROTOCOL_VERSION, limits)?;
    let mut dec = Decoder::new(raw.body);
    let msg = match raw.message_type {
        "handshake_ack" => ServerMessage::HandshakeAck(decode_handshake_ack(&mut dec, limits)?),
        "handshake_reject" => {
            ServerMessage::HandshakeReject(decode_error_payload(&mut dec, limits, 1)?)
        }
        "error" => ServerMessage::Error(decode_error_payload(&mut dec, limits, 1)?),
        "broadcast" => ServerMessage::Broadcast(decode_broadcast(&mut dec, limits)?),
        "txn_ack" => {
            let mut txn_id = None;
            let mut sequence_id = None;
            for _ in 0..decode_map_len(&mut dec, limits, 1)? {
                match decode_text(&mut dec, limits)? {
                    "txn_id" => txn_id = Some(TransactionId::new(dec.u64()?)),
                    "sequence_id" => sequence_id = Some(SequenceId::new(dec.u64()?)),
                    _ => skip_value(&mut dec)?,
                }
            }
            ServerMessage::TxnAck {
                txn_id: required(txn_id, "txn_id")?,
                sequence_id: required(sequence_id, "sequence_id")?,
            }
        }
        "lock_response" => ServerMessage::LockResponse(decode_lock_response(&mut dec, limits)?),
        "object_ids" => ServerMessage::ObjectIds(decode_range(&mut dec, limits, 1)?),
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    ensure_consumed(&dec)?;
    Ok(msg)
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ProtoDecodeError> {
    value.ok_or(ProtoDecodeError::MissingField(field))
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ProtoDecodeError {
    ProtoDecodeError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn decode_handshake(dec: &mut Decoder, limits: &Limits) -> Result<ClientHandshake, ProtoDecodeError> {
    let mut client_id = None;
    let mut client_version = None;
    let mut object_ids = Vec::new();
    let mut lock_contexts = Vec::new();
    let mut wait_contexts = Vec::new();
    let mut pending_lock_contexts = Vec::new();
    let mut pending_try_lock_contexts = Vec::new();
    let mut resent_sequence_ids = Vec::new();
    let mut resent_txn_ids = Vec::new();
    let mut request_object_ids = false;
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "client_id" => client_id = Some(ClientId::new(dec.u64()?)),
            "client_version" => client_version = Some(decode_text(dec, limits)?.to_string()),
            "object_ids" => object_ids = decode_u64s(dec, limits, 2, ObjectId::new)?,
            "lock_contexts" => lock_contexts = decode_lock_contexts(dec, limits)?,
            "wait_contexts" => wait_contexts = decode_lock_contexts(dec, limits)?,
            "pending_lock_contexts" => pending_lock_contexts = decode_lock_contexts(dec, limits)?,
            "pending_try_lock_contexts" => {
                pending_try_lock_contexts = decode_lock_contexts(dec, limits)?
            }
            "resent_sequence_ids" => {
                resent_sequence_ids = decode_u64s(dec, limits, 2, SequenceId::new)?
            }
            "resent_txn_ids" => resent_txn_ids = decode_u64s(dec, limits, 2, TransactionId::new)?,
            "request_object_ids" => request_object_ids = dec.bool()?,
            _ => skip_value(dec)?,
        }
    }
    Ok(ClientHandshake {
        client_id: required(client_id, "client_id")?,
        client_version: required(client_version, "client_version")?,
        object_ids,
        lock_contexts,
        wait_contexts,
        pending_lock_contexts,
        pending_try_lock_contexts,
        resent_sequence_ids,
        resent_txn_ids,
        request_object_ids,
    })
}

fn decode_lock_contexts(dec: &mut Decoder, limits: &Limits) -> Result<Vec<LockContext>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits, 2)?;
    let mut contexts = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        let mut lock = None;
        let mut thread = None;
        let mut level = None;
        let mut timeout_ms = None;
        for _ in 0..decode_map_len(dec, limits, 3)? {
            match decode_text(dec, limits)? {
                "lock" => lock = Some(decode_lock_id(dec, limits, 4)?),
                "thread" => thread = Some(ThreadId::new(dec.u64()?)),
                "level" => level = Some(decode_level(dec, limits)?),
                "timeout_ms" => timeout_ms = decode_opt_u64(dec)?,
                _ => skip_value(dec)?,
            }
        }
        contexts.push(LockContext {
            lock: required(lock, "lock")?,
            thread: required(thread, "thread")?,
            level: required(level, "level")?,
            timeout_ms,
        });
    }
    Ok(contexts)
}

fn decode_batch(dec: &mut Decoder, limits: &Limits) -> Result<TransactionBatch, ProtoDecodeError> {
    let mut batch_id = None;
    let mut transactions = None;
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "batch_id" => batch_id = Some(TxnBatchId::new(dec.u64()?)),
            "transactions" => {
                let len = decode_array_len(dec, limits, 2)?;
                if len > limits.max_txns_per_batch {
                    return Err(ProtoDecodeError::DecodeLimit("max_txns_per_batch"));
                }
                let mut txns = Vec::with_capacity(len);
                for _ in 0..len {
                    txns.push(decode_txn_record(dec, limits)?);
                }
                transactions = Some(txns);
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(TransactionBatch {
        batch_id: required(batch_id, "batch_id")?,
        transactions: required(transactions, "transactions")?,
    })
}

fn decode_txn_record(dec: &mut Decoder, limits: &Limits) -> Result<TxnRecord, ProtoDecodeError> {
    let mut txn_id = None;
    let mut sequence_id = None;
    let mut lock_ids = Vec::new();
    let mut deltas = Vec::new();
    let mut notifies = Vec::new();
    let mut txn_type = TxnType::Normal;
    for _ in 0..decode_map_len(dec, limits, 3)? {
        match decode_text(dec, limits)? {
            "txn_id" => txn_id = Some(TransactionId::new(dec.u64()?)),
            "sequence_id" => {
                let raw = dec.u64()?;
                if raw == 0 {
                    return Err(invalid("sequence_id", "sequence ids start at 1"));
                }
                sequence_id = Some(SequenceId::new(raw));
            }
            "lock_ids" => {
                let len = decode_array_len(dec, limits, 4)?;
                for _ in 0..len {
                    lock_ids.push(decode_lock_id(dec, limits, 5)?);
                }
            }
            "deltas" => {
                let len = decode_array_len(dec, limits, 4)?;
                if len > limits.max_deltas_per_txn {
                    return Err(ProtoDecodeError::DecodeLimit("max_deltas_per_txn"));
                }
                for _ in 0..len {
                    deltas.push(decode_delta(dec, limits, 5)?);
                }
            }
            "notifies" => {
                let len = decode_array_len(dec, limits, 4)?;
                for _ in 0..len {
                    notifies.push(decode_notify(dec, limits, 5)?);
                }
            }
            "txn_type" => {
                let raw = decode_text(dec, limits)?;
                txn_type = TxnType::parse(raw)
                    .ok_or_else(|| invalid("txn_type", format!("unknown transaction type {raw}")))?;
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(TxnRecord {
        txn_id: required(txn_id, "txn_id")?,
        sequence_id: required(sequence_id, "sequence_id")?,
        lock_ids,
        deltas,
        notifies,
        txn_type,
    })
}

fn decode_notify(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<NotifyRequest, ProtoDecodeError> {
    let mut lock = None;
    let mut thread = None;
    let mut kind = None;
    for _ in 0..decode_map_len(dec, limits, depth)? {
        match decode_text(dec, limits)? {
            "lock" => lock = Some(decode_lock_id(dec, limits, depth + 1)?),
            "thread" => thread = Some(ThreadId::new(dec.u64()?)),
            "kind" => {
                let raw = decode_text(dec, limits)?;
                kind = Some(
                    NotifyKind::parse(raw)
                        .ok_or_else(|| invalid("kind", format!("unknown notify kind {raw}")))?,
                );
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(NotifyRequest {
        lock: required(lock, "lock")?,
        thread: required(thread, "thread")?,
        kind: required(kind, "kind")?,
    })
}

fn decode_lock_request(dec: &mut Decoder, limits: &Limits) -> Result<LockRequest, ProtoDecodeError> {
    let mut lock = None;
    let mut thread = None;
    let mut op = None;
    let mut level = None;
    let mut timeout_ms = None;
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "lock" => lock = Some(decode_lock_id(dec, limits, 2)?),
            "thread" => thread = Some(ThreadId::new(dec.u64()?)),
            "op" => op = Some(decode_text(dec, limits)?),
            "level" => level = Some(decode_level(dec, limits)?),
            "timeout_ms" => timeout_ms = decode_opt_u64(dec)?,
            _ => skip_value(dec)?,
        }
    }
    let op = match required(op, "op")? {
        "acquire" => LockOp::Acquire {
            level: required(level, "level")?,
        },
        "try_acquire" => LockOp::TryAcquire {
            level: required(level, "level")?,
        },
        "release" => LockOp::Release,
        "wait" => LockOp::Wait { timeout_ms },
        "cancel" => LockOp::Cancel,
        other => return Err(invalid("op", format!("unknown lock op {other}"))),
    };
    Ok(LockRequest {
        lock: required(lock, "lock")?,
        thread: required(thread, "thread")?,
        op,
    })
}

fn decode_handshake_ack(dec: &mut Decoder, limits: &Limits) -> Result<HandshakeAck, ProtoDecodeError> {
    let mut acknowledged = Vec::new();
    let mut pending = Vec::new();
    let mut object_ids = None;
    let mut server_version = None;
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "acknowledged" => acknowledged = decode_u64s(dec, limits, 2, SequenceId::new)?,
            "pending" => pending = decode_u64s(dec, limits, 2, SequenceId::new)?,
            "object_ids" => {
                if matches!(dec.datatype()?, minicbor::data::Type::Null) {
                    dec.null()?;
                } else {
                    object_ids = Some(decode_range(dec, limits, 2)?);
                }
            }
            "server_version" => server_version = Some(decode_text(dec, limits)?.to_string()),
            _ => skip_value(dec)?,
        }
    }
    Ok(HandshakeAck {
        acknowledged,
        pending,
        object_ids,
        server_version: required(server_version, "server_version")?,
    })
}

fn decode_broadcast(dec: &mut Decoder, limits: &Limits) -> Result<Broadcast, ProtoDecodeError> {
    let mut origin = None;
    let mut gid = None;
    let mut txn_id = None;
    let mut deltas = Vec::new();
    let mut notified = Vec::new();
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "origin" => origin = Some(ClientId::new(dec.u64()?)),
            "gid" => gid = Some(GlobalTransactionId::new(dec.u64()?)),
            "txn_id" => txn_id = Some(TransactionId::new(dec.u64()?)),
            "deltas" => {
                for _ in 0..decode_array_len(dec, limits, 2)? {
                    deltas.push(decode_delta(dec, limits, 3)?);
                }
            }
            "notified" => {
                for _ in 0..decode_array_len(dec, limits, 2)? {
                    let mut lock = None;
                    let mut thread = None;
                    let mut level = None;
                    for _ in 0..decode_map_len(dec, limits, 3)? {
                        match decode_text(dec, limits)? {
                            "lock" => lock = Some(decode_lock_id(dec, limits, 4)?),
                            "thread" => thread = Some(ThreadId::new(dec.u64()?)),
                            "level" => level = Some(decode_level(dec, limits)?),
                            _ => skip_value(dec)?,
                        }
                    }
                    notified.push(NotifiedWaiter {
                        lock: required(lock, "lock")?,
                        thread: required(thread, "thread")?,
                        level: required(level, "level")?,
                    });
                }
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(Broadcast {
        origin: required(origin, "origin")?,
        gid: required(gid, "gid")?,
        txn_id: required(txn_id, "txn_id")?,
        deltas,
        notified,
    })
}

fn decode_lock_response(dec: &mut Decoder, limits: &Limits) -> Result<LockResponse, ProtoDecodeError> {
    let mut lock = None;
    let mut thread = None;
    let mut level = None;
    let mut outcome = None;
    for _ in 0..decode_map_len(dec, limits, 1)? {
        match decode_text(dec, limits)? {
            "lock" => lock = Some(decode_lock_id(dec, limits, 2)?),
            "thread" => thread = Some(ThreadId::new(dec.u64()?)),
            "level" => level = Some(decode_level(dec, limits)?),
            "outcome" => {
                let raw = decode_text(dec, limits)?;
                outcome = Some(
                    LockOutcome::parse(raw)
                        .ok_or_else(|| invalid("outcome", format!("unknown outcome {raw}")))?,
                );
            }
            _ => skip_value(dec)?,
        }
    }
    Ok(LockResponse {
        lock: required(lock, "lock")?,
        thread: required(thread, "thread")?,
        level: required(level, "level")?,
        outcome: required(outcome, "outcome")?,
    })
}

fn decode_lock_id(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<LockId, ProtoDecodeError> {
    if decode_map_len(dec, limits, depth)? != 1 {
        return Err(invalid("lock", "expected exactly one of name/object"));
    }
    match decode_text(dec, limits)? {
        "name" => Ok(LockId::Named(decode_text(dec, limits)?.to_string())),
        "object" => Ok(LockId::Object(ObjectId::new(dec.u64()?))),
        other => Err(invalid("lock", format!("unknown lock kind {other}"))),
    }
}

fn decode_level(dec: &mut Decoder, limits: &Limits) -> Result<LockLevel, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    LockLevel::parse(raw).ok_or_else(|| invalid("level", format!("unknown lock level {raw}")))
}

fn decode_delta(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<ObjectDelta, ProtoDecodeError> {
    let mut object_id = None;
    let mut new_object = None;
    let mut payload = None;
    for _ in 0..decode_map_len(dec, limits, depth)? {
        match decode_text(dec, limits)? {
            "object_id" => object_id = Some(ObjectId::new(dec.u64()?)),
            "new_object" => new_object = Some(dec.bool()?),
            "payload" => payload = Some(Bytes::copy_from_slice(decode_bytes(dec, limits, "payload")?)),
            _ => skip_value(dec)?,
        }
    }
    Ok(ObjectDelta {
        object_id: required(object_id, "object_id")?,
        new_object: required(new_object, "new_object")?,
        payload: required(payload, "payload")?,
    })
}

fn decode_range(dec: &mut Decoder, limits: &Limits, depth: usize) -> Result<ObjectIdRange, ProtoDecodeError> {
    let mut start = None;
    let mut end = None;
    for _ in 0..decode_map_len(dec, limits, depth)? {
        match decode_text(dec, limits)? {
            "start" => start = Some(ObjectId::new(dec.u64()?)),
            "end" => end = Some(ObjectId::new(dec.u64()?)),
            _ => skip_value(dec)?,
        }
    }
    let range = ObjectIdRange {
        start: required(start, "start")?,
        end: required(end, "end")?,
    };
    if range.end < range.start {
        return Err(invalid("end", "object id range ends before it starts"));
    }
    Ok(range)
}

fn decode_u64s<T>(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
    wrap: impl Fn(u64) -> T,
) -> Result<Vec<T>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits, depth)?;
    let mut out = Vec::with_capacity(len.min(4096));
    for _ in 0..len {
        out.push(wrap(dec.u64()?));
    }
    Ok(out)
}
