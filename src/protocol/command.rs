//! The decoded command union consumed by the proxy core.
//!
//! Real deployments sit this on top of the cluster's actual wire schema
//! (protobuf-tagged command headers); the proxy core only needs the fields
//! enumerated here, so encode/decode is a small hand-rolled tag+fields
//! scheme rather than a full schema compiler.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, ProxyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupType {
    Connect,
    Redirect,
    Failed,
}

impl LookupType {
    fn tag(self) -> u8 {
        match self {
            LookupType::Connect => 0,
            LookupType::Redirect => 1,
            LookupType::Failed => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ProxyError> {
        Ok(match tag {
            0 => LookupType::Connect,
            1 => LookupType::Redirect,
            2 => LookupType::Failed,
            _ => return Err(ProxyError::protocol("invalid lookup response type")),
        })
    }
}

/// Every command that the proxy core dispatches on. `Connect` /
/// `AuthResponse` / `Ping` / `Pong` plus the lookup/metadata/schema family
/// are control-plane (spec §4.2); everything else is data-plane and
/// triggers the splice transition on first receipt.
#[derive(Debug, Clone)]
pub enum Command {
    Connect {
        protocol_version: u32,
        proxy_to_broker_url: Option<String>,
        auth_method_name: Option<String>,
        auth_data: Option<Bytes>,
    },
    Connected {
        protocol_version: u32,
        max_message_size: Option<u32>,
    },
    AuthChallenge {
        auth_method_name: String,
        auth_data: Bytes,
    },
    AuthResponse {
        auth_method_name: String,
        auth_data: Bytes,
    },
    Ping,
    Pong,
    Lookup {
        request_id: u64,
        topic: String,
        authoritative: bool,
    },
    LookupResponse {
        request_id: u64,
        response_type: LookupType,
        broker_service_url: Option<String>,
        broker_service_url_tls: Option<String>,
        authoritative: bool,
        proxy_through_service_url: bool,
    },
    PartitionedMetadata {
        request_id: u64,
        topic: String,
    },
    PartitionedMetadataResponse {
        request_id: u64,
        partitions: u32,
    },
    GetSchema {
        request_id: u64,
        topic: String,
    },
    GetSchemaResponse {
        request_id: u64,
        schema: Option<Bytes>,
    },
    GetOrCreateSchema {
        request_id: u64,
        topic: String,
        schema: Bytes,
    },
    GetOrCreateSchemaResponse {
        request_id: u64,
        schema_version: Option<Bytes>,
    },
    CloseConsumer {
        consumer_id: u64,
        request_id: u64,
    },
    CloseProducer {
        producer_id: u64,
        request_id: u64,
    },
    Error {
        request_id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    Producer {
        request_id: u64,
        producer_id: u64,
        topic: String,
    },
    ProducerSuccess {
        request_id: u64,
        producer_name: String,
    },
    Subscribe {
        request_id: u64,
        consumer_id: u64,
        topic: String,
        subscription: String,
    },
    Send {
        producer_id: u64,
        sequence_id: u64,
    },
    SendReceipt {
        producer_id: u64,
        sequence_id: u64,
    },
    Ack {
        consumer_id: u64,
    },
    Flow {
        consumer_id: u64,
        message_permits: u32,
    },
    Unsubscribe {
        consumer_id: u64,
        request_id: u64,
    },
    Seek {
        consumer_id: u64,
        request_id: u64,
    },
    SeekResponse {
        request_id: u64,
    },
    RedeliverUnacknowledgedMessages {
        consumer_id: u64,
    },
    GetLastMessageId {
        consumer_id: u64,
        request_id: u64,
    },
    GetLastMessageIdResponse {
        request_id: u64,
    },
    ActiveConsumerChange {
        consumer_id: u64,
        is_active: bool,
    },
    ReachedEndOfTopic {
        consumer_id: u64,
    },
}

impl Command {
    /// True for the control-plane family that the proxy always handles
    /// locally (spec §4.2). Note `Connect`/`AuthResponse`/`Ping` are
    /// control-plane but are handled by the connection state machine
    /// directly rather than the lookup handler.
    pub fn is_control_plane(&self) -> bool {
        matches!(
            self,
            Command::Connect { .. }
                | Command::AuthChallenge { .. }
                | Command::AuthResponse { .. }
                | Command::Ping
                | Command::Pong
                | Command::Lookup { .. }
                | Command::LookupResponse { .. }
                | Command::PartitionedMetadata { .. }
                | Command::PartitionedMetadataResponse { .. }
                | Command::GetSchema { .. }
                | Command::GetSchemaResponse { .. }
                | Command::GetOrCreateSchema { .. }
                | Command::GetOrCreateSchemaResponse { .. }
                | Command::CloseConsumer { .. }
                | Command::CloseProducer { .. }
                | Command::Error { .. }
        )
    }

    pub fn is_lookup_family(&self) -> bool {
        matches!(
            self,
            Command::Lookup { .. }
                | Command::PartitionedMetadata { .. }
                | Command::GetSchema { .. }
                | Command::GetOrCreateSchema { .. }
        )
    }

    /// `request_id` carried by those commands that have one, for error
    /// correlation (spec §4.3/§7).
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Command::Lookup { request_id, .. }
            | Command::PartitionedMetadata { request_id, .. }
            | Command::PartitionedMetadataResponse { request_id, .. }
            | Command::GetSchema { request_id, .. }
            | Command::GetSchemaResponse { request_id, .. }
            | Command::GetOrCreateSchema { request_id, .. }
            | Command::GetOrCreateSchemaResponse { request_id, .. }
            | Command::CloseConsumer { request_id, .. }
            | Command::CloseProducer { request_id, .. }
            | Command::Producer { request_id, .. }
            | Command::ProducerSuccess { request_id, .. }
            | Command::Subscribe { request_id, .. }
            | Command::Unsubscribe { request_id, .. }
            | Command::Seek { request_id, .. }
            | Command::SeekResponse { request_id }
            | Command::GetLastMessageId { request_id, .. }
            | Command::GetLastMessageIdResponse { request_id }
            | Command::LookupResponse { request_id, .. } => Some(*request_id),
            Command::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Command::Lookup { topic, .. }
            | Command::PartitionedMetadata { topic, .. }
            | Command::GetSchema { topic, .. }
            | Command::GetOrCreateSchema { topic, .. }
            | Command::Producer { topic, .. }
            | Command::Subscribe { topic, .. } => Some(topic),
            _ => None,
        }
    }
}

// --- wire helpers -----------------------------------------------------

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn put_opt_bytes(buf: &mut BytesMut, b: &Option<Bytes>) {
    match b {
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
        None => buf.put_u8(0),
    }
}

fn get_str(buf: &mut Bytes) -> Result<String, ProxyError> {
    if buf.remaining() < 2 {
        return Err(ProxyError::protocol("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ProxyError::protocol("truncated string body"));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProxyError::protocol("invalid utf8 in string"))
}

fn get_opt_str(buf: &mut Bytes) -> Result<Option<String>, ProxyError> {
    if !buf.has_remaining() {
        return Err(ProxyError::protocol("truncated option tag"));
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(get_str(buf)?)),
        _ => Err(ProxyError::protocol("invalid option tag")),
    }
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ProxyError> {
    if buf.remaining() < 4 {
        return Err(ProxyError::protocol("truncated bytes length"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProxyError::protocol("truncated bytes body"));
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_opt_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, ProxyError> {
    if !buf.has_remaining() {
        return Err(ProxyError::protocol("truncated option tag"));
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(get_bytes(buf)?)),
        _ => Err(ProxyError::protocol("invalid option tag")),
    }
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProxyError> {
    if buf.remaining() < n {
        Err(ProxyError::protocol("truncated frame"))
    } else {
        Ok(())
    }
}

macro_rules! tag {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        mod cmd_tag {
            $(pub const $name: u8 = $val;)*
        }
    };
}

tag! {
    Connect = 1,
    Connected = 2,
    AuthChallenge = 3,
    AuthResponse = 4,
    Ping = 5,
    Pong = 6,
    Lookup = 7,
    LookupResponse = 8,
    PartitionedMetadata = 9,
    PartitionedMetadataResponse = 10,
    GetSchema = 11,
    GetSchemaResponse = 12,
    GetOrCreateSchema = 13,
    GetOrCreateSchemaResponse = 14,
    CloseConsumer = 15,
    CloseProducer = 16,
    Error = 17,
    Producer = 18,
    ProducerSuccess = 19,
    Subscribe = 20,
    Send = 21,
    SendReceipt = 22,
    Ack = 23,
    Flow = 24,
    Unsubscribe = 25,
    Seek = 26,
    SeekResponse = 27,
    RedeliverUnacknowledgedMessages = 28,
    GetLastMessageId = 29,
    GetLastMessageIdResponse = 30,
    ActiveConsumerChange = 31,
    ReachedEndOfTopic = 32,
}

fn error_kind_tag(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::ProtocolError => 0,
        ErrorKind::AuthenticationError => 1,
        ErrorKind::AuthorizationError => 2,
        ErrorKind::TooManyRequests => 3,
        ErrorKind::ServiceNotReady => 4,
        ErrorKind::MetadataError => 5,
        ErrorKind::UnknownError => 6,
    }
}

fn error_kind_from_tag(tag: u8) -> ErrorKind {
    match tag {
        0 => ErrorKind::ProtocolError,
        1 => ErrorKind::AuthenticationError,
        2 => ErrorKind::AuthorizationError,
        3 => ErrorKind::TooManyRequests,
        4 => ErrorKind::ServiceNotReady,
        5 => ErrorKind::MetadataError,
        _ => ErrorKind::UnknownError,
    }
}

impl Command {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Connect {
                protocol_version,
                proxy_to_broker_url,
                auth_method_name,
                auth_data,
            } => {
                buf.put_u8(cmd_tag::Connect);
                buf.put_u32(*protocol_version);
                put_opt_str(buf, proxy_to_broker_url);
                put_opt_str(buf, auth_method_name);
                put_opt_bytes(buf, auth_data);
            }
            Command::Connected {
                protocol_version,
                max_message_size,
            } => {
                buf.put_u8(cmd_tag::Connected);
                buf.put_u32(*protocol_version);
                match max_message_size {
                    Some(v) => {
                        buf.put_u8(1);
                        buf.put_u32(*v);
                    }
                    None => buf.put_u8(0),
                }
            }
            Command::AuthChallenge {
                auth_method_name,
                auth_data,
            } => {
                buf.put_u8(cmd_tag::AuthChallenge);
                put_str(buf, auth_method_name);
                put_bytes(buf, auth_data);
            }
            Command::AuthResponse {
                auth_method_name,
                auth_data,
            } => {
                buf.put_u8(cmd_tag::AuthResponse);
                put_str(buf, auth_method_name);
                put_bytes(buf, auth_data);
            }
            Command::Ping => buf.put_u8(cmd_tag::Ping),
            Command::Pong => buf.put_u8(cmd_tag::Pong),
            Command::Lookup {
                request_id,
                topic,
                authoritative,
            } => {
                buf.put_u8(cmd_tag::Lookup);
                buf.put_u64(*request_id);
                put_str(buf, topic);
                buf.put_u8(*authoritative as u8);
            }
            Command::LookupResponse {
                request_id,
                response_type,
                broker_service_url,
                broker_service_url_tls,
                authoritative,
                proxy_through_service_url,
            } => {
                buf.put_u8(cmd_tag::LookupResponse);
                buf.put_u64(*request_id);
                buf.put_u8(response_type.tag());
                put_opt_str(buf, broker_service_url);
                put_opt_str(buf, broker_service_url_tls);
                buf.put_u8(*authoritative as u8);
                buf.put_u8(*proxy_through_service_url as u8);
            }
            Command::PartitionedMetadata { request_id, topic } => {
                buf.put_u8(cmd_tag::PartitionedMetadata);
                buf.put_u64(*request_id);
                put_str(buf, topic);
            }
            Command::PartitionedMetadataResponse {
                request_id,
                partitions,
            } => {
                buf.put_u8(cmd_tag::PartitionedMetadataResponse);
                buf.put_u64(*request_id);
                buf.put_u32(*partitions);
            }
            Command::GetSchema { request_id, topic } => {
                buf.put_u8(cmd_tag::GetSchema);
                buf.put_u64(*request_id);
                put_str(buf, topic);
            }
            Command::GetSchemaResponse { request_id, schema } => {
                buf.put_u8(cmd_tag::GetSchemaResponse);
                buf.put_u64(*request_id);
                put_opt_bytes(buf, schema);
            }
            Command::GetOrCreateSchema {
                request_id,
                topic,
                schema,
            } => {
                buf.put_u8(cmd_tag::GetOrCreateSchema);
                buf.put_u64(*request_id);
                put_str(buf, topic);
                put_bytes(buf, schema);
            }
            Command::GetOrCreateSchemaResponse {
                request_id,
                schema_version,
            } => {
                buf.put_u8(cmd_tag::GetOrCreateSchemaResponse);
                buf.put_u64(*request_id);
                put_opt_bytes(buf, schema_version);
            }
            Command::CloseConsumer {
                consumer_id,
                request_id,
            } => {
                buf.put_u8(cmd_tag::CloseConsumer);
                buf.put_u64(*consumer_id);
                buf.put_u64(*request_id);
            }
            Command::CloseProducer {
                producer_id,
                request_id,
            } => {
                buf.put_u8(cmd_tag::CloseProducer);
                buf.put_u64(*producer_id);
                buf.put_u64(*request_id);
            }
            Command::Error {
                request_id,
                kind,
                message,
            } => {
                buf.put_u8(cmd_tag::Error);
                match request_id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_u64(*id);
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u8(error_kind_tag(*kind));
                put_str(buf, message);
            }
            Command::Producer {
                request_id,
                producer_id,
                topic,
            } => {
                buf.put_u8(cmd_tag::Producer);
                buf.put_u64(*request_id);
                buf.put_u64(*producer_id);
                put_str(buf, topic);
            }
            Command::ProducerSuccess {
                request_id,
                producer_name,
            } => {
                buf.put_u8(cmd_tag::ProducerSuccess);
                buf.put_u64(*request_id);
                put_str(buf, producer_name);
            }
            Command::Subscribe {
                request_id,
                consumer_id,
                topic,
                subscription,
            } => {
                buf.put_u8(cmd_tag::Subscribe);
                buf.put_u64(*request_id);
                buf.put_u64(*consumer_id);
                put_str(buf, topic);
                put_str(buf, subscription);
            }
            Command::Send {
                producer_id,
                sequence_id,
            } => {
                buf.put_u8(cmd_tag::Send);
                buf.put_u64(*producer_id);
                buf.put_u64(*sequence_id);
            }
            Command::SendReceipt {
                producer_id,
                sequence_id,
            } => {
                buf.put_u8(cmd_tag::SendReceipt);
                buf.put_u64(*producer_id);
                buf.put_u64(*sequence_id);
            }
            Command::Ack { consumer_id } => {
                buf.put_u8(cmd_tag::Ack);
                buf.put_u64(*consumer_id);
            }
            Command::Flow {
                consumer_id,
                message_permits,
            } => {
                buf.put_u8(cmd_tag::Flow);
                buf.put_u64(*consumer_id);
                buf.put_u32(*message_permits);
            }
            Command::Unsubscribe {
                consumer_id,
                request_id,
            } => {
                buf.put_u8(cmd_tag::Unsubscribe);
                buf.put_u64(*consumer_id);
                buf.put_u64(*request_id);
            }
            Command::Seek {
                consumer_id,
                request_id,
            } => {
                buf.put_u8(cmd_tag::Seek);
                buf.put_u64(*consumer_id);
                buf.put_u64(*request_id);
            }
            Command::SeekResponse { request_id } => {
                buf.put_u8(cmd_tag::SeekResponse);
                buf.put_u64(*request_id);
            }
            Command::RedeliverUnacknowledgedMessages { consumer_id } => {
                buf.put_u8(cmd_tag::RedeliverUnacknowledgedMessages);
                buf.put_u64(*consumer_id);
            }
            Command::GetLastMessageId {
                consumer_id,
                request_id,
            } => {
                buf.put_u8(cmd_tag::GetLastMessageId);
                buf.put_u64(*consumer_id);
                buf.put_u64(*request_id);
            }
            Command::GetLastMessageIdResponse { request_id } => {
                buf.put_u8(cmd_tag::GetLastMessageIdResponse);
                buf.put_u64(*request_id);
            }
            Command::ActiveConsumerChange {
                consumer_id,
                is_active,
            } => {
                buf.put_u8(cmd_tag::ActiveConsumerChange);
                buf.put_u64(*consumer_id);
                buf.put_u8(*is_active as u8);
            }
            Command::ReachedEndOfTopic { consumer_id } => {
                buf.put_u8(cmd_tag::ReachedEndOfTopic);
                buf.put_u64(*consumer_id);
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Command, ProxyError> {
        need(&buf, 1)?;
        let tag = buf.get_u8();
        Ok(match tag {
            cmd_tag::Connect => {
                need(&buf, 4)?;
                let protocol_version = buf.get_u32();
                Command::Connect {
                    protocol_version,
                    proxy_to_broker_url: get_opt_str(&mut buf)?,
                    auth_method_name: get_opt_str(&mut buf)?,
                    auth_data: get_opt_bytes(&mut buf)?,
                }
            }
            cmd_tag::Connected => {
                need(&buf, 4)?;
                let protocol_version = buf.get_u32();
                need(&buf, 1)?;
                let has_max = buf.get_u8();
                let max_message_size = if has_max == 1 {
                    need(&buf, 4)?;
                    Some(buf.get_u32())
                } else {
                    None
                };
                Command::Connected {
                    protocol_version,
                    max_message_size,
                }
            }
            cmd_tag::AuthChallenge => Command::AuthChallenge {
                auth_method_name: get_str(&mut buf)?,
                auth_data: get_bytes(&mut buf)?,
            },
            cmd_tag::AuthResponse => Command::AuthResponse {
                auth_method_name: get_str(&mut buf)?,
                auth_data: get_bytes(&mut buf)?,
            },
            cmd_tag::Ping => Command::Ping,
            cmd_tag::Pong => Command::Pong,
            cmd_tag::Lookup => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                let topic = get_str(&mut buf)?;
                need(&buf, 1)?;
                let authoritative = buf.get_u8() != 0;
                Command::Lookup {
                    request_id,
                    topic,
                    authoritative,
                }
            }
            cmd_tag::LookupResponse => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                need(&buf, 1)?;
                let response_type = LookupType::from_tag(buf.get_u8())?;
                let broker_service_url = get_opt_str(&mut buf)?;
                let broker_service_url_tls = get_opt_str(&mut buf)?;
                need(&buf, 2)?;
                let authoritative = buf.get_u8() != 0;
                let proxy_through_service_url = buf.get_u8() != 0;
                Command::LookupResponse {
                    request_id,
                    response_type,
                    broker_service_url,
                    broker_service_url_tls,
                    authoritative,
                    proxy_through_service_url,
                }
            }
            cmd_tag::PartitionedMetadata => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                Command::PartitionedMetadata {
                    request_id,
                    topic: get_str(&mut buf)?,
                }
            }
            cmd_tag::PartitionedMetadataResponse => {
                need(&buf, 12)?;
                let request_id = buf.get_u64();
                let partitions = buf.get_u32();
                Command::PartitionedMetadataResponse {
                    request_id,
                    partitions,
                }
            }
            cmd_tag::GetSchema => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                Command::GetSchema {
                    request_id,
                    topic: get_str(&mut buf)?,
                }
            }
            cmd_tag::GetSchemaResponse => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                Command::GetSchemaResponse {
                    request_id,
                    schema: get_opt_bytes(&mut buf)?,
                }
            }
            cmd_tag::GetOrCreateSchema => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                let topic = get_str(&mut buf)?;
                let schema = get_bytes(&mut buf)?;
                Command::GetOrCreateSchema {
                    request_id,
                    topic,
                    schema,
                }
            }
            cmd_tag::GetOrCreateSchemaResponse => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                Command::GetOrCreateSchemaResponse {
                    request_id,
                    schema_version: get_opt_bytes(&mut buf)?,
                }
            }
            cmd_tag::CloseConsumer => {
                need(&buf, 16)?;
                let consumer_id = buf.get_u64();
                let request_id = buf.get_u64();
                Command::CloseConsumer {
                    consumer_id,
                    request_id,
                }
            }
            cmd_tag::CloseProducer => {
                need(&buf, 16)?;
                let producer_id = buf.get_u64();
                let request_id = buf.get_u64();
                Command::CloseProducer {
                    producer_id,
                    request_id,
                }
            }
            cmd_tag::Error => {
                need(&buf, 1)?;
                let has_id = buf.get_u8();
                let request_id = if has_id == 1 {
                    need(&buf, 8)?;
                    Some(buf.get_u64())
                } else {
                    None
                };
                need(&buf, 1)?;
                let kind = error_kind_from_tag(buf.get_u8());
                let message = get_str(&mut buf)?;
                Command::Error {
                    request_id,
                    kind,
                    message,
                }
            }
            cmd_tag::Producer => {
                need(&buf, 16)?;
                let request_id = buf.get_u64();
                let producer_id = buf.get_u64();
                Command::Producer {
                    request_id,
                    producer_id,
                    topic: get_str(&mut buf)?,
                }
            }
            cmd_tag::ProducerSuccess => {
                need(&buf, 8)?;
                let request_id = buf.get_u64();
                Command::ProducerSuccess {
                    request_id,
                    producer_name: get_str(&mut buf)?,
                }
            }
            cmd_tag::Subscribe => {
                need(&buf, 16)?;
                let request_id = buf.get_u64();
                let consumer_id = buf.get_u64();
                let topic = get_str(&mut buf)?;
                let subscription = get_str(&mut buf)?;
                Command::Subscribe {
                    request_id,
                    consumer_id,
                    topic,
                    subscription,
                }
            }
            cmd_tag::Send => {
                need(&buf, 16)?;
                let producer_id = buf.get_u64();
                let sequence_id = buf.get_u64();
                Command::Send {
                    producer_id,
                    sequence_id,
                }
            }
            cmd_tag::SendReceipt => {
                need(&buf, 16)?;
                let producer_id = buf.get_u64();
                let sequence_id = buf.get_u64();
                Command::SendReceipt {
                    producer_id,
                    sequence_id,
                }
            }
            cmd_tag::Ack => {
                need(&buf, 8)?;
                Command::Ack {
                    consumer_id: buf.get_u64(),
                }
            }
            cmd_tag::Flow => {
                need(&buf, 12)?;
                let consumer_id = buf.get_u64();
                let message_permits = buf.get_u32();
                Command::Flow {
                    consumer_id,
                    message_permits,
                }
            }
            cmd_tag::Unsubscribe => {
                need(&buf, 16)?;
                let consumer_id = buf.get_u64();
                let request_id = buf.get_u64();
                Command::Unsubscribe {
                    consumer_id,
                    request_id,
                }
            }
            cmd_tag::Seek => {
                need(&buf, 16)?;
                let consumer_id = buf.get_u64();
                let request_id = buf.get_u64();
                Command::Seek {
                    consumer_id,
                    request_id,
                }
            }
            cmd_tag::SeekResponse => {
                need(&buf, 8)?;
                Command::SeekResponse {
                    request_id: buf.get_u64(),
                }
            }
            cmd_tag::RedeliverUnacknowledgedMessages => {
                need(&buf, 8)?;
                Command::RedeliverUnacknowledgedMessages {
                    consumer_id: buf.get_u64(),
                }
            }
            cmd_tag::GetLastMessageId => {
                need(&buf, 16)?;
                let consumer_id = buf.get_u64();
                let request_id = buf.get_u64();
                Command::GetLastMessageId {
                    consumer_id,
                    request_id,
                }
            }
            cmd_tag::GetLastMessageIdResponse => {
                need(&buf, 8)?;
                Command::GetLastMessageIdResponse {
                    request_id: buf.get_u64(),
                }
            }
            cmd_tag::ActiveConsumerChange => {
                need(&buf, 9)?;
                let consumer_id = buf.get_u64();
                let is_active = buf.get_u8() != 0;
                Command::ActiveConsumerChange {
                    consumer_id,
                    is_active,
                }
            }
            cmd_tag::ReachedEndOfTopic => {
                need(&buf, 8)?;
                Command::ReachedEndOfTopic {
                    consumer_id: buf.get_u64(),
                }
            }
            other => return Err(ProxyError::protocol(format!("unknown command tag {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Command) -> Command {
        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        Command::decode(buf.freeze()).expect("decode")
    }

    #[test]
    fn lookup_roundtrips() {
        let cmd = Command::Lookup {
            request_id: 42,
            topic: "persistent://t/n/topic-0".to_string(),
            authoritative: false,
        };
        match roundtrip(cmd) {
            Command::Lookup {
                request_id, topic, ..
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(topic, "persistent://t/n/topic-0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connect_with_no_auth_roundtrips() {
        let cmd = Command::Connect {
            protocol_version: 13,
            proxy_to_broker_url: None,
            auth_method_name: None,
            auth_data: None,
        };
        match roundtrip(cmd) {
            Command::Connect {
                protocol_version,
                auth_method_name,
                ..
            } => {
                assert_eq!(protocol_version, 13);
                assert!(auth_method_name.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_without_request_id_roundtrips() {
        let cmd = Command::Error {
            request_id: None,
            kind: ErrorKind::ProtocolError,
            message: "bad".to_string(),
        };
        match roundtrip(cmd) {
            Command::Error {
                request_id, kind, ..
            } => {
                assert_eq!(request_id, None);
                assert_eq!(kind, ErrorKind::ProtocolError);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
