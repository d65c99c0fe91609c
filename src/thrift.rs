//! Thrift binary protocol codec.
//!
//! Nimbus speaks the strict binary protocol over a framed transport. Rather
//! than generating bindings for the whole Storm IDL, messages are decoded into
//! a dynamic [`Value`] tree and the handful of structures we need are picked
//! apart by field id in `nimbus.rs`.

use std::collections::BTreeMap;
use std::fmt;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

/// Nesting limit for structs and containers. Storm replies nest about six
/// levels deep.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::Exception),
            4 => Some(MessageType::Oneway),
            _ => None,
        }
    }
}

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TType {
    fn from_u8(value: u8) -> Result<Self, ThriftError> {
        Ok(match value {
            0 => TType::Stop,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => return Err(ThriftError::UnknownType(other)),
        })
    }
}

/// A decoded Thrift value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Double(f64),
    I16(i16),
    I32(i32),
    I64(i64),
    Binary(Vec<u8>),
    Struct(Fields),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    List(Vec<Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Binary(s.into().into_bytes())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Binary(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Integer view, widening any of the integral wire types.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Fields> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Elements of a list or set.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    fn ttype(&self) -> TType {
        match self {
            Value::Bool(_) => TType::Bool,
            Value::Byte(_) => TType::Byte,
            Value::Double(_) => TType::Double,
            Value::I16(_) => TType::I16,
            Value::I32(_) => TType::I32,
            Value::I64(_) => TType::I64,
            Value::Binary(_) => TType::String,
            Value::Struct(_) => TType::Struct,
            Value::Map(_) => TType::Map,
            Value::Set(_) => TType::Set,
            Value::List(_) => TType::List,
        }
    }
}

/// Struct fields keyed by field id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(BTreeMap<i16, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: i16, value: Value) -> Self {
        self.0.insert(id, value);
        self
    }

    pub fn get(&self, id: i16) -> Option<&Value> {
        self.0.get(&id)
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub name: String,
    pub kind: MessageType,
    pub seqid: i32,
    pub body: Fields,
}

/// Errors produced while encoding or decoding protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ThriftError {
    /// Buffer ended in the middle of a value.
    UnexpectedEof,
    /// Strict header carried an unsupported protocol version.
    BadVersion(u32),
    UnknownType(u8),
    UnknownMessageType(u8),
    /// Negative or impossible length prefix.
    InvalidLength(i32),
    DepthExceeded,
    InvalidUtf8,
    /// Server answered with a TApplicationException.
    Application { kind: i32, message: String },
}

impl fmt::Display for ThriftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThriftError::UnexpectedEof => write!(f, "unexpected end of message"),
            ThriftError::BadVersion(v) => write!(f, "bad protocol version {v:#010x}"),
            ThriftError::UnknownType(t) => write!(f, "unknown field type {t}"),
            ThriftError::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            ThriftError::InvalidLength(n) => write!(f, "invalid length prefix {n}"),
            ThriftError::DepthExceeded => {
                write!(f, "nesting deeper than {MAX_DEPTH} levels")
            }
            ThriftError::InvalidUtf8 => write!(f, "message name is not valid UTF-8"),
            ThriftError::Application { kind, message } => {
                write!(f, "application exception (type {kind}): {message}")
            }
        }
    }
}

impl std::error::Error for ThriftError {}

/// Encode a strict binary message: header followed by the argument struct.
pub fn encode_message(name: &str, kind: MessageType, seqid: i32, args: &Fields) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + name.len());
    out.extend_from_slice(&(VERSION_1 | kind as u32).to_be_bytes());
    write_binary(&mut out, name.as_bytes());
    out.extend_from_slice(&seqid.to_be_bytes());
    write_struct(&mut out, args);
    out
}

fn write_binary(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn write_struct(out: &mut Vec<u8>, fields: &Fields) {
    for (id, value) in &fields.0 {
        out.push(value.ttype() as u8);
        out.extend_from_slice(&id.to_be_bytes());
        write_value(out, value);
    }
    out.push(TType::Stop as u8);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bool(b) => out.push(u8::from(*b)),
        Value::Byte(v) => out.push(*v as u8),
        Value::Double(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Value::I16(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I32(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_be_bytes()),
        Value::Binary(bytes) => write_binary(out, bytes),
        Value::Struct(fields) => write_struct(out, fields),
        Value::Map(entries) => {
            let (ktype, vtype) = entries
                .first()
                .map(|(k, v)| (k.ttype(), v.ttype()))
                .unwrap_or((TType::Byte, TType::Byte));
            out.push(ktype as u8);
            out.push(vtype as u8);
            out.extend_from_slice(&(entries.len() as i32).to_be_bytes());
            for (k, v) in entries {
                write_value(out, k);
                write_value(out, v);
            }
        }
        Value::Set(items) | Value::List(items) => {
            let etype = items.first().map(Value::ttype).unwrap_or(TType::Byte);
            out.push(etype as u8);
            out.extend_from_slice(&(items.len() as i32).to_be_bytes());
            for item in items {
                write_value(out, item);
            }
        }
    }
}

/// Decode one message from a complete frame payload.
///
/// Accepts both the strict header and the legacy non-strict one
/// (name first, then a type byte).
pub fn decode_message(buf: &[u8]) -> Result<Message, ThriftError> {
    let mut reader = Reader { buf, pos: 0 };
    let first = reader.read_i32()?;

    let (name, kind) = if first < 0 {
        let header = first as u32;
        if header & VERSION_MASK != VERSION_1 {
            return Err(ThriftError::BadVersion(header & VERSION_MASK));
        }
        let raw_kind = (header & 0xff) as u8;
        let kind =
            MessageType::from_u8(raw_kind).ok_or(ThriftError::UnknownMessageType(raw_kind))?;
        let name = reader.read_string()?;
        (name, kind)
    } else {
        let name_bytes = reader.take(first as usize)?;
        let name = String::from_utf8(name_bytes.to_vec()).map_err(|_| ThriftError::InvalidUtf8)?;
        let raw_kind = reader.read_u8()?;
        let kind =
            MessageType::from_u8(raw_kind).ok_or(ThriftError::UnknownMessageType(raw_kind))?;
        (name, kind)
    };

    let seqid = reader.read_i32()?;
    let body = reader.read_struct(0)?;
    Ok(Message {
        name,
        kind,
        seqid,
        body,
    })
}

/// Interpret the body of an `Exception` message.
pub fn application_error(body: &Fields) -> ThriftError {
    ThriftError::Application {
        kind: body.get(2).and_then(Value::as_i64).unwrap_or(0) as i32,
        message: body
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ThriftError> {
        if self.remaining() < n {
            return Err(ThriftError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ThriftError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, ThriftError> {
        Ok(self.take_array::<1>()?[0])
    }

    fn read_i16(&mut self) -> Result<i16, ThriftError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, ThriftError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    fn read_i64(&mut self) -> Result<i64, ThriftError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Read a length prefix and reject counts that cannot fit in what is left.
    /// Every encoded element occupies at least one byte.
    fn read_len(&mut self) -> Result<usize, ThriftError> {
        let len = self.read_i32()?;
        if len < 0 || len as usize > self.remaining() {
            return Err(ThriftError::InvalidLength(len));
        }
        Ok(len as usize)
    }

    fn read_binary(&mut self) -> Result<Vec<u8>, ThriftError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, ThriftError> {
        String::from_utf8(self.read_binary()?).map_err(|_| ThriftError::InvalidUtf8)
    }

    fn read_struct(&mut self, depth: usize) -> Result<Fields, ThriftError> {
        if depth > MAX_DEPTH {
            return Err(ThriftError::DepthExceeded);
        }
        let mut fields = Fields::new();
        loop {
            let ttype = TType::from_u8(self.read_u8()?)?;
            if ttype == TType::Stop {
                return Ok(fields);
            }
            let id = self.read_i16()?;
            let value = self.read_value(ttype, depth + 1)?;
            fields.0.insert(id, value);
        }
    }

    fn read_value(&mut self, ttype: TType, depth: usize) -> Result<Value, ThriftError> {
        if depth > MAX_DEPTH {
            return Err(ThriftError::DepthExceeded);
        }
        Ok(match ttype {
            TType::Stop => return Err(ThriftError::UnknownType(0)),
            TType::Bool => Value::Bool(self.read_u8()? != 0),
            TType::Byte => Value::Byte(self.read_u8()? as i8),
            TType::Double => Value::Double(f64::from_bits(self.read_i64()? as u64)),
            TType::I16 => Value::I16(self.read_i16()?),
            TType::I32 => Value::I32(self.read_i32()?),
            TType::I64 => Value::I64(self.read_i64()?),
            TType::String => Value::Binary(self.read_binary()?),
            TType::Struct => Value::Struct(self.read_struct(depth)?),
            TType::Map => {
                let ktype = TType::from_u8(self.read_u8()?)?;
                let vtype = TType::from_u8(self.read_u8()?)?;
                let len = self.read_len()?;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.read_value(ktype, depth + 1)?;
                    let v = self.read_value(vtype, depth + 1)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            TType::Set | TType::List => {
                let etype = TType::from_u8(self.read_u8()?)?;
                let len = self.read_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value(etype, depth + 1)?);
                }
                if ttype == TType::Set {
                    Value::Set(items)
                } else {
                    Value::List(items)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_call_without_args() {
        let bytes = encode_message("getClusterInfo", MessageType::Call, 7, &Fields::new());
        let mut expected = vec![0x80, 0x01, 0x00, 0x01];
        expected.extend_from_slice(&14i32.to_be_bytes());
        expected.extend_from_slice(b"getClusterInfo");
        expected.extend_from_slice(&7i32.to_be_bytes());
        expected.push(0);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_encode_call_with_string_arg() {
        let args = Fields::new().with(1, Value::string("wc-1-2"));
        let bytes = encode_message("getTopologyInfo", MessageType::Call, 1, &args);
        // header(4) + name(4+15) + seqid(4) + field header(3) + string(4+6) + stop(1)
        assert_eq!(bytes.len(), 4 + 19 + 4 + 3 + 10 + 1);
        assert_eq!(&bytes[27..30], &[11, 0, 1]);
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn test_decode_reply_with_nested_containers() {
        let summary = Fields::new()
            .with(
                3,
                Value::List(vec![Value::Struct(
                    Fields::new()
                        .with(1, Value::string("wc-1"))
                        .with(2, Value::string("wordcount")),
                )]),
            )
            .with(2, Value::I32(120));
        let reply = Fields::new().with(0, Value::Struct(summary.clone()));
        let bytes = encode_message("getClusterInfo", MessageType::Reply, 3, &reply);

        let message = decode_message(&bytes).unwrap();
        assert_eq!(message.name, "getClusterInfo");
        assert_eq!(message.kind, MessageType::Reply);
        assert_eq!(message.seqid, 3);
        let decoded = message.body.get(0).and_then(Value::as_struct).unwrap();
        assert_eq!(decoded, &summary);
        let topologies = decoded.get(3).and_then(Value::as_list).unwrap();
        let name = topologies[0]
            .as_struct()
            .and_then(|t| t.get(2))
            .and_then(Value::as_str);
        assert_eq!(name, Some("wordcount"));
    }

    #[test]
    fn test_decode_map_with_struct_keys() {
        let key = Value::Struct(
            Fields::new()
                .with(1, Value::string("split"))
                .with(2, Value::string("default")),
        );
        let body = Fields::new().with(1, Value::Map(vec![(key.clone(), Value::I64(42))]));
        let bytes = encode_message("x", MessageType::Reply, 0, &body);
        let message = decode_message(&bytes).unwrap();
        let entries = message.body.get(1).and_then(Value::as_map).unwrap();
        assert_eq!(entries[0].0, key);
        assert_eq!(entries[0].1.as_i64(), Some(42));
    }

    #[test]
    fn test_decode_non_strict_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4i32.to_be_bytes());
        bytes.extend_from_slice(b"ping");
        bytes.push(2);
        bytes.extend_from_slice(&9i32.to_be_bytes());
        bytes.push(0);
        let message = decode_message(&bytes).unwrap();
        assert_eq!(message.name, "ping");
        assert_eq!(message.kind, MessageType::Reply);
        assert_eq!(message.seqid, 9);
        assert_eq!(message.body, Fields::new());
    }

    #[test]
    fn test_decode_truncated_message() {
        let bytes = encode_message("getClusterInfo", MessageType::Reply, 1, &Fields::new());
        let err = decode_message(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err, ThriftError::UnexpectedEof);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = encode_message("a", MessageType::Reply, 1, &Fields::new());
        bytes[1] = 0x02;
        assert!(matches!(
            decode_message(&bytes),
            Err(ThriftError::BadVersion(0x8002_0000))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_list() {
        let mut bytes = encode_message("a", MessageType::Reply, 1, &Fields::new());
        bytes.pop();
        // field 1: list<i32> claiming a billion elements
        bytes.extend_from_slice(&[15, 0, 1, 8]);
        bytes.extend_from_slice(&1_000_000_000i32.to_be_bytes());
        assert_eq!(
            decode_message(&bytes).unwrap_err(),
            ThriftError::InvalidLength(1_000_000_000)
        );
    }

    #[test]
    fn test_decode_rejects_excessive_nesting() {
        let mut value = Value::I32(1);
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::Struct(Fields::new().with(1, value));
        }
        let bytes = encode_message("a", MessageType::Reply, 1, &Fields::new().with(0, value));
        assert_eq!(
            decode_message(&bytes).unwrap_err(),
            ThriftError::DepthExceeded
        );
    }

    #[test]
    fn test_application_error_from_body() {
        let body = Fields::new()
            .with(1, Value::string("Invalid method name: 'foo'"))
            .with(2, Value::I32(1));
        let err = application_error(&body);
        assert_eq!(
            err,
            ThriftError::Application {
                kind: 1,
                message: "Invalid method name: 'foo'".to_string()
            }
        );
        assert!(err.to_string().contains("Invalid method name"));
    }
}
