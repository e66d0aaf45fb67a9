//! Payload layouts of the call, reply and signal messages.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use saftbus_serial::{Decode, Deserializer, Encode, SerialError, Serializer, Value};

use crate::error::{CallError, ErrorKind};

/// Standard facet for property access.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
/// Standard facet for introspection.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
/// Facet exposed by every ownable object.
pub const OWNED_INTERFACE: &str = "de.gsi.saftlib.Owned";
/// Signal name used for property change notifications.
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Decode a complete payload as `T`, rejecting trailing bytes.
pub fn decode_payload<T: Decode>(payload: impl Into<Bytes>) -> Result<T, SerialError> {
    let mut de = Deserializer::new(payload);
    let value = de.get()?;
    de.finish()?;
    Ok(value)
}

/// Encode one value as a complete payload.
pub fn encode_payload<T: Encode + ?Sized>(value: &T) -> Bytes {
    let mut ser = Serializer::new();
    ser.put(value);
    ser.into_bytes()
}

/// METHOD_CALL payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub object_path: String,
    /// Caller-chosen label, informational only.
    pub sender: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(
        object_path: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            object_path: object_path.into(),
            sender: String::new(),
            interface: interface.into(),
            method: method.into(),
            args,
        }
    }
}

impl Encode for MethodCall {
    fn encode(&self, ser: &mut Serializer) {
        ser.put(&self.object_path)
            .put(&self.sender)
            .put(&self.interface)
            .put(&self.method)
            .put(&self.args);
    }
}

impl Decode for MethodCall {
    fn decode(de: &mut Deserializer) -> Result<Self, SerialError> {
        Ok(Self {
            object_path: de.get()?,
            sender: de.get()?,
            interface: de.get()?,
            method: de.get()?,
            args: de.get()?,
        })
    }
}

/// Outcome of a call as carried by METHOD_REPLY (and privileged control replies).
pub type CallResult = Result<Vec<Value>, CallError>;

pub fn encode_reply(result: &CallResult) -> Bytes {
    let mut ser = Serializer::new();
    match result {
        Ok(values) => {
            ser.put(&true).put(values);
        }
        Err(err) => {
            ser.put(&false).put(&err.kind.code()).put(&err.message);
        }
    }
    ser.into_bytes()
}

pub fn decode_reply(payload: impl Into<Bytes>) -> Result<CallResult, SerialError> {
    let mut de = Deserializer::new(payload);
    let result = if de.get::<bool>()? {
        Ok(de.get::<Vec<Value>>()?)
    } else {
        let code: u32 = de.get()?;
        let message: String = de.get()?;
        Err(CallError::new(ErrorKind::from_code(code), message))
    };
    de.finish()?;
    Ok(result)
}

/// SIGNAL payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub object_path: String,
    pub interface: String,
    pub name: String,
    pub sent_sec: i64,
    pub sent_nsec: i64,
    pub params: Vec<Value>,
}

impl SignalMessage {
    /// Build a signal stamped with the current wall-clock time.
    pub fn now(
        object_path: impl Into<String>,
        interface: impl Into<String>,
        name: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        let (sent_sec, sent_nsec) = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, i64::from(d.subsec_nanos())),
            Err(_) => (0, 0),
        };
        Self {
            object_path: object_path.into(),
            interface: interface.into(),
            name: name.into(),
            sent_sec,
            sent_nsec,
            params,
        }
    }

    /// Microseconds between the send stamp and now, clamped at zero.
    pub fn flight_time_us(&self) -> f64 {
        let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return 0.0;
        };
        let now_us = now.as_secs() as f64 * 1e6 + f64::from(now.subsec_nanos()) / 1e3;
        let sent_us = self.sent_sec as f64 * 1e6 + self.sent_nsec as f64 / 1e3;
        (now_us - sent_us).max(0.0)
    }
}

impl Encode for SignalMessage {
    fn encode(&self, ser: &mut Serializer) {
        ser.put(&self.object_path)
            .put(&self.interface)
            .put(&self.name)
            .put(&self.sent_sec)
            .put(&self.sent_nsec)
            .put(&self.params);
    }
}

impl Decode for SignalMessage {
    fn decode(de: &mut Deserializer) -> Result<Self, SerialError> {
        Ok(Self {
            object_path: de.get()?,
            interface: de.get()?,
            name: de.get()?,
            sent_sec: de.get()?,
            sent_nsec: de.get()?,
            params: de.get()?,
        })
    }
}

/// Parameters of a `PropertiesChanged` signal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertiesChanged {
    /// The facet whose properties changed.
    pub interface: String,
    pub changed: BTreeMap<String, Value>,
    pub invalidated: Vec<String>,
}

impl PropertiesChanged {
    pub fn into_params(self) -> Vec<Value> {
        vec![
            Value::Str(self.interface),
            Value::Map(self.changed),
            Value::Seq(self.invalidated.into_iter().map(Value::Str).collect()),
        ]
    }

    pub fn from_params(params: &[Value]) -> Result<Self, SerialError> {
        let mut args = saftbus_serial::ArgReader::new(params);
        let interface = args.next()?;
        let changed = args.next()?;
        let invalidated = args.next()?;
        args.finish()?;
        Ok(Self {
            interface,
            changed,
            invalidated,
        })
    }
}

/// Where the server should write a proxy's signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRoute {
    /// A private pipe whose write end travels with the registration.
    Pipe,
    /// The connection's own socket, interleaved with replies.
    Inband,
}

/// SIGNAL_FD payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFdRequest {
    pub object_path: String,
    pub interface: String,
    pub proxy_id: u64,
    pub route: SignalRoute,
}

impl Encode for SignalFdRequest {
    fn encode(&self, ser: &mut Serializer) {
        ser.put(&self.object_path)
            .put(&self.interface)
            .put(&self.proxy_id)
            .put(&(self.route == SignalRoute::Inband));
    }
}

impl Decode for SignalFdRequest {
    fn decode(de: &mut Deserializer) -> Result<Self, SerialError> {
        Ok(Self {
            object_path: de.get()?,
            interface: de.get()?,
            proxy_id: de.get()?,
            route: if de.get::<bool>()? {
                SignalRoute::Inband
            } else {
                SignalRoute::Pipe
            },
        })
    }
}

/// SIGNAL_REMOVE_FD payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRemoveRequest {
    pub object_path: String,
    pub interface: String,
    pub proxy_id: u64,
}

impl Encode for SignalRemoveRequest {
    fn encode(&self, ser: &mut Serializer) {
        ser.put(&self.object_path)
            .put(&self.interface)
            .put(&self.proxy_id);
    }
}

impl Decode for SignalRemoveRequest {
    fn decode(de: &mut Deserializer) -> Result<Self, SerialError> {
        Ok(Self {
            object_path: de.get()?,
            interface: de.get()?,
            proxy_id: de.get()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_payload_roundtrip() {
        let call = MethodCall::new(
            "/de/gsi/saftlib/tr0/fg_0",
            "de.gsi.saftlib.FunctionGenerator",
            "Reset",
            vec![],
        );
        let decoded: MethodCall = decode_payload(encode_payload(&call)).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn reply_carries_values_or_error() {
        let ok: CallResult = Ok(vec![Value::Bool(true)]);
        assert_eq!(decode_reply(encode_reply(&ok)).unwrap(), ok);

        let err: CallResult = Err(CallError::permission_denied("not owner"));
        assert_eq!(decode_reply(encode_reply(&err)).unwrap(), err);
    }

    #[test]
    fn truncated_reply_is_a_decode_error() {
        let bytes = encode_reply(&Ok(vec![Value::Str("abc".into())]));
        let short = bytes.slice(..bytes.len() - 1);
        assert!(decode_reply(short).is_err());
    }

    #[test]
    fn properties_changed_params() {
        let mut changed = BTreeMap::new();
        changed.insert("Armed".to_string(), Value::Bool(true));
        let pc = PropertiesChanged {
            interface: "de.gsi.saftlib.FunctionGenerator".into(),
            changed,
            invalidated: vec!["FillLevel".into()],
        };
        let params = pc.clone().into_params();
        assert_eq!(PropertiesChanged::from_params(&params).unwrap(), pc);
        assert!(PropertiesChanged::from_params(&params[..2]).is_err());
    }

    #[test]
    fn flight_time_is_never_negative() {
        let mut msg = SignalMessage::now("/a", "b.c", "D", vec![]);
        assert!(msg.flight_time_us() >= 0.0);
        msg.sent_sec += 3600;
        assert_eq!(msg.flight_time_us(), 0.0);
    }

    #[test]
    fn signal_fd_request_route_flag() {
        let req = SignalFdRequest {
            object_path: "/p".into(),
            interface: "i.f".into(),
            proxy_id: 1203,
            route: SignalRoute::Inband,
        };
        let decoded: SignalFdRequest = decode_payload(encode_payload(&req)).unwrap();
        assert_eq!(decoded, req);
    }
}
