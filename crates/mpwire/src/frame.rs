//! # Envelopes
//!
//! The three msgpack-rpc message forms. Every envelope travels as a msgpack
//! array whose first element is the type tag:
//!
//! | tag | form     | fields                        |
//! |-----|----------|-------------------------------|
//! | 0   | Request  | msgid, method, params         |
//! | 1   | Response | msgid, error, result          |
//! | 2   | Notify   | method, params                |
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Wire Compatibility**: The Response error field keeps its tri-state shape
//!   (`nil`, `true`, `false`); `false` means success, just like `nil`.

use rmpv::Value;

use crate::error::Error;
use crate::error::ErrorPayload;
use crate::error::Failure;
use crate::error::Result;

pub const TAG_REQUEST: u64 = 0;
pub const TAG_RESPONSE: u64 = 1;
pub const TAG_NOTIFY: u64 = 2;

/// A call expecting a Response with the same msgid.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub msgid: u32,
    pub method: String,
    pub params: Vec<Value>,
}

/// The answer to a Request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub msgid: u32,
    pub error: ErrorField,
    pub result: Value,
}

/// A one-way message; no Response is ever produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub method: String,
    pub params: Vec<Value>,
}

/// The raw Response error field, exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorField {
    /// `nil`: success.
    Nil,
    /// `true`: failure, `false`: success.
    Flag(bool),
    /// Any other value. Interpreting it is a protocol error.
    Unrecognized(Value),
}

/// One wire-level RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notify(Notify),
}

impl Request {
    pub fn new(msgid: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { msgid, method: method.into(), params }
    }
}

impl Notify {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self { method: method.into(), params }
    }
}

impl Response {
    /// A successful Response carrying `result`.
    pub fn success(msgid: u32, result: Value) -> Self {
        Self { msgid, error: ErrorField::Nil, result }
    }

    /// A failed Response; the failure travels in the result slot.
    pub fn failure(msgid: u32, failure: Failure) -> Self {
        let result = Value::Array(vec![
            Value::from(failure.code),
            Value::from(failure.message),
        ]);
        Self { msgid, error: ErrorField::Flag(true), result }
    }

    /// Interprets the error field.
    pub fn payload(&self) -> Result<ErrorPayload> {
        match &self.error {
            ErrorField::Nil | ErrorField::Flag(false) => Ok(ErrorPayload::None),
            ErrorField::Flag(true) => decode_failure(&self.result).map(ErrorPayload::Failure),
            ErrorField::Unrecognized(v) => Err(Error::ProtocolViolation(
                format!("Unrecognized error field: {:?}", v),
            )),
        }
    }

    /// Consumes the Response, yielding the return value or the remote failure.
    ///
    /// The outer `Result` fails only when the Response itself is malformed.
    pub fn into_result(self) -> Result<std::result::Result<Value, Failure>> {
        match self.payload()? {
            ErrorPayload::None => Ok(Ok(self.result)),
            ErrorPayload::Failure(failure) => Ok(Err(failure)),
        }
    }
}

impl ErrorField {
    fn to_value(&self) -> Value {
        match self {
            Self::Nil => Value::Nil,
            Self::Flag(b) => Value::Boolean(*b),
            Self::Unrecognized(v) => v.clone(),
        }
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::Nil => Self::Nil,
            Value::Boolean(b) => Self::Flag(b),
            other => Self::Unrecognized(other),
        }
    }
}

impl Envelope {
    /// Returns the wire tag of this envelope.
    pub fn tag(&self) -> u64 {
        match self {
            Self::Request(_) => TAG_REQUEST,
            Self::Response(_) => TAG_RESPONSE,
            Self::Notify(_) => TAG_NOTIFY,
        }
    }

    /// Builds the msgpack array for this envelope.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request(req) => Value::Array(vec![
                Value::from(TAG_REQUEST),
                Value::from(req.msgid),
                Value::from(req.method.as_str()),
                Value::Array(req.params.clone()),
            ]),
            Self::Response(res) => Value::Array(vec![
                Value::from(TAG_RESPONSE),
                Value::from(res.msgid),
                res.error.to_value(),
                res.result.clone(),
            ]),
            Self::Notify(note) => Value::Array(vec![
                Value::from(TAG_NOTIFY),
                Value::from(note.method.as_str()),
                Value::Array(note.params.clone()),
            ]),
        }
    }

    /// Classifies a decoded msgpack value as an envelope.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Array(fields) = value else {
            return Err(Error::ProtocolViolation("Envelope is not an array".into()));
        };

        let mut fields = fields.into_iter();
        let tag = fields
            .next()
            .ok_or(Error::ProtocolViolation("Empty envelope".into()))?;
        let tag = tag
            .as_u64()
            .ok_or_else(|| Error::ProtocolViolation(format!("Invalid type tag: {:?}", tag)))?;

        let rest: Vec<Value> = fields.collect();
        match tag {
            TAG_REQUEST => {
                let [msgid, method, params] = take_fields::<3>("Request", rest)?;
                Ok(Self::Request(Request {
                    msgid: decode_msgid(msgid)?,
                    method: decode_method(method)?,
                    params: decode_params(params)?,
                }))
            }
            TAG_RESPONSE => {
                let [msgid, error, result] = take_fields::<3>("Response", rest)?;
                Ok(Self::Response(Response {
                    msgid: decode_msgid(msgid)?,
                    error: ErrorField::from_value(error),
                    result,
                }))
            }
            TAG_NOTIFY => {
                let [method, params] = take_fields::<2>("Notify", rest)?;
                Ok(Self::Notify(Notify {
                    method: decode_method(method)?,
                    params: decode_params(params)?,
                }))
            }
            other => Err(Error::UnknownTag(other)),
        }
    }
}

impl From<Request> for Envelope {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for Envelope {
    fn from(res: Response) -> Self {
        Self::Response(res)
    }
}

impl From<Notify> for Envelope {
    fn from(note: Notify) -> Self {
        Self::Notify(note)
    }
}

// Helper functions

fn take_fields<const N: usize>(form: &str, fields: Vec<Value>) -> Result<[Value; N]> {
    let found = fields.len();
    fields.try_into().map_err(|_| {
        Error::ProtocolViolation(format!("{} expects {} fields after the tag, found {}", form, N, found))
    })
}

fn decode_msgid(value: Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| Error::ProtocolViolation(format!("Invalid msgid: {:?}", value)))
}

/// Method names are strings, but older peers send them as raw bytes.
fn decode_method(value: Value) -> Result<String> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or(Error::ProtocolViolation("Method name is not valid UTF-8".into())),
        Value::Binary(bytes) => String::from_utf8(bytes)
            .map_err(|_| Error::ProtocolViolation("Method name is not valid UTF-8".into())),
        other => Err(Error::ProtocolViolation(format!("Invalid method name: {:?}", other))),
    }
}

fn decode_params(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(Error::ProtocolViolation(format!("Params are not an array: {:?}", other))),
    }
}

fn decode_failure(result: &Value) -> Result<Failure> {
    let malformed = || Error::ProtocolViolation(format!("Malformed failure payload: {:?}", result));

    let fields = result.as_array().ok_or_else(malformed)?;
    let [code, message] = fields.as_slice() else {
        return Err(malformed());
    };

    let code = code.as_i64().ok_or_else(malformed)?;
    let message = match message {
        Value::String(s) => s.as_str().ok_or_else(malformed)?.to_string(),
        Value::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        _ => return Err(malformed()),
    };

    Ok(Failure { code, message })
}
