//! Wire message envelope
//!
//! Requests and responses share one envelope shape: service, optional
//! action and transaction token, a flat multi-valued parameter map, an
//! error code plus message, and an opaque payload in the negotiated
//! encoding. Responses may additionally carry response-only parameters, a
//! duration and an orchestration-fault marker.

use serde_json::Value;

use crate::core::error::{code, ServiceError, ServiceResult};

use super::{codec, writer::ResponseWriter, Encoding, ParamMap};

/// Envelope field names. `error-code` must stay the earliest field in both
/// encodings so consumers can peek it cheaply.
pub mod field {
    pub const ERROR_CODE: &str = "error-code";
    pub const ERROR_MESSAGE: &str = "error-message";
    pub const SERVICE: &str = "service";
    pub const ACTION: &str = "action";
    pub const TRANSACTION: &str = "transaction-data";
    pub const DATA: &str = "data";
    pub const PARAMETERS: &str = "parameters";
    pub const DURATION: &str = "duration";
    pub const ORCHESTRATION_FAULT: &str = "orchestration-fault";
}

/// Root tag of the XML rendering of the envelope.
pub const XML_ROOT: &str = "message";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    pub error_code: u32,
    pub error_message: Option<String>,
    pub service: String,
    pub action: Option<String>,
    pub transaction: Option<String>,
    pub parameters: ParamMap,
    /// Structured payload; `None` both for requests without one and for
    /// error responses, which omit `data`.
    pub payload: Option<Value>,
    pub duration: Option<u64>,
    pub fault: Option<bool>,
}

impl WireMessage {
    pub fn request(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_code != code::OK
    }

    /// Frame the message as wire text in the given encoding.
    pub fn to_text(&self, encoding: Encoding) -> ServiceResult<String> {
        let mut buf: Vec<u8> = Vec::new();
        {
            let mut writer = ResponseWriter::new(&mut buf, encoding, &self.service);
            if let Some(action) = &self.action {
                writer = writer.action(action);
            }
            if let Some(transaction) = &self.transaction {
                writer = writer.transaction(transaction);
            }
            if !self.parameters.is_empty() {
                writer.set_parameters(self.parameters.clone());
            }
            if let Some(duration) = self.duration {
                writer.set_duration(duration);
            }
            if let Some(fault) = self.fault {
                writer.set_fault(fault);
            }
            if self.is_error() {
                writer.write_error_response(
                    self.error_code,
                    self.error_message.as_deref().unwrap_or_default(),
                )?;
            } else {
                match &self.payload {
                    Some(payload) => {
                        let text = codec::encode_payload(encoding, payload)?;
                        writer.write_response(text.as_bytes())?;
                    }
                    None => writer.done()?,
                }
            }
        }
        String::from_utf8(buf).map_err(|e| ServiceError::Internal(e.to_string()))
    }

    /// Parse framed wire text, auto-detecting the encoding from the first
    /// non-whitespace byte.
    pub fn from_text(text: &str) -> ServiceResult<(Encoding, Self)> {
        let encoding = Encoding::sniff(text.as_bytes());
        let value = codec::decode(encoding, text)?;
        Ok((encoding, Self::from_structured(&value)?))
    }

    /// Extract the envelope fields from a decoded structured value.
    pub fn from_structured(value: &Value) -> ServiceResult<Self> {
        let Value::Object(map) = value else {
            return Err(ServiceError::Decode(
                "wire message must be a structured object".to_string(),
            ));
        };

        let error_code = match map.get(field::ERROR_CODE) {
            None => code::OK,
            Some(v) => parse_u32(v).ok_or_else(|| {
                ServiceError::Decode(format!("invalid error-code '{}'", codec::scalar_to_string(v)))
            })?,
        };

        let parameters = map
            .get(field::PARAMETERS)
            .map(codec::parameter_map_from_structured)
            .unwrap_or_default();

        Ok(Self {
            error_code,
            error_message: get_string(map, field::ERROR_MESSAGE),
            service: get_string(map, field::SERVICE).unwrap_or_default(),
            action: get_string(map, field::ACTION),
            transaction: get_string(map, field::TRANSACTION),
            parameters,
            // An empty data element is the XML rendering of "no payload";
            // treat it like JSON null so both encodings agree on absence.
            payload: map
                .get(field::DATA)
                .filter(|v| !v.is_null() && v.as_str() != Some(""))
                .cloned(),
            duration: map.get(field::DURATION).and_then(parse_u64),
            fault: map.get(field::ORCHESTRATION_FAULT).and_then(parse_bool),
        })
    }
}

fn get_string(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(codec::scalar_to_string(v)),
    }
}

fn parse_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
