//! Protocol frame codec: JSON arrays dispatched on the first element.

use serde_json::{json, Value};

use crate::event::Event;
use crate::filter::Filter;

/// Frames the client sends to a relay. The engine never publishes, so the
/// outbound side is REQ and CLOSE.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close {
        sub_id: String,
    },
}

impl ClientRequest {
    pub fn encode(&self) -> Result<String, ParseError> {
        let val = match self {
            ClientRequest::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                for f in filters {
                    arr.push(serde_json::to_value(f).map_err(|e| ParseError::Encode(e.to_string()))?);
                }
                Value::Array(arr)
            }
            ClientRequest::Close { sub_id } => json!(["CLOSE", sub_id]),
        };
        Ok(val.to_string())
    }
}

/// Frames a relay sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayResponse {
    Event {
        sub_id: String,
        event: Event,
    },
    Eose {
        sub_id: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Closed {
        sub_id: String,
        reason: String,
    },
}

impl RelayResponse {
    /// Parse one text frame. Unknown heads and malformed arrays are a
    /// `ParseError`; the caller drops the frame and keeps the connection.
    pub fn parse(text: &str) -> Result<RelayResponse, ParseError> {
        let val: Value =
            serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
        let arr = val.as_array().ok_or(ParseError::NotAnArray)?;
        let head = arr
            .first()
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingHead)?;
        match head {
            "EVENT" if arr.len() >= 3 => {
                let sub_id = str_at(arr, 1)?;
                let event: Event = serde_json::from_value(arr[2].clone())
                    .map_err(|e| ParseError::Json(e.to_string()))?;
                Ok(RelayResponse::Event { sub_id, event })
            }
            "EOSE" if arr.len() >= 2 => Ok(RelayResponse::Eose {
                sub_id: str_at(arr, 1)?,
            }),
            "OK" if arr.len() >= 3 => Ok(RelayResponse::Ok {
                event_id: str_at(arr, 1)?,
                accepted: arr[2].as_bool().ok_or(ParseError::BadField("accepted"))?,
                message: arr.get(3).and_then(Value::as_str).unwrap_or_default().into(),
            }),
            "NOTICE" if arr.len() >= 2 => Ok(RelayResponse::Notice {
                message: str_at(arr, 1)?,
            }),
            "CLOSED" if arr.len() >= 2 => Ok(RelayResponse::Closed {
                sub_id: str_at(arr, 1)?,
                reason: arr.get(2).and_then(Value::as_str).unwrap_or_default().into(),
            }),
            other => Err(ParseError::UnknownHead(other.to_string())),
        }
    }
}

fn str_at(arr: &[Value], idx: usize) -> Result<String, ParseError> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ParseError::BadField("string"))
}

/// Malformed frame; logged and dropped, the connection continues.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("frame is not a json array")]
    NotAnArray,
    #[error("frame has no string head")]
    MissingHead,
    #[error("unknown frame head {0:?}")]
    UnknownHead(String),
    #[error("frame field is not a {0}")]
    BadField(&'static str),
    #[error("frame failed to encode: {0}")]
    Encode(String),
}
