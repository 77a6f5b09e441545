//! Component C: the PurCMC text message codec (spec §4.C, §6).
//!
//! Header lines are `key:value` separated by `\n` or `\r\n`, terminated by
//! a blank line, followed by exactly `dataLen` bytes of body. This module
//! only knows about the wire shape; it hands parsed fields to
//! [`purcmc_types`] for interpretation and leaves dispatch to the caller.

use purcmc_types::{
    DataType, ElementKind, ElementSelector, EventMessage, HandleId, Message, Op, Payload,
    RequestId, RequestMessage, ResponseMessage, RetCode, Target,
};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{ChannelError, ServerError};

pub const DEFAULT_PACKET_BUFFER: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("incomplete message")]
    Incomplete,
    #[error(transparent)]
    Parse(#[from] purcmc_types::ParseError),
    #[error("malformed dataLen header: {0}")]
    BadDataLen(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Splits `headers\n\nbody` out of a buffer, returning the byte offset just
/// past the consumed message, or `None` if more bytes are needed.
fn split_header_and_body(buf: &[u8]) -> Option<(HashMap<String, String>, usize, usize)> {
    let mut pos = 0;
    let mut headers = HashMap::new();
    loop {
        let rest = &buf[pos..];
        let line_end = rest.iter().position(|&b| b == b'\n')?;
        let mut line = &rest[..line_end];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        pos += line_end + 1;
        if line.is_empty() {
            break;
        }
        let line = std::str::from_utf8(line).ok()?;
        let (key, value) = line.split_once(':')?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Some((headers, pos, buf.len()))
}

/// Attempts to parse one full message out of `buf`. Returns the message and
/// the number of bytes consumed, or `Err(Incomplete)` if more bytes are
/// needed — the caller retries after the next read.
pub fn try_parse(buf: &[u8]) -> Result<(Message, usize), CodecError> {
    let Some((headers, header_len, _)) = split_header_and_body(buf) else {
        return Err(CodecError::Incomplete);
    };

    let data_len: usize = headers
        .get("dataLen")
        .ok_or(purcmc_types::ParseError::MissingHeader("dataLen"))?
        .parse()
        .map_err(|_| CodecError::BadDataLen(headers["dataLen"].clone()))?;

    if buf.len() < header_len + data_len {
        return Err(CodecError::Incomplete);
    }
    let body = &buf[header_len..header_len + data_len];

    let data_type = match headers.get("dataType") {
        Some(s) => DataType::from_str(s)?,
        None => DataType::Void,
    };
    let payload = decode_payload(data_type, body)?;

    let msg_type = headers
        .get("type")
        .ok_or(purcmc_types::ParseError::MissingHeader("type"))?
        .as_str();

    let message = match msg_type {
        "request" => Message::Request(parse_request(&headers, data_type, payload)?),
        "response" => Message::Response(parse_response(&headers, data_type, payload)?),
        "event" => Message::Event(parse_event(&headers, data_type, payload)?),
        other => {
            return Err(purcmc_types::ParseError::MalformedHeader("type", other.to_string()).into())
        }
    };

    Ok((message, header_len + data_len))
}

fn decode_payload(data_type: DataType, body: &[u8]) -> Result<Payload, CodecError> {
    Ok(match data_type {
        DataType::Void => Payload::Void,
        DataType::Plain => Payload::Plain(String::from_utf8_lossy(body).into_owned()),
        DataType::Html => Payload::Html(String::from_utf8_lossy(body).into_owned()),
        DataType::Json => {
            if body.is_empty() {
                Payload::Json(serde_json::Value::Null)
            } else {
                Payload::Json(serde_json::from_slice(body)?)
            }
        }
    })
}

fn required<'a>(
    headers: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, CodecError> {
    headers
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| purcmc_types::ParseError::MissingHeader(key).into())
}

fn parse_handle(headers: &HashMap<String, String>, key: &'static str) -> Result<HandleId, CodecError> {
    match headers.get(key) {
        Some(s) if !s.is_empty() => Ok(HandleId::from_hex(s)?),
        _ => Ok(HandleId::ZERO),
    }
}

fn parse_request(
    headers: &HashMap<String, String>,
    data_type: DataType,
    payload: Payload,
) -> Result<RequestMessage, CodecError> {
    let operation = Op::from_str(required(headers, "operation")?)?;
    let target = Target::from_str(required(headers, "target")?)?;
    let target_value = parse_handle(headers, "targetValue")?;
    let request_id = RequestId::from(required(headers, "requestId")?);
    let element = parse_element(headers);
    let property = headers.get("property").cloned();

    Ok(RequestMessage {
        operation,
        request_id,
        target,
        target_value,
        element,
        property,
        data_type,
        payload,
    })
}

fn parse_response(
    headers: &HashMap<String, String>,
    data_type: DataType,
    payload: Payload,
) -> Result<ResponseMessage, CodecError> {
    let request_id = RequestId::from(required(headers, "requestId")?);
    let ret_code = ret_code_from_str(required(headers, "retCode")?)?;
    let result_value = parse_handle(headers, "resultValue")?;

    Ok(ResponseMessage {
        request_id,
        ret_code,
        result_value,
        data_type,
        payload,
    })
}

fn parse_event(
    headers: &HashMap<String, String>,
    data_type: DataType,
    payload: Payload,
) -> Result<EventMessage, CodecError> {
    let target = Target::from_str(required(headers, "target")?)?;
    let target_value = parse_handle(headers, "targetValue")?;
    let event_name = required(headers, "eventName")?.to_string();
    let source_uri = headers.get("sourceURI").cloned().unwrap_or_default();
    let element = parse_element(headers);
    let property = headers.get("property").cloned();

    Ok(EventMessage {
        event_name,
        source_uri,
        target,
        target_value,
        element,
        property,
        data_type,
        payload,
    })
}

fn parse_element(headers: &HashMap<String, String>) -> ElementSelector {
    let kind = headers
        .get("elementType")
        .map(String::as_str)
        .unwrap_or("void");
    let kind = ElementKind::from_str(kind).unwrap_or(ElementKind::Void);
    let value = headers.get("element").cloned().unwrap_or_default();
    ElementSelector { kind, value }
}

fn ret_code_from_str(s: &str) -> Result<RetCode, CodecError> {
    let n: u16 = s
        .parse()
        .map_err(|_| purcmc_types::ParseError::MalformedHeader("retCode", s.to_string()))?;
    Ok(match n {
        200 => RetCode::Ok,
        400 => RetCode::BadRequest,
        401 => RetCode::Unauthorized,
        404 => RetCode::NotFound,
        405 => RetCode::MethodNotAllowed,
        406 => RetCode::NotAcceptable,
        409 => RetCode::Conflict,
        412 => RetCode::PreconditionFailed,
        413 => RetCode::PacketTooLarge,
        422 => RetCode::UnprocessablePacket,
        426 => RetCode::UpgradeRequired,
        501 => RetCode::NotImplemented,
        503 => RetCode::ServiceUnavailable,
        507 => RetCode::InsufficientStorage,
        _ => RetCode::InternalServerError,
    })
}

/// Serializes a response, capping the total size at `packet_buffer` bytes.
/// An oversize result is replaced in place by a bodyless
/// `InternalServerError`, per spec §4.C.
pub fn serialize_response(msg: &ResponseMessage, packet_buffer: usize) -> Vec<u8> {
    let body = payload_bytes(&msg.payload);
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(b"type:response\n");
    out.extend_from_slice(format!("requestId:{}\n", msg.request_id).as_bytes());
    out.extend_from_slice(format!("retCode:{}\n", msg.ret_code.as_u16()).as_bytes());
    out.extend_from_slice(format!("resultValue:{:x}\n", msg.result_value.0).as_bytes());
    out.extend_from_slice(format!("dataType:{}\n", msg.data_type).as_bytes());
    out.extend_from_slice(format!("dataLen:{}\n\n", body.len()).as_bytes());
    out.extend_from_slice(&body);

    if out.len() > packet_buffer {
        return serialize_response(
            &ResponseMessage {
                request_id: msg.request_id.clone(),
                ret_code: RetCode::InternalServerError,
                result_value: HandleId::ZERO,
                data_type: purcmc_types::DataType::Void,
                payload: Payload::Void,
            },
            packet_buffer,
        );
    }
    out
}

pub fn serialize_event(msg: &EventMessage, packet_buffer: usize) -> Result<Vec<u8>, ServerError> {
    let body = payload_bytes(&msg.payload);
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(b"type:event\n");
    out.extend_from_slice(format!("target:{}\n", msg.target).as_bytes());
    out.extend_from_slice(format!("targetValue:{:x}\n", msg.target_value.0).as_bytes());
    out.extend_from_slice(format!("eventName:{}\n", msg.event_name).as_bytes());
    out.extend_from_slice(format!("sourceURI:{}\n", msg.source_uri).as_bytes());
    if let Some(prop) = &msg.property {
        out.extend_from_slice(format!("property:{prop}\n").as_bytes());
    }
    out.extend_from_slice(format!("dataType:{}\n", msg.data_type).as_bytes());
    out.extend_from_slice(format!("dataLen:{}\n\n", body.len()).as_bytes());
    out.extend_from_slice(&body);

    if out.len() > packet_buffer {
        return Err(ChannelError::Send.into());
    }
    Ok(out)
}

fn payload_bytes(payload: &Payload) -> Vec<u8> {
    match payload {
        Payload::Void => Vec::new(),
        Payload::Plain(s) | Payload::Html(s) => s.as_bytes().to_vec(),
        Payload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_with_json_body() {
        let body = br#"{"a":1}"#;
        let mut raw = Vec::new();
        raw.extend_from_slice(b"type:request\n");
        raw.extend_from_slice(b"target:session\n");
        raw.extend_from_slice(b"targetValue:0\n");
        raw.extend_from_slice(b"operation:startSession\n");
        raw.extend_from_slice(b"requestId:1\n");
        raw.extend_from_slice(b"dataType:json\n");
        raw.extend_from_slice(format!("dataLen:{}\n\n", body.len()).as_bytes());
        raw.extend_from_slice(body);

        let (msg, consumed) = try_parse(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        match msg {
            Message::Request(req) => {
                assert_eq!(req.operation, Op::StartSession);
                assert_eq!(req.request_id, RequestId::from("1"));
                assert!(req.payload.as_json().is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incomplete_body_reports_incomplete() {
        let raw = b"type:request\ntarget:session\ntargetValue:0\noperation:endSession\nrequestId:1\ndataType:void\ndataLen:10\n\nabc";
        assert!(matches!(try_parse(raw), Err(CodecError::Incomplete)));
    }

    #[test]
    fn oversize_response_falls_back_to_internal_server_error() {
        let msg = ResponseMessage {
            request_id: RequestId::from("9"),
            ret_code: RetCode::Ok,
            result_value: HandleId::ZERO,
            data_type: DataType::Plain,
            payload: Payload::Plain("x".repeat(9000)),
        };
        let out = serialize_response(&msg, DEFAULT_PACKET_BUFFER);
        let s = String::from_utf8_lossy(&out);
        assert!(s.contains("retCode:500"));
    }

    #[test]
    fn response_round_trips_through_serialize_and_parse() {
        let msg = ResponseMessage {
            request_id: RequestId::from("42"),
            ret_code: RetCode::Ok,
            result_value: HandleId(0xabc),
            data_type: DataType::Void,
            payload: Payload::Void,
        };
        let out = serialize_response(&msg, DEFAULT_PACKET_BUFFER);
        let (parsed, consumed) = try_parse(&out).unwrap();
        assert_eq!(consumed, out.len());
        match parsed {
            Message::Response(r) => {
                assert_eq!(r.request_id, RequestId::from("42"));
                assert_eq!(r.result_value, HandleId(0xabc));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
