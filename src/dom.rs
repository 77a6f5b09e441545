//! Component H: the DOM update pipeline (spec §4.H).
//!
//! Grounded in the teacher's `on_response`/`pending_commands` correlation
//! pattern (`handler/mod.rs`) and its `CommandFuture` plumbing
//! (`handler/commandfuture.rs`): a request is marshaled to an external
//! collaborator and the reply resolves a previously stashed slot keyed by
//! id — here PurCMC's string `request_id` standing in for Chrome's numeric
//! `CallId`.

use serde::Serialize;
use serde_json::json;

use purcmc_types::{state_to_ret_code, ElementSelector, HandleId, Payload, RetCode};

use crate::backend::RenderChannel;
use crate::error::Result;

/// One JSON envelope sent to the rendering subprocess for a DOM mutation or
/// property access (spec §4.H).
#[derive(Debug, Serialize)]
pub struct DomEnvelope {
    pub operation: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(rename = "elementType")]
    pub element_type: String,
    pub element: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "dataType")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub fn mutation_envelope(
    operation: &'static str,
    request_id: &str,
    element: &ElementSelector,
    payload: &Payload,
) -> DomEnvelope {
    let data = match payload {
        Payload::Void => None,
        Payload::Plain(s) | Payload::Html(s) => Some(json!(s)),
        Payload::Json(v) => Some(v.clone()),
    };
    DomEnvelope {
        operation,
        request_id: request_id.to_string(),
        element_type: element.kind.to_string(),
        element: element.value.clone(),
        property: None,
        data_type: Some(payload.data_type().to_string()),
        data,
    }
}

/// `callMethod`'s envelope: `{method, arg}` instead of `{property, data}`
/// (spec §4.H "Call-method and get/set-property have their own envelope
/// shapes").
pub fn call_method_envelope(request_id: &str, element: &ElementSelector, method: &str, arg: serde_json::Value) -> serde_json::Value {
    json!({
        "operation": "callMethod",
        "requestId": request_id,
        "elementType": element.kind.to_string(),
        "element": element.value,
        "method": method,
        "arg": arg,
    })
}

pub fn get_property_envelope(request_id: &str, element: &ElementSelector, property: &str) -> serde_json::Value {
    json!({
        "operation": "getProperty",
        "requestId": request_id,
        "elementType": element.kind.to_string(),
        "element": element.value,
        "property": property,
    })
}

pub fn set_property_envelope(
    request_id: &str,
    element: &ElementSelector,
    property: &str,
    value: serde_json::Value,
) -> serde_json::Value {
    json!({
        "operation": "setProperty",
        "requestId": request_id,
        "elementType": element.kind.to_string(),
        "element": element.value,
        "property": property,
        "value": value,
    })
}

/// Sends an already-built envelope down the page's render channel and
/// returns immediately; the reply lands later on `page-ready` (spec §4.H
/// "The sender immediately returns to the event loop; it does not block").
pub async fn send_envelope(
    channel: &mut dyn RenderChannel,
    view: HandleId,
    envelope: serde_json::Value,
) -> Result<()> {
    channel.send(view, envelope).await
}

/// One `page-ready` reply from the rendering subprocess (spec §4.H).
#[derive(Debug, serde::Deserialize)]
pub struct PageReadyReply {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub state: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// The outcome of matching a `page-ready` reply against the pending-
/// response table: a ready-to-send response, or nothing if the request_id
/// is unknown (spec §4.H step 5, "silently dropped after logging").
pub struct ResolvedReply {
    pub ret_code: RetCode,
    pub data: serde_json::Value,
}

pub fn resolve_reply(reply: &PageReadyReply) -> ResolvedReply {
    ResolvedReply {
        ret_code: state_to_ret_code(&reply.state),
        data: reply.data.clone(),
    }
}

/// One unsolicited `event` message from the rendering subprocess: a
/// `(name, kind, value, data)` tuple promoted to a protocol event targeting
/// the originating DOM (spec §4.H last paragraph).
#[derive(Debug, serde::Deserialize)]
pub struct SubprocessEvent {
    pub name: String,
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One message arriving on the server's reply channel from the rendering
/// subprocess: a correlated `page-ready` reply resolving a pending request,
/// or an unsolicited event to promote and proxy to the owning session (spec
/// §4.H last paragraph).
pub enum RenderReply {
    Response(PageReadyReply),
    Event {
        source_uri: String,
        view: HandleId,
        event: SubprocessEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use purcmc_types::{DataType, ElementKind};

    #[test]
    fn mutation_envelope_carries_element_and_payload() {
        let element = ElementSelector {
            kind: ElementKind::Id,
            value: "main".into(),
        };
        let env = mutation_envelope("update", "7", &element, &Payload::Plain("hi".into()));
        assert_eq!(env.element, "main");
        assert_eq!(env.data, Some(json!("hi")));
        assert_eq!(env.data_type, Some(DataType::Plain.to_string()));
    }

    #[test]
    fn reply_state_maps_to_ret_code() {
        let reply = PageReadyReply {
            request_id: "7".into(),
            state: "Ok".into(),
            data: serde_json::Value::Null,
        };
        assert_eq!(resolve_reply(&reply).ret_code, RetCode::Ok);
    }
}
