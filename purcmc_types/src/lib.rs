//! Wire-level vocabulary for the PurCMC protocol.
//!
//! This crate holds the types that both the frame/message codecs and the
//! request dispatcher need to agree on, mirroring the split between a
//! protocol crate and its consumer used elsewhere in this workspace: codecs
//! produce these types, the dispatcher consumes them, neither has to depend
//! on the other's internals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A request id as sent on the wire. The literal string `-` means "no
/// response expected"; callers should check [`RequestId::is_void`] before
/// installing a pending-response slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub const VOID: &'static str = "-";

    pub fn is_void(&self) -> bool {
        self.0 == Self::VOID
    }

    pub fn void() -> Self {
        RequestId(Self::VOID.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId(s.to_string())
    }
}

/// A 64-bit opaque handle, always serialized as lowercase hex on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub const ZERO: HandleId = HandleId(0);

    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(HandleId)
            .map_err(|_| ParseError::BadHandle(s.to_string()))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::LowerHex for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// The kind of object a [`HandleId`] refers to, recorded in a session's
/// handle table purely for validation; there is no polymorphism implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    PlainWin,
    TabbedWin,
    Container,
    PaneOrTab,
    WebView,
}

/// The target of a request, response, or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Session,
    Workspace,
    PlainWindow,
    Widget,
    Dom,
}

impl FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "session" => Target::Session,
            "workspace" => Target::Workspace,
            "plainwindow" => Target::PlainWindow,
            "widget" => Target::Widget,
            "dom" => Target::Dom,
            other => return Err(ParseError::UnknownTarget(other.to_string())),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Target::Session => "session",
            Target::Workspace => "workspace",
            Target::PlainWindow => "plainwindow",
            Target::Widget => "widget",
            Target::Dom => "dom",
        };
        write!(f, "{s}")
    }
}

/// How an element is designated within a DOM-facing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Handle,
    Handles,
    Id,
    Class,
    Tag,
    Css,
    XPath,
    Void,
}

impl FromStr for ElementKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "handle" => ElementKind::Handle,
            "handles" => ElementKind::Handles,
            "id" => ElementKind::Id,
            "class" => ElementKind::Class,
            "tag" => ElementKind::Tag,
            "css" => ElementKind::Css,
            "xpath" => ElementKind::XPath,
            "void" | "" => ElementKind::Void,
            other => return Err(ParseError::UnknownElementKind(other.to_string())),
        })
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementKind::Handle => "handle",
            ElementKind::Handles => "handles",
            ElementKind::Id => "id",
            ElementKind::Class => "class",
            ElementKind::Tag => "tag",
            ElementKind::Css => "css",
            ElementKind::XPath => "xpath",
            ElementKind::Void => "void",
        };
        write!(f, "{s}")
    }
}

/// An element designator: a kind plus the raw string value (a handle's hex
/// form, a CSS selector, an XPath expression, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSelector {
    pub kind: ElementKind,
    pub value: String,
}

impl ElementSelector {
    pub fn void() -> Self {
        ElementSelector {
            kind: ElementKind::Void,
            value: String::new(),
        }
    }

    /// If this selector names a single handle, parse and return it.
    pub fn as_handle(&self) -> Option<HandleId> {
        if self.kind == ElementKind::Handle {
            HandleId::from_hex(&self.value).ok()
        } else {
            None
        }
    }
}

/// The declared type of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Void,
    Plain,
    Html,
    Json,
}

impl FromStr for DataType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "void" | "" => DataType::Void,
            "plain" => DataType::Plain,
            "html" => DataType::Html,
            "json" => DataType::Json,
            other => return Err(ParseError::UnknownDataType(other.to_string())),
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Void => "void",
            DataType::Plain => "plain",
            DataType::Html => "html",
            DataType::Json => "json",
        };
        write!(f, "{s}")
    }
}

/// A decoded message body, tagged by [`DataType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Void,
    Plain(String),
    Html(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Void => DataType::Void,
            Payload::Plain(_) => DataType::Plain,
            Payload::Html(_) => DataType::Html,
            Payload::Json(_) => DataType::Json,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Void => 0,
            Payload::Plain(s) | Payload::Html(s) => s.len(),
            Payload::Json(v) => serde_json::to_vec(v).map(|v| v.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Plain(s) | Payload::Html(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// The full set of PurCMC request operations. Parsed once from the wire
/// string at message-codec time rather than binary-searched per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    StartSession,
    EndSession,
    CreateWorkspace,
    UpdateWorkspace,
    DestroyWorkspace,
    SetPageGroups,
    AddPageGroups,
    RemovePageGroup,
    CreatePlainWindow,
    UpdatePlainWindow,
    DestroyPlainWindow,
    CreateWidget,
    UpdateWidget,
    DestroyWidget,
    Load,
    LoadFromUrl,
    WriteBegin,
    WriteMore,
    WriteEnd,
    Register,
    Revoke,
    Append,
    Prepend,
    InsertAfter,
    InsertBefore,
    Displace,
    Clear,
    Erase,
    Update,
    CallMethod,
    GetProperty,
    SetProperty,
}

impl FromStr for Op {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "startSession" => Op::StartSession,
            "endSession" => Op::EndSession,
            "createWorkspace" => Op::CreateWorkspace,
            "updateWorkspace" => Op::UpdateWorkspace,
            "destroyWorkspace" => Op::DestroyWorkspace,
            "setPageGroups" => Op::SetPageGroups,
            "addPageGroups" => Op::AddPageGroups,
            "removePageGroup" => Op::RemovePageGroup,
            "createPlainWindow" => Op::CreatePlainWindow,
            "updatePlainWindow" => Op::UpdatePlainWindow,
            "destroyPlainWindow" => Op::DestroyPlainWindow,
            "createWidget" => Op::CreateWidget,
            "updateWidget" => Op::UpdateWidget,
            "destroyWidget" => Op::DestroyWidget,
            "load" => Op::Load,
            "loadFromUrl" => Op::LoadFromUrl,
            "writeBegin" => Op::WriteBegin,
            "writeMore" => Op::WriteMore,
            "writeEnd" => Op::WriteEnd,
            "register" => Op::Register,
            "revoke" => Op::Revoke,
            "append" => Op::Append,
            "prepend" => Op::Prepend,
            "insertAfter" => Op::InsertAfter,
            "insertBefore" => Op::InsertBefore,
            "displace" => Op::Displace,
            "clear" => Op::Clear,
            "erase" => Op::Erase,
            "update" => Op::Update,
            "callMethod" => Op::CallMethod,
            "getProperty" => Op::GetProperty,
            "setProperty" => Op::SetProperty,
            other => return Err(ParseError::UnknownOperation(other.to_string())),
        })
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::StartSession => "startSession",
            Op::EndSession => "endSession",
            Op::CreateWorkspace => "createWorkspace",
            Op::UpdateWorkspace => "updateWorkspace",
            Op::DestroyWorkspace => "destroyWorkspace",
            Op::SetPageGroups => "setPageGroups",
            Op::AddPageGroups => "addPageGroups",
            Op::RemovePageGroup => "removePageGroup",
            Op::CreatePlainWindow => "createPlainWindow",
            Op::UpdatePlainWindow => "updatePlainWindow",
            Op::DestroyPlainWindow => "destroyPlainWindow",
            Op::CreateWidget => "createWidget",
            Op::UpdateWidget => "updateWidget",
            Op::DestroyWidget => "destroyWidget",
            Op::Load => "load",
            Op::LoadFromUrl => "loadFromUrl",
            Op::WriteBegin => "writeBegin",
            Op::WriteMore => "writeMore",
            Op::WriteEnd => "writeEnd",
            Op::Register => "register",
            Op::Revoke => "revoke",
            Op::Append => "append",
            Op::Prepend => "prepend",
            Op::InsertAfter => "insertAfter",
            Op::InsertBefore => "insertBefore",
            Op::Displace => "displace",
            Op::Clear => "clear",
            Op::Erase => "erase",
            Op::Update => "update",
            Op::CallMethod => "callMethod",
            Op::GetProperty => "getProperty",
            Op::SetProperty => "setProperty",
        };
        write!(f, "{s}")
    }
}

/// A parsed request message (spec §3 `Message::Request`).
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub operation: Op,
    pub request_id: RequestId,
    pub target: Target,
    pub target_value: HandleId,
    pub element: ElementSelector,
    pub property: Option<String>,
    pub data_type: DataType,
    pub payload: Payload,
}

/// A parsed response message.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub request_id: RequestId,
    pub ret_code: RetCode,
    pub result_value: HandleId,
    pub data_type: DataType,
    pub payload: Payload,
}

/// A parsed event message.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub event_name: String,
    pub source_uri: String,
    pub target: Target,
    pub target_value: HandleId,
    pub element: ElementSelector,
    pub property: Option<String>,
    pub data_type: DataType,
    pub payload: Payload,
}

/// The three message shapes that can cross the wire.
#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    Event(EventMessage),
}

/// Protocol-level result code embedded in every response, HTTP-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum RetCode {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    NotFound = 404,
    MethodNotAllowed = 405,
    NotAcceptable = 406,
    Conflict = 409,
    PreconditionFailed = 412,
    PacketTooLarge = 413,
    UnprocessablePacket = 422,
    UpgradeRequired = 426,
    InternalServerError = 500,
    NotImplemented = 501,
    ServiceUnavailable = 503,
    InsufficientStorage = 507,
}

impl RetCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_ok(self) -> bool {
        matches!(self, RetCode::Ok)
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Maps a DOM-subprocess reply `state` string to a [`RetCode`], per spec §4.H.
pub fn state_to_ret_code(state: &str) -> RetCode {
    match state {
        "Ok" => RetCode::Ok,
        "NotFound" => RetCode::NotFound,
        "NotImplemented" => RetCode::NotImplemented,
        "PartialContent" => RetCode::Ok,
        "BadRequest" => RetCode::BadRequest,
        _ => RetCode::InternalServerError,
    }
}

/// Errors raised while parsing wire-format fragments into the types above.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("unknown target `{0}`")]
    UnknownTarget(String),
    #[error("unknown element type `{0}`")]
    UnknownElementKind(String),
    #[error("unknown data type `{0}`")]
    UnknownDataType(String),
    #[error("malformed handle `{0}`")]
    BadHandle(String),
    #[error("missing required header `{0}`")]
    MissingHeader(&'static str),
    #[error("malformed header `{0}`: {1}")]
    MalformedHeader(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_round_trips_through_display_and_from_str() {
        for op in [
            Op::StartSession,
            Op::CreatePlainWindow,
            Op::CallMethod,
            Op::SetProperty,
        ] {
            let s = op.to_string();
            assert_eq!(Op::from_str(&s).unwrap(), op);
        }
    }

    #[test]
    fn request_id_void_marker() {
        assert!(RequestId::void().is_void());
        assert!(!RequestId::from("7").is_void());
    }

    #[test]
    fn handle_hex_round_trip() {
        let h = HandleId(0xdead_beef);
        let s = h.to_string();
        assert_eq!(HandleId::from_hex(&s).unwrap(), h);
    }

    #[test]
    fn state_mapping_defaults_to_internal_error() {
        assert_eq!(state_to_ret_code("Ok"), RetCode::Ok);
        assert_eq!(state_to_ret_code("whatever"), RetCode::InternalServerError);
    }
}
