//! Component E: session handshake (spec §4.E).

use serde::Deserialize;

use purcmc_types::HandleKind;

use crate::backend::ConfirmationDialog;
use crate::endpoint::{is_valid_identifier, AuthState, Endpoint, EndpointName};
use crate::error::{Result, RetCode, ServerError};
use crate::session::Session;

pub const PROTOCOL_NAME: &str = "PURCMC";
pub const PROTOCOL_VERSION: u32 = 120;
pub const MIN_PROTOCOL_VERSION: u32 = 100;

/// Body of the peer's `startSession` request (spec §4.E).
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    #[serde(rename = "protocolName")]
    pub protocol_name: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "appName")]
    pub app_name: String,
    #[serde(rename = "runnerName")]
    pub runner_name: String,
    #[serde(rename = "appLabel")]
    pub app_label: Option<String>,
    #[serde(rename = "appDesc")]
    pub app_desc: Option<String>,
    #[serde(rename = "iconUrl")]
    pub icon_url: Option<String>,
    pub signature: Option<String>,
    #[serde(default, rename = "allowSwitchingRdr")]
    pub allow_switching_rdr: bool,
    #[serde(default, rename = "allowScalingByDensity")]
    pub allow_scaling_by_density: bool,
    #[serde(default)]
    pub duplicate: bool,
}

/// Feature manifest sent immediately on accept, before any request is read
/// (spec §6 "Initial response").
pub fn initial_response_body(product_name: &str, max_workspaces: u32, is_websocket: bool) -> String {
    let mut lines = vec![
        format!("protocolName:{PROTOCOL_NAME}"),
        format!("protocolVersion:{PROTOCOL_VERSION}"),
        format!("productName:{product_name}"),
        format!("maxWorkspaces:{max_workspaces}"),
        "locale:en_US".to_string(),
        "displayDensity:1".to_string(),
    ];
    if is_websocket {
        lines.push(format!("challengeCode:{}", generate_challenge_code()));
    }
    lines.join("\n")
}

/// HMAC-SHA256 of a constant app identifier, keyed by a random nonce, hex
/// encoded (spec §4.E).
fn generate_challenge_code() -> String {
    use hmac::{Hmac, Mac};
    use rand::RngCore;
    use sha2::Sha256;

    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&nonce).expect("any key length is valid for HMAC-SHA256");
    mac.update(b"org.hvml.purcmc");
    let out = mac.finalize().into_bytes();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// Runs the five validation steps of spec §4.E in order, stopping at the
/// first failure. On success returns the validated name; the caller still
/// needs to check for the `duplicate:true` deferred path and for name
/// collisions against the registry.
pub fn validate(req: &StartSessionRequest) -> Result<EndpointName> {
    if req.protocol_name != PROTOCOL_NAME
        || req.protocol_version > PROTOCOL_VERSION
        || req.protocol_version < MIN_PROTOCOL_VERSION
    {
        return Err(ServerError::Protocol(RetCode::UpgradeRequired));
    }

    let name = EndpointName {
        host: req.host_name.clone(),
        app: req.app_name.clone(),
        runner: req.runner_name.clone(),
    };
    if !name.is_syntactically_valid() {
        return Err(ServerError::Protocol(RetCode::NotAcceptable));
    }

    let label_ok = req.app_label.as_deref().is_some_and(|s| !s.is_empty());
    let desc_ok = req.app_desc.as_deref().is_some_and(|s| !s.is_empty());
    if !label_ok || !desc_ok {
        return Err(ServerError::Protocol(RetCode::Unauthorized));
    }

    Ok(name)
}

pub fn is_valid_name_component(s: &str) -> bool {
    is_valid_identifier(s)
}

/// Whether the request wants the confirmation-dialog path (spec §4.E step
/// 5: "if request carries `signature` and the app is not pre-approved").
pub fn needs_confirmation(req: &StartSessionRequest, pre_approved: bool) -> bool {
    req.signature.is_some() && !pre_approved
}

/// Runs the confirmation dialog collaborator and maps its answer to the
/// spec's outcome (`Unauthorized` on reject).
pub async fn confirm(
    dialog: &mut dyn ConfirmationDialog,
    name: &EndpointName,
    timeout_seconds: u32,
) -> Result<()> {
    if dialog.confirm(&name.to_string(), timeout_seconds).await {
        Ok(())
    } else {
        Err(ServerError::Protocol(RetCode::Unauthorized))
    }
}

/// Completes a successful handshake: transitions the endpoint to `Ready`
/// and installs a freshly created session, returning the session handle to
/// report as `resultValue` (spec §4.E "response carries the session handle
/// as resultValue").
pub fn accept_endpoint(endpoint: &mut Endpoint, name: EndpointName) -> purcmc_types::HandleId {
    let mut session = Session::new();
    let handle = session.register_handle(HandleKind::PlainWin);
    endpoint.name = Some(name);
    endpoint.state = AuthState::Ready;
    endpoint.session = Some(session);
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StartSessionRequest {
        StartSessionRequest {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            host_name: "localhost".into(),
            app_name: "com.example".into(),
            runner_name: "main".into(),
            app_label: Some("X".into()),
            app_desc: Some("Y".into()),
            icon_url: None,
            signature: None,
            allow_switching_rdr: false,
            allow_scaling_by_density: false,
            duplicate: false,
        }
    }

    #[test]
    fn validates_a_well_formed_request() {
        let name = validate(&sample()).unwrap();
        assert_eq!(name.to_string(), "@localhost/com.example/main");
    }

    #[test]
    fn rejects_stale_protocol_version() {
        let mut req = sample();
        req.protocol_version = MIN_PROTOCOL_VERSION - 1;
        assert!(matches!(
            validate(&req),
            Err(ServerError::Protocol(RetCode::UpgradeRequired))
        ));
    }

    #[test]
    fn rejects_missing_label_or_description() {
        let mut req = sample();
        req.app_label = None;
        assert!(matches!(
            validate(&req),
            Err(ServerError::Protocol(RetCode::Unauthorized))
        ));
    }

    #[test]
    fn needs_confirmation_only_when_signed_and_not_pre_approved() {
        let mut req = sample();
        assert!(!needs_confirmation(&req, false));
        req.signature = Some("sig".into());
        assert!(needs_confirmation(&req, false));
        assert!(!needs_confirmation(&req, true));
    }
}
