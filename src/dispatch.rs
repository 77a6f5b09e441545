//! Component F: the request dispatcher (spec §4.F).
//!
//! Per spec §9's redesign note, operation lookup is a `match` over
//! [`Op`] parsed once by the message codec, replacing the original's
//! binary-searched string table — the same job, done with the type
//! system instead of a sorted array.

use purcmc_types::{
    DataType, EventMessage, HandleId, HandleKind, Op, Payload, RequestMessage, ResponseMessage, RetCode, Target,
};

use crate::backend::{RenderChannel, WidgetBackend};
use crate::endpoint::EndpointId;
use crate::error::{Result, ServerError};
use crate::model::page::{parse_name_and_group, Page, PageName};
use crate::model::workspace::{Owner, Workspace};
use crate::session::Session;
use crate::{dom, events};

/// Bundles everything one dispatch call needs: the calling endpoint's own
/// session and the shared workspace for its `(host, app)`, plus the two
/// external collaborators most operations marshal into, plus a place to
/// stash events bound for *other* endpoints — only `src/server.rs` can
/// reach another endpoint's socket, so a handler queues them here and the
/// event loop routes them after dispatch returns.
pub struct DispatchContext<'a> {
    pub endpoint_id: EndpointId,
    pub session: &'a mut Session,
    pub workspace: &'a mut Workspace,
    pub backend: &'a mut dyn WidgetBackend,
    pub render: &'a mut dyn RenderChannel,
    pub outbound_events: &'a mut Vec<(EndpointId, EventMessage)>,
}

/// Outcome of dispatching one request: either a response ready to send
/// immediately, or `Deferred` when the handler installed a pending-response
/// slot and will be answered later by the DOM pipeline (spec §4.F step 3).
pub enum Outcome {
    Respond(ResponseMessage),
    Deferred,
    /// `endSession` and fire-and-forget ops that never reply, even on
    /// success.
    NoReply,
}

fn ok(request_id: &purcmc_types::RequestId, result_value: HandleId) -> Outcome {
    Outcome::Respond(ResponseMessage {
        request_id: request_id.clone(),
        ret_code: RetCode::Ok,
        result_value,
        data_type: DataType::Void,
        payload: Payload::Void,
    })
}

fn ok_with_plaintext(request_id: &purcmc_types::RequestId, result_value: HandleId, text: String) -> Outcome {
    Outcome::Respond(ResponseMessage {
        request_id: request_id.clone(),
        ret_code: RetCode::Ok,
        result_value,
        data_type: DataType::Plain,
        payload: Payload::Plain(text),
    })
}

fn err(request_id: &purcmc_types::RequestId, code: RetCode) -> Outcome {
    Outcome::Respond(ResponseMessage {
        request_id: request_id.clone(),
        ret_code: code,
        result_value: HandleId::ZERO,
        data_type: DataType::Void,
        payload: Payload::Void,
    })
}

/// Entry point invoked once an endpoint is `Ready` and a request has been
/// parsed. `startSession` is handled before a session exists and never
/// reaches this function (see `src/handshake.rs`, `src/server.rs`).
pub async fn dispatch(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    match req.operation {
        Op::StartSession => Ok(err(&req.request_id, RetCode::BadRequest)),
        Op::EndSession => {
            end_session(ctx);
            Ok(Outcome::NoReply)
        }

        Op::CreateWorkspace | Op::UpdateWorkspace | Op::DestroyWorkspace => {
            Ok(err(&req.request_id, RetCode::NotImplemented))
        }

        Op::SetPageGroups => {
            if ctx.workspace.layouter_installed {
                return Ok(err(&req.request_id, RetCode::Conflict));
            }
            ctx.workspace.layouter_installed = true;
            Ok(ok(&req.request_id, HandleId::ZERO))
        }
        Op::AddPageGroups | Op::RemovePageGroup => {
            if !ctx.workspace.layouter_installed {
                return Ok(err(&req.request_id, RetCode::PreconditionFailed));
            }
            Ok(ok(&req.request_id, HandleId::ZERO))
        }

        Op::CreatePlainWindow => create_page(ctx, req, false).await,
        Op::CreateWidget => create_page(ctx, req, true).await,

        Op::UpdatePlainWindow | Op::UpdateWidget => {
            let expected = if req.operation == Op::UpdatePlainWindow {
                HandleKind::PlainWin
            } else {
                HandleKind::PaneOrTab
            };
            ctx.session.handles.check(req.target_value, expected)?;
            Ok(ok(&req.request_id, req.target_value))
        }

        Op::DestroyPlainWindow | Op::DestroyWidget => {
            let (expected, target) = if req.operation == Op::DestroyPlainWindow {
                (HandleKind::PlainWin, Target::PlainWindow)
            } else {
                (HandleKind::PaneOrTab, Target::Widget)
            };
            ctx.session.handles.check(req.target_value, expected)?;
            ctx.backend.destroy_container(req.target_value).await?;
            if let Some(page) = ctx.workspace.pages.get(&req.target_value).cloned() {
                ctx.session.destroy_handle(page.view().0);
                if let Some(stack) = ctx.workspace.page_owners.get(&req.target_value) {
                    for owner in stack.owners() {
                        if owner.session != ctx.endpoint_id {
                            ctx.outbound_events
                                .push((owner.session, events::destroy_event(target, req.target_value)));
                        }
                    }
                }
                ctx.workspace.destroy_page(req.target_value);
            }
            ctx.session.destroy_handle(req.target_value);
            Ok(ok(&req.request_id, HandleId::ZERO))
        }

        Op::Load | Op::LoadFromUrl => load_page(ctx, req).await,

        Op::WriteBegin | Op::WriteMore | Op::WriteEnd => {
            ctx.session.handles.check(req.target_value, HandleKind::WebView)?;
            Ok(ok(&req.request_id, req.target_value))
        }

        Op::Register => register(ctx, req),
        Op::Revoke => revoke(ctx, req),

        Op::Append
        | Op::Prepend
        | Op::InsertAfter
        | Op::InsertBefore
        | Op::Displace
        | Op::Clear
        | Op::Erase
        | Op::Update => dom_mutation(ctx, req).await,

        Op::CallMethod => call_method(ctx, req).await,
        Op::GetProperty => get_property(ctx, req).await,
        Op::SetProperty => set_property(ctx, req).await,
    }
}

async fn create_page(ctx: &mut DispatchContext<'_>, req: &RequestMessage, widget: bool) -> Result<Outcome> {
    let (name, group) = parse_name_and_group(&req.element.value);
    if let PageName::Literal(name) = &name {
        if let Some(existing) = ctx.workspace.find_page(name, group) {
            return Ok(ok(&req.request_id, existing.container()));
        }
        let (container, view) = if widget {
            ctx.backend.create_widget(name, group).await?
        } else {
            ctx.backend.create_plain_window(name, group).await?
        };
        let container_kind = if widget { HandleKind::PaneOrTab } else { HandleKind::PlainWin };
        ctx.session.adopt_handle(container, container_kind);
        ctx.session.adopt_handle(view, HandleKind::WebView);
        let group = group.map(str::to_string);
        let page = if widget {
            Page::Widget {
                container,
                view: crate::model::page::WebViewId(view),
                name: name.clone(),
                group,
            }
        } else {
            Page::PlainWindow {
                container,
                view: crate::model::page::WebViewId(view),
                name: name.clone(),
                group,
            }
        };
        ctx.workspace.insert_page(page);
        Ok(ok(&req.request_id, container))
    } else {
        let resolved = ctx.backend.resolve_reserved(&name, group).await?;
        match resolved {
            Some(handle) => Ok(ok(&req.request_id, handle)),
            None => Ok(err(&req.request_id, RetCode::NotFound)),
        }
    }
}

async fn load_page(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    ctx.session.handles.check(req.target_value, HandleKind::PlainWin)
        .or_else(|_| ctx.session.handles.check(req.target_value, HandleKind::PaneOrTab))?;

    let Some(page) = ctx.workspace.pages.get(&req.target_value).cloned() else {
        return Ok(err(&req.request_id, RetCode::NotFound));
    };
    let coroutine = ctx.session.register_handle(HandleKind::WebView);
    let owners = ctx.workspace.owners_for(req.target_value);
    let suppressed = owners.register(Owner { session: ctx.endpoint_id, coroutine });

    let envelope = dom::mutation_envelope(
        if req.operation == Op::Load { "load" } else { "loadFromUrl" },
        &req.request_id.0,
        &req.element,
        &req.payload,
    );
    ctx.render.send(page.view().0, serde_json::to_value(&envelope)?).await?;
    ctx.session.pend_response(req.request_id.0.clone(), req.target_value, None)?;

    if let Some(prior) = suppressed {
        if prior.session != ctx.endpoint_id {
            ctx.outbound_events
                .push((prior.session, events::page_owner_event("suppressPage", req.target_value)));
        }
    }
    Ok(Outcome::Deferred)
}

/// `endSession` teardown (spec §4.F "teardown session"): frees every handle
/// the session minted, revokes its page ownership (emitting `reloadPage` to
/// whichever session now owns the top of each affected stack), and drops
/// any still-outstanding pending responses.
fn end_session(ctx: &mut DispatchContext<'_>) {
    for (container, new_top) in ctx.workspace.revoke_all(ctx.endpoint_id) {
        ctx.outbound_events
            .push((new_top.session, events::page_owner_event("reloadPage", container)));
    }
    for handle in std::mem::take(&mut ctx.session.all_handles) {
        ctx.session.handles.free(handle);
    }
    ctx.session.pending.clear();
}

fn register(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let Some(coroutine) = req.element.as_handle() else {
        return Ok(err(&req.request_id, RetCode::BadRequest));
    };
    let owners = ctx.workspace.owners_for(req.target_value);
    let suppressed = owners.register(Owner { session: ctx.endpoint_id, coroutine });
    match suppressed {
        Some(prior) => Ok(ok_with_plaintext(&req.request_id, coroutine, prior.coroutine.to_string())),
        None => Ok(ok(&req.request_id, coroutine)),
    }
}

fn revoke(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let Some(coroutine) = req.element.as_handle() else {
        return Ok(err(&req.request_id, RetCode::BadRequest));
    };
    let owners = ctx.workspace.owners_for(req.target_value);
    let reload = owners.revoke(Owner { session: ctx.endpoint_id, coroutine });
    match reload {
        Some(new_top) => Ok(ok_with_plaintext(&req.request_id, coroutine, new_top.coroutine.to_string())),
        None => Ok(ok(&req.request_id, coroutine)),
    }
}

fn dom_target_view(ctx: &DispatchContext<'_>, req: &RequestMessage) -> Result<HandleId> {
    match req.target {
        Target::Dom => {
            if ctx.session.handles.is_live(req.target_value) {
                Ok(req.target_value)
            } else {
                Err(ServerError::Protocol(RetCode::NotFound))
            }
        }
        _ => Err(ServerError::Protocol(RetCode::BadRequest)),
    }
}

async fn dom_mutation(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let view = dom_target_view(ctx, req)?;
    let op_name: &'static str = match req.operation {
        Op::Append => "append",
        Op::Prepend => "prepend",
        Op::InsertAfter => "insertAfter",
        Op::InsertBefore => "insertBefore",
        Op::Displace => "displace",
        Op::Clear => "clear",
        Op::Erase => "erase",
        Op::Update => "update",
        _ => unreachable!(),
    };
    let envelope = dom::mutation_envelope(op_name, &req.request_id.0, &req.element, &req.payload);
    ctx.render.send(view, serde_json::to_value(&envelope)?).await?;
    if req.request_id.is_void() {
        return Ok(Outcome::NoReply);
    }
    ctx.session.pend_response(req.request_id.0.clone(), req.target_value, None)?;
    Ok(Outcome::Deferred)
}

async fn call_method(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let json = req.payload.as_json().cloned().unwrap_or(serde_json::Value::Null);
    let method = json.get("method").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let arg = json.get("arg").cloned().unwrap_or(serde_json::Value::Null);

    let view = match req.target {
        Target::Dom => dom_target_view(ctx, req)?,
        Target::Session => req.target_value,
        _ => return Ok(err(&req.request_id, RetCode::BadRequest)),
    };
    let envelope = dom::call_method_envelope(&req.request_id.0, &req.element, &method, arg);
    ctx.render.send(view, envelope).await?;
    if req.request_id.is_void() {
        return Ok(Outcome::NoReply);
    }
    ctx.session.pend_response(req.request_id.0.clone(), req.target_value, None)?;
    Ok(Outcome::Deferred)
}

async fn get_property(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let view = dom_target_view(ctx, req)?;
    let Some(property) = &req.property else {
        return Ok(err(&req.request_id, RetCode::BadRequest));
    };
    let envelope = dom::get_property_envelope(&req.request_id.0, &req.element, property);
    ctx.render.send(view, envelope).await?;
    ctx.session.pend_response(req.request_id.0.clone(), req.target_value, None)?;
    Ok(Outcome::Deferred)
}

async fn set_property(ctx: &mut DispatchContext<'_>, req: &RequestMessage) -> Result<Outcome> {
    let view = dom_target_view(ctx, req)?;
    let Some(property) = &req.property else {
        return Ok(err(&req.request_id, RetCode::BadRequest));
    };
    let value = req.payload.as_json().cloned().unwrap_or(serde_json::Value::Null);
    let envelope = dom::set_property_envelope(&req.request_id.0, &req.element, property, value);
    ctx.render.send(view, envelope).await?;
    // setProperty with requestId == "-" omits the response (spec §4.F table).
    if req.request_id.is_void() {
        return Ok(Outcome::NoReply);
    }
    ctx.session.pend_response(req.request_id.0.clone(), req.target_value, None)?;
    Ok(Outcome::Deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use purcmc_types::{ElementKind, ElementSelector, RequestId};

    struct FakeBackend {
        next: u64,
    }

    #[async_trait]
    impl WidgetBackend for FakeBackend {
        async fn create_plain_window(&mut self, _name: &str, _group: Option<&str>) -> Result<(HandleId, HandleId)> {
            let container = HandleId(self.next);
            let view = HandleId(self.next + 1);
            self.next += 2;
            Ok((container, view))
        }

        async fn create_widget(&mut self, name: &str, group: Option<&str>) -> Result<(HandleId, HandleId)> {
            self.create_plain_window(name, group).await
        }

        async fn destroy_container(&mut self, _container: HandleId) -> Result<()> {
            Ok(())
        }

        async fn resolve_reserved(&self, _name: &PageName, _group: Option<&str>) -> Result<Option<HandleId>> {
            Ok(None)
        }
    }

    struct FakeRenderChannel {
        sent: Vec<(HandleId, serde_json::Value)>,
    }

    #[async_trait]
    impl RenderChannel for FakeRenderChannel {
        async fn send(&mut self, view: HandleId, envelope: serde_json::Value) -> Result<()> {
            self.sent.push((view, envelope));
            Ok(())
        }
    }

    fn request(op: Op, target: Target, target_value: HandleId, request_id: &str) -> RequestMessage {
        RequestMessage {
            operation: op,
            request_id: RequestId::from(request_id),
            target,
            target_value,
            element: ElementSelector { kind: ElementKind::Void, value: "main".into() },
            property: None,
            data_type: DataType::Void,
            payload: Payload::Void,
        }
    }

    #[tokio::test]
    async fn create_plain_window_registers_a_container_handle() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let req = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "1");
        match dispatch(&mut ctx, &req).await.unwrap() {
            Outcome::Respond(resp) => {
                assert_eq!(resp.ret_code, RetCode::Ok);
                assert!(ctx.session.handles.is_live(resp.result_value));
            }
            _ => panic!("expected an immediate response"),
        }
    }

    #[tokio::test]
    async fn creating_the_same_plain_window_twice_returns_the_existing_container() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let req = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "1");
        let first = match dispatch(&mut ctx, &req).await.unwrap() {
            Outcome::Respond(resp) => resp.result_value,
            _ => panic!("expected an immediate response"),
        };
        let req2 = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "2");
        let second = match dispatch(&mut ctx, &req2).await.unwrap() {
            Outcome::Respond(resp) => resp.result_value,
            _ => panic!("expected an immediate response"),
        };
        assert_eq!(first, second);
        assert_eq!(backend.next, 3, "the second call must not mint another container/view pair");
    }

    #[tokio::test]
    async fn creating_a_differently_named_window_does_not_collide_with_an_existing_one() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let mut req = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "1");
        req.element.value = "main".into();
        let first = match dispatch(&mut ctx, &req).await.unwrap() {
            Outcome::Respond(resp) => resp.result_value,
            _ => panic!("expected an immediate response"),
        };
        let mut req2 = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "2");
        req2.element.value = "settings".into();
        let second = match dispatch(&mut ctx, &req2).await.unwrap() {
            Outcome::Respond(resp) => resp.result_value,
            _ => panic!("expected an immediate response"),
        };
        assert_ne!(first, second, "a different name must mint a new page, not reuse the first one");
    }

    #[tokio::test]
    async fn destroying_a_page_notifies_other_owners_but_not_the_caller() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let create = request(Op::CreatePlainWindow, Target::Workspace, HandleId::ZERO, "1");
        let container = match dispatch(&mut ctx, &create).await.unwrap() {
            Outcome::Respond(resp) => resp.result_value,
            _ => panic!("expected an immediate response"),
        };
        ctx.workspace
            .owners_for(container)
            .register(Owner { session: EndpointId(2), coroutine: HandleId(99) });

        let destroy = request(Op::DestroyPlainWindow, Target::PlainWindow, container, "2");
        match dispatch(&mut ctx, &destroy).await.unwrap() {
            Outcome::Respond(resp) => assert_eq!(resp.ret_code, RetCode::Ok),
            _ => panic!("expected an immediate response"),
        }
        assert_eq!(outbound_events.len(), 1);
        assert_eq!(outbound_events[0].0, EndpointId(2));
        assert_eq!(outbound_events[0].1.event_name, "destroy");
    }

    #[tokio::test]
    async fn end_session_revokes_ownership_and_reloads_the_new_top() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let container = HandleId(42);
        ctx.workspace
            .owners_for(container)
            .register(Owner { session: EndpointId(2), coroutine: HandleId(1) });
        ctx.workspace
            .owners_for(container)
            .register(Owner { session: EndpointId(1), coroutine: HandleId(2) });
        let handle = ctx.session.register_handle(HandleKind::WebView);
        ctx.session.pend_response("1", HandleId::ZERO, None).unwrap();

        let req = request(Op::EndSession, Target::Session, HandleId::ZERO, "-");
        match dispatch(&mut ctx, &req).await.unwrap() {
            Outcome::NoReply => {}
            _ => panic!("endSession never replies"),
        }

        assert!(!ctx.session.handles.is_live(handle));
        assert!(ctx.session.pending.is_empty());
        assert_eq!(outbound_events.len(), 1);
        assert_eq!(outbound_events[0].0, EndpointId(2));
        assert_eq!(outbound_events[0].1.event_name, "reloadPage");
    }

    #[tokio::test]
    async fn dom_mutation_with_void_request_id_skips_the_reply() {
        let mut session = Session::new();
        let mut workspace = Workspace::new();
        let mut backend = FakeBackend { next: 1 };
        let mut render = FakeRenderChannel { sent: Vec::new() };
        let view = session.register_handle(HandleKind::WebView);
        let mut outbound_events = Vec::new();
        let mut ctx = DispatchContext {
            endpoint_id: EndpointId(1),
            session: &mut session,
            workspace: &mut workspace,
            backend: &mut backend,
            render: &mut render,
            outbound_events: &mut outbound_events,
        };
        let req = request(Op::Update, Target::Dom, view, "-");
        match dispatch(&mut ctx, &req).await.unwrap() {
            Outcome::NoReply => {}
            _ => panic!("expected no reply for a void request id"),
        }
        assert_eq!(render.sent.len(), 1);
    }
}
