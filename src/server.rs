//! The single-threaded event loop (spec §4.B, §5).
//!
//! Plays the role of the teacher's `Handler: Stream` — one task, polling
//! every socket and the idle timer, with no `tokio::spawn` of
//! per-connection work. Rather than a literal `impl Stream`, readiness is
//! multiplexed with `FuturesUnordered` over cancel-safe `AsyncRead` calls
//! (tokio's `read()` is documented cancellation-safe), rebuilt each loop
//! iteration; the effect is the same single-task multiplexed poll the
//! teacher's `poll_next` achieves by draining several maps in one body.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use purcmc_types::{DataType, EventMessage, HandleId, Message, Payload, RequestId, ResponseMessage, RetCode};

use crate::backend::{FocusChange, RenderChannel, WidgetBackend};
use crate::dispatch::{self, DispatchContext, Outcome};
use crate::dom;
use crate::endpoint::EndpointId;
use crate::error::{Result, ServerError};
use crate::events;
use crate::frame::unix::{self as unix_frame, UnixEvent, UnixOp};
use crate::frame::ws::{self as ws_frame, WsEvent};
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::handshake::{self, StartSessionRequest};
use crate::message;
use crate::model::workspace::Workspace;
use crate::registry::Registry;
use crate::transport::client::{ClientIo, OutboundQueue};
use crate::transport::listener::Listener;

/// Timeouts spec §4.B and §5 name without fixing a value for; these are the
/// server's configured defaults.
pub struct Timeouts {
    pub dangling_sweep: Duration,
    pub activity_sweep: Duration,
    pub max_no_responding: Duration,
    pub max_ping_time: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dangling_sweep: Duration::from_secs(5),
            activity_sweep: Duration::from_secs(10),
            max_no_responding: Duration::from_secs(60),
            max_ping_time: Duration::from_secs(30),
        }
    }
}

struct ClientState {
    io: ClientIo,
    outbox: OutboundQueue,
}

enum InboundEvent {
    Unix(UnixEvent),
    Ws(WsEvent),
}

/// Owns every socket and every piece of server state; there is exactly one
/// of these per process (spec §5 "One event loop owns every socket and
/// every piece of server state").
pub struct Server {
    registry: Registry,
    workspaces: HashMap<(String, String), Workspace>,
    clients: HashMap<EndpointId, ClientState>,
    backend: Box<dyn WidgetBackend>,
    render: Box<dyn RenderChannel>,
    timeouts: Timeouts,
    product_name: String,
    last_dangling_sweep: Instant,
    last_activity_sweep: Instant,
    /// Sender half handed to whatever drives the rendering subprocess's own
    /// connection; `reply_rx` is the matching arm in `run`'s `select!` (spec
    /// §4.H steps 4-5).
    reply_tx: tokio::sync::mpsc::UnboundedSender<dom::RenderReply>,
    reply_rx: tokio::sync::mpsc::UnboundedReceiver<dom::RenderReply>,
    /// Sender half handed to whatever drives the host toolkit's own focus
    /// notifications; `focus_rx` is the matching arm in `run`'s `select!`
    /// (spec §4.I "pageActivated/pageDeactivated when the backend reports
    /// focus changes").
    focus_tx: tokio::sync::mpsc::UnboundedSender<FocusChange>,
    focus_rx: tokio::sync::mpsc::UnboundedReceiver<FocusChange>,
}

impl Server {
    pub fn new(backend: Box<dyn WidgetBackend>, render: Box<dyn RenderChannel>, product_name: String) -> Self {
        let now = Instant::now();
        let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
        let (focus_tx, focus_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            registry: Registry::new(),
            workspaces: HashMap::new(),
            clients: HashMap::new(),
            backend,
            render,
            timeouts: Timeouts::default(),
            product_name,
            last_dangling_sweep: now,
            last_activity_sweep: now,
            reply_tx,
            reply_rx,
            focus_tx,
            focus_rx,
        }
    }

    /// A clonable handle onto the server's reply channel, for whatever reads
    /// the rendering subprocess's own connection and needs to feed
    /// `page-ready` replies and subprocess events back into the loop.
    pub fn reply_sender(&self) -> tokio::sync::mpsc::UnboundedSender<dom::RenderReply> {
        self.reply_tx.clone()
    }

    /// A clonable handle onto the server's focus-change channel, for
    /// whatever observes the host toolkit's window focus events.
    pub fn focus_sender(&self) -> tokio::sync::mpsc::UnboundedSender<FocusChange> {
        self.focus_tx.clone()
    }

    pub async fn run(&mut self, mut listener: Listener) -> Result<()> {
        let mut idle = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                biased;
                Ok((stream, _)) = accept_unix(&mut listener.unix) => {
                    self.on_accept(ClientIo::unix(stream)).await?;
                }
                Ok((stream, _)) = accept_tcp(&mut listener.tcp) => {
                    self.on_accept(ClientIo::ws(stream)).await?;
                }
                Some((id, closed)) = select_ready_client(&mut self.clients) => {
                    if closed {
                        self.close_client(id).await;
                    } else {
                        self.on_readable(id).await?;
                    }
                }
                Some(reply) = self.reply_rx.recv() => {
                    self.on_render_reply(reply).await?;
                }
                Some(change) = self.focus_rx.recv() => {
                    self.on_focus_change(change).await;
                }
                _ = idle.tick() => {
                    self.run_idle_sweep().await?;
                }
            }
        }
    }

    async fn on_accept(&mut self, io: ClientIo) -> Result<()> {
        let now = Instant::now();
        let id = self.registry.accept(now);
        let mut state = ClientState {
            io,
            outbox: OutboundQueue::new(),
        };
        // Unix peers get the feature manifest immediately; WebSocket peers
        // get it only once the HTTP upgrade handshake completes (see
        // `poll_ws`), since nothing can be written as a WS data frame before
        // the 101 response is sent.
        if matches!(state.io, ClientIo::Unix { .. }) {
            let body = handshake::initial_response_body(&self.product_name, 16, false);
            let frame = unix_frame::encode_message(&encode_initial_response(&body), true, DEFAULT_MAX_FRAME_SIZE);
            state.outbox.push(frame);
            state.outbox.flush(&mut state.io).await?;
        }
        self.clients.insert(id, state);
        Ok(())
    }

    async fn on_readable(&mut self, id: EndpointId) -> Result<()> {
        loop {
            let is_ws = matches!(
                self.clients.get(&id).map(|s| &s.io),
                Some(ClientIo::Ws { .. })
            );
            let event: Result<Option<InboundEvent>> = if is_ws {
                self.poll_ws(id).map(|opt| opt.map(InboundEvent::Ws))
            } else {
                match self.clients.get_mut(&id) {
                    None => return Ok(()),
                    Some(state) => {
                        let ClientIo::Unix { decoder, .. } = &mut state.io else {
                            unreachable!()
                        };
                        decoder
                            .poll()
                            .map(|opt| opt.map(InboundEvent::Unix))
                            .map_err(ServerError::from)
                    }
                }
            };

            let event = match event {
                Ok(e) => e,
                Err(_) => {
                    self.close_client(id).await;
                    return Ok(());
                }
            };

            match event {
                None => break,
                Some(InboundEvent::Unix(ev)) => {
                    if self.handle_unix_event(id, ev).await? {
                        return Ok(());
                    }
                }
                Some(InboundEvent::Ws(ev)) => {
                    if self.handle_ws_event(id, ev).await? {
                        return Ok(());
                    }
                }
            }
        }
        if let Some(state) = self.clients.get_mut(&id) {
            let _ = state.outbox.flush(&mut state.io).await;
        }
        Ok(())
    }

    /// Returns `true` if the connection was closed.
    async fn handle_unix_event(&mut self, id: EndpointId, ev: UnixEvent) -> Result<bool> {
        match ev {
            UnixEvent::Message { body, is_text } => {
                self.on_message_body(id, body, is_text).await?;
                Ok(false)
            }
            UnixEvent::PongNeeded => {
                if let Some(state) = self.clients.get_mut(&id) {
                    state.outbox.push(unix_frame::encode_control(UnixOp::Pong).to_vec());
                }
                Ok(false)
            }
            UnixEvent::PongReceived => {
                self.registry.touch(id, Instant::now());
                Ok(false)
            }
            UnixEvent::Close => {
                self.close_client(id).await;
                Ok(true)
            }
        }
    }

    /// Returns `true` if the connection was closed.
    async fn handle_ws_event(&mut self, id: EndpointId, ev: WsEvent) -> Result<bool> {
        match ev {
            WsEvent::Message { body, is_text } => {
                self.on_message_body(id, body, is_text).await?;
                Ok(false)
            }
            WsEvent::PongNeeded { payload } => {
                if let Some(state) = self.clients.get_mut(&id) {
                    state.outbox.push(ws_frame::encode_pong(&payload));
                }
                Ok(false)
            }
            WsEvent::PongReceived => {
                self.registry.touch(id, Instant::now());
                Ok(false)
            }
            WsEvent::Close { code, reason } => {
                if let Some(state) = self.clients.get_mut(&id) {
                    state.outbox.push(ws_frame::encode_close(code, &reason));
                    let _ = state.outbox.flush(&mut state.io).await;
                }
                self.close_client(id).await;
                Ok(true)
            }
        }
    }

    /// Drives the WebSocket upgrade handshake out of the client's raw
    /// pre-frame buffer, or polls the frame decoder once it's done.
    fn poll_ws(&mut self, id: EndpointId) -> Result<Option<WsEvent>> {
        let product_name = self.product_name.clone();
        let Some(state) = self.clients.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(buf) = state.io.ws_handshake_buf() {
            return match ws_frame::parse_handshake(buf)? {
                None => Ok(None),
                Some((req, consumed)) => {
                    let accept = ws_frame::accept_key(&req.key);
                    let response = ws_frame::handshake_success_response(&accept, "purcmc");
                    state.io.complete_ws_handshake(consumed);
                    state.outbox.push(response.into_bytes());
                    let body = handshake::initial_response_body(&product_name, 16, true);
                    state
                        .outbox
                        .push(ws_frame::encode_message(&encode_initial_response(&body), true));
                    Ok(None)
                }
            };
        }
        let ClientIo::Ws { decoder, .. } = &mut state.io else {
            unreachable!()
        };
        decoder.poll().map_err(Into::into)
    }

    async fn on_message_body(&mut self, id: EndpointId, body: Vec<u8>, _is_text: bool) -> Result<()> {
        self.registry.touch(id, Instant::now());
        let (msg, _) = match message::try_parse(&body) {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        self.on_message(id, msg).await
    }

    async fn on_message(&mut self, id: EndpointId, msg: Message) -> Result<()> {
        let Message::Request(req) = msg else {
            return Ok(());
        };

        let ready = self.registry.get(id).map(|e| e.is_ready()).unwrap_or(false);
        if !ready {
            if req.operation == purcmc_types::Op::StartSession {
                return self.handle_start_session(id, &req).await;
            }
            return Ok(());
        }

        let Some(endpoint) = self.registry.get_mut(id) else {
            return Ok(());
        };
        let Some(name) = endpoint.name.clone() else {
            return Ok(());
        };
        let Some(mut session) = endpoint.session.take() else {
            return Ok(());
        };
        let workspace = self
            .workspaces
            .entry((name.host.clone(), name.app.clone()))
            .or_insert_with(Workspace::new);

        let mut outbound_events = Vec::new();
        let outcome = {
            let mut ctx = DispatchContext {
                endpoint_id: id,
                session: &mut session,
                workspace,
                backend: self.backend.as_mut(),
                render: self.render.as_mut(),
                outbound_events: &mut outbound_events,
            };
            dispatch::dispatch(&mut ctx, &req).await
        };

        if let Some(endpoint) = self.registry.get_mut(id) {
            endpoint.session = Some(session);
        }

        for (target, ev) in outbound_events {
            let _ = self.send_event(target, &ev).await;
        }

        match outcome {
            Ok(Outcome::Respond(resp)) => {
                if !req.request_id.is_void() {
                    self.send_response(id, &resp).await;
                }
            }
            Ok(Outcome::Deferred) | Ok(Outcome::NoReply) => {}
            Err(e) => {
                if !req.request_id.is_void() {
                    let resp = ResponseMessage {
                        request_id: req.request_id.clone(),
                        ret_code: e.ret_code(),
                        result_value: HandleId::ZERO,
                        data_type: DataType::Void,
                        payload: Payload::Void,
                    };
                    self.send_response(id, &resp).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_start_session(&mut self, id: EndpointId, req: &purcmc_types::RequestMessage) -> Result<()> {
        let parsed: Option<StartSessionRequest> = req
            .payload
            .as_json()
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let outcome = match parsed {
            None => Err(crate::error::ServerError::Protocol(RetCode::BadRequest)),
            Some(start) => handshake::validate(&start).and_then(|name| {
                if self.registry.find_by_name(&name).is_some() {
                    Err(crate::error::ServerError::Protocol(RetCode::Conflict))
                } else {
                    Ok(name)
                }
            }),
        };

        match outcome {
            Ok(name) => {
                self.registry.promote(id, name.clone())?;
                let handle = match self.registry.get_mut(id) {
                    Some(endpoint) => handshake::accept_endpoint(endpoint, name),
                    None => return Ok(()),
                };
                let resp = ResponseMessage {
                    request_id: req.request_id.clone(),
                    ret_code: RetCode::Ok,
                    result_value: handle,
                    data_type: DataType::Void,
                    payload: Payload::Void,
                };
                self.send_response(id, &resp).await;
            }
            Err(e) => {
                let resp = ResponseMessage {
                    request_id: req.request_id.clone(),
                    ret_code: e.ret_code(),
                    result_value: HandleId::ZERO,
                    data_type: DataType::Void,
                    payload: Payload::Void,
                };
                self.send_response(id, &resp).await;
            }
        }
        Ok(())
    }

    async fn send_response(&mut self, id: EndpointId, resp: &ResponseMessage) {
        let body = message::serialize_response(resp, message::DEFAULT_PACKET_BUFFER);
        let Some(state) = self.clients.get_mut(&id) else {
            return;
        };
        let frame = match &state.io {
            ClientIo::Unix { .. } => unix_frame::encode_message(&body, true, DEFAULT_MAX_FRAME_SIZE),
            ClientIo::Ws { .. } => ws_frame::encode_message(&body, true),
        };
        state.outbox.push(frame);
        let _ = state.outbox.flush(&mut state.io).await;
    }

    /// Routes one message off the DOM-pipeline reply channel: a correlated
    /// `page-ready` reply resolves its pending response, an unsolicited
    /// event is proxied to whichever session owns the view (spec §4.H steps
    /// 4-5, last paragraph).
    async fn on_render_reply(&mut self, reply: dom::RenderReply) -> Result<()> {
        match reply {
            dom::RenderReply::Response(page_ready) => self.resolve_pending_response(page_ready).await,
            dom::RenderReply::Event { source_uri, view, event } => {
                self.deliver_dom_event(source_uri, view, event).await
            }
        }
    }

    async fn resolve_pending_response(&mut self, reply: dom::PageReadyReply) -> Result<()> {
        let Some(id) = self.registry.find_pending(&reply.request_id) else {
            return Ok(());
        };
        let pending = {
            let Some(endpoint) = self.registry.get_mut(id) else {
                return Ok(());
            };
            let Some(session) = endpoint.session.as_mut() else {
                return Ok(());
            };
            let Some(pending) = session.take_pending(&reply.request_id) else {
                return Ok(());
            };
            pending
        };

        let resolved = dom::resolve_reply(&reply);
        let (data_type, payload) = match pending.plaintext {
            Some(text) => (DataType::Plain, Payload::Plain(text)),
            None if !resolved.data.is_null() => (DataType::Json, Payload::Json(resolved.data)),
            None => (DataType::Void, Payload::Void),
        };
        let resp = ResponseMessage {
            request_id: RequestId::from(reply.request_id.as_str()),
            ret_code: resolved.ret_code,
            result_value: pending.result_value,
            data_type,
            payload,
        };
        self.send_response(id, &resp).await;
        Ok(())
    }

    async fn deliver_dom_event(&mut self, source_uri: String, view: HandleId, event: dom::SubprocessEvent) -> Result<()> {
        let Some(id) = self.registry.find_session_with_handle(view) else {
            return Ok(());
        };
        let ev = events::dom_event(source_uri, view, &event);
        let _ = self.send_event(id, &ev).await;
        Ok(())
    }

    /// Promotes a host-toolkit focus change to `pageActivated`/
    /// `pageDeactivated`, delivered to whichever session currently owns the
    /// top of the container's owner stack (spec §4.I).
    async fn on_focus_change(&mut self, change: FocusChange) {
        let top = self
            .workspaces
            .values()
            .find_map(|w| w.page_owners.get(&change.container).and_then(|s| s.top()));
        let Some(owner) = top else {
            return;
        };
        let ev = events::page_activated_event(change.container, change.activated);
        let _ = self.send_event(owner.session, &ev).await;
    }

    async fn send_event(&mut self, id: EndpointId, ev: &EventMessage) -> Result<()> {
        let body = message::serialize_event(ev, message::DEFAULT_PACKET_BUFFER)?;
        let Some(state) = self.clients.get_mut(&id) else {
            return Ok(());
        };
        let frame = match &state.io {
            ClientIo::Unix { .. } => unix_frame::encode_message(&body, true, DEFAULT_MAX_FRAME_SIZE),
            ClientIo::Ws { .. } => ws_frame::encode_message(&body, true),
        };
        state.outbox.push(frame);
        let _ = state.outbox.flush(&mut state.io).await;
        Ok(())
    }

    async fn close_client(&mut self, id: EndpointId) {
        if let Some(endpoint) = self.registry.remove(id) {
            if let (Some(name), Some(_session)) = (endpoint.name, endpoint.session) {
                let reloads = match self.workspaces.get_mut(&(name.host, name.app)) {
                    Some(workspace) => workspace.revoke_all(id),
                    None => Vec::new(),
                };
                for (container, new_top) in reloads {
                    let ev = events::page_owner_event("reloadPage", container);
                    let _ = self.send_event(new_top.session, &ev).await;
                }
            }
        }
        self.clients.remove(&id);
    }

    async fn run_idle_sweep(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_dangling_sweep) >= self.timeouts.dangling_sweep {
            self.last_dangling_sweep = now;
            let expired = self.registry.expired_dangling(now, self.timeouts.max_no_responding);
            for id in expired {
                self.close_client(id).await;
            }
        }
        if now.duration_since(self.last_activity_sweep) >= self.timeouts.activity_sweep {
            self.last_activity_sweep = now;
            let (to_close, to_ping) =
                self.registry
                    .stale_ready(now, self.timeouts.max_ping_time, self.timeouts.max_no_responding);
            for id in to_close {
                self.close_client(id).await;
            }
            for id in to_ping {
                self.send_ping(id).await;
            }
        }
        Ok(())
    }

    async fn send_ping(&mut self, id: EndpointId) {
        let Some(state) = self.clients.get_mut(&id) else {
            return;
        };
        let frame = match &state.io {
            ClientIo::Unix { .. } => unix_frame::encode_control(UnixOp::Ping).to_vec(),
            ClientIo::Ws { .. } => ws_frame::encode_ping(&[]),
        };
        state.outbox.push(frame);
        let _ = state.outbox.flush(&mut state.io).await;
    }
}

/// Wraps the feature-manifest body in a bodyless-request-id response frame,
/// the shape spec §6 describes for the initial message sent on accept.
fn encode_initial_response(body: &str) -> Vec<u8> {
    let resp = ResponseMessage {
        request_id: RequestId::void(),
        ret_code: RetCode::Ok,
        result_value: HandleId::ZERO,
        data_type: DataType::Plain,
        payload: Payload::Plain(body.to_string()),
    };
    message::serialize_response(&resp, message::DEFAULT_PACKET_BUFFER)
}

/// Waits for the first client with bytes (or EOF/an error) ready, returning
/// its id and whether the connection should be torn down.
async fn select_ready_client(clients: &mut HashMap<EndpointId, ClientState>) -> Option<(EndpointId, bool)> {
    if clients.is_empty() {
        futures::future::pending::<()>().await;
        return None;
    }
    let mut pending = FuturesUnordered::new();
    for (&id, state) in clients.iter_mut() {
        pending.push(async move { (id, state.io.read_some().await) });
    }
    pending.next().await.map(|(id, result)| {
        let closed = matches!(result, Ok(0) | Err(_));
        (id, closed)
    })
}

async fn accept_unix(
    listener: &mut Option<tokio::net::UnixListener>,
) -> std::io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => futures::future::pending().await,
    }
}

async fn accept_tcp(
    listener: &mut Option<tokio::net::TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => futures::future::pending().await,
    }
}
