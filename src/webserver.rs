//! WebSocket transport
//!
//! Serves the same router on a secure listener (rustls, hot-reloadable leaf)
//! and, when enabled or when no certificate could be provisioned, an insecure
//! one. Each text frame is handled on its own task; replies go back through a
//! per-connection channel so a pending consent prompt never stalls the socket.

use anyhow::{anyhow, bail, Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use chrono::Utc;
use openssl::x509::X509;
use rustls::ServerConfig as TlsServerConfig;
use serde_json::Value;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::certificate_manager::CertificateManager;
use crate::configs::ServerConfig;
use crate::connection_registry::{ConnectionId, ConnectionRegistry};
use crate::device_backend::DeviceBackend;
use crate::identity::IdentityCertificate;
use crate::protocol::{
    classify, params_or_empty, plan_call, serialize_response, CallPlan, Frame, Response, CLOSE_INCOMPATIBLE,
    CONNECT_ACTION, GET_VERSION_CALL, PROGRAM_NAME, PROGRAM_VERSION,
};
use crate::request_authorizer::{evaluate, AuthorizationError, RequestAuthorizer, RequestVerdict};

/// Close code sent after a denied setup call
pub const CLOSE_BLOCKED: u16 = 1008;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Something to send back on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16, String),
}

/// Per-process message handling shared by every connection
pub struct Gateway {
    registry: ConnectionRegistry,
    authorizer: RequestAuthorizer,
    backend: Arc<dyn DeviceBackend>,
    trusted_root: Option<X509>,
}

impl Gateway {
    pub fn new(authorizer: RequestAuthorizer, backend: Arc<dyn DeviceBackend>, trusted_root: Option<X509>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            authorizer,
            backend,
            trusted_root,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn authorizer(&self) -> &RequestAuthorizer {
        &self.authorizer
    }

    /// Handle one text frame from connection `id`
    pub async fn handle_text(&self, id: ConnectionId, text: &str) -> Vec<Outbound> {
        let frame = match classify(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Bad JSON from connection {}: {:#}", id, e);
                return reply(Response::error(None, format!("{:#}", e)));
            }
        };

        match frame {
            Frame::Empty => reply(Response::error(None, "Message is empty")),
            Frame::Probe => {
                warn!("Second instance of {} likely detected, asking it to close", PROGRAM_NAME);
                vec![Outbound::Text(PROGRAM_NAME.to_string())]
            }
            Frame::KeepAlive => Vec::new(),
            Frame::Setup(message) => {
                let uid = message.uid().map(str::to_string);
                let pem = message.certificate.as_deref().unwrap_or_default();
                self.handle_setup(id, uid.as_deref(), pem).await
            }
            Frame::Call(message) => {
                let Some(identity) = self.registry.identity(id) else {
                    debug!("Dropping message for closed connection {}", id);
                    return Vec::new();
                };
                let uid = message.uid();
                let params = params_or_empty(&message);
                let verdict = evaluate(&identity, &message.signed_request(), Utc::now().timestamp_millis());

                match plan_call(&message, &params) {
                    CallPlan::Incompatible => vec![Outbound::Close(
                        CLOSE_INCOMPATIBLE,
                        format!("Connected to incompatible {} version", PROGRAM_NAME),
                    )],
                    CallPlan::Rejected(reason) => reply(Response::error(uid, reason)),
                    CallPlan::Ready { method, action } => {
                        if let Some(action) = action {
                            if let Err(reason) = self.consent(id, &identity, verdict, &action).await {
                                return reply(Response::error(uid, reason));
                            }
                        }
                        reply(self.run_call(id, uid, method.call, params).await)
                    }
                }
            }
        }
    }

    /// Establish the caller identity; a denial closes the connection
    async fn handle_setup(&self, id: ConnectionId, uid: Option<&str>, pem: &str) -> Vec<Outbound> {
        let mut identity = self.registry.identity(id).unwrap_or_else(IdentityCertificate::unknown);
        match IdentityCertificate::from_pem(pem, self.trusted_root.as_deref()) {
            Ok(presented) => {
                debug!("Received new certificate from connection {}", id);
                identity = presented;
                self.registry.set_identity(id, identity.clone());
            }
            Err(e) => warn!("Ignoring unreadable certificate from connection {}: {:#}", id, e),
        }

        let verdict = if identity.is_trusted() {
            RequestVerdict::Trusted
        } else {
            RequestVerdict::Unsigned
        };
        match self.consent(id, &identity, verdict, CONNECT_ACTION).await {
            Ok(()) => reply(Response::result(uid, None)),
            Err(_) => {
                let mut out = reply(Response::error(uid, "Connection blocked by client"));
                out.push(Outbound::Close(CLOSE_BLOCKED, "Connection blocked by client".to_string()));
                out
            }
        }
    }

    /// `Err` carries the message sent back to the caller
    async fn consent(
        &self,
        id: ConnectionId,
        identity: &IdentityCertificate,
        verdict: RequestVerdict,
        action: &str,
    ) -> Result<(), String> {
        let connected = || self.registry.get(id).is_some();
        match self.authorizer.authorize_while(identity, verdict, action, connected).await {
            Ok(outcome) if outcome.is_allowed() => Ok(()),
            Ok(_) => Err("Request blocked".to_string()),
            Err(e @ (AuthorizationError::PromptTimedOut(_) | AuthorizationError::Abandoned)) => Err(e.to_string()),
            Err(e) => {
                error!("Authorization failed: {}", e);
                Err(e.to_string())
            }
        }
    }

    async fn run_call(&self, id: ConnectionId, uid: Option<&str>, call: &'static str, params: Value) -> Response {
        if call == GET_VERSION_CALL {
            return Response::result(uid, Some(Value::String(PROGRAM_VERSION.to_string())));
        }
        let Some(connection) = self.registry.get(id) else {
            return Response::error(uid, "Connection closed");
        };
        let backend = Arc::clone(&self.backend);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut state = connection.lock().unwrap_or_else(|e| e.into_inner());
            backend.call(call, &params, &mut state)
        })
        .await;

        match outcome {
            Ok(Ok(result)) => Response::result(uid, result),
            Ok(Err(e)) => {
                warn!("{} failed for connection {}: {:#}", call, id, e);
                Response::error(uid, format!("{:#}", e))
            }
            Err(e) => Response::error(uid, format!("{} was interrupted: {}", call, e)),
        }
    }
}

fn reply(response: Response) -> Vec<Outbound> {
    match serialize_response(&response) {
        Ok(text) => vec![Outbound::Text(text)],
        Err(e) => {
            error!("Send failed: {:#}", e);
            Vec::new()
        }
    }
}

// ================= axum plumbing =================

pub fn build_app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(gateway)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let id = gateway.registry.register();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut frames = JoinSet::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let gateway = Arc::clone(&gateway);
                    let tx = tx.clone();
                    let text = text.as_str().to_string();
                    frames.spawn(async move {
                        for outbound in gateway.handle_text(id, &text).await {
                            if tx.send(outbound).is_err() {
                                break;
                            }
                        }
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Connection {} errored: {}", id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(outbound) = rx.recv() => match outbound {
                Outbound::Text(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break;
                }
            },
            Some(_) = frames.join_next(), if !frames.is_empty() => {}
        }
    }

    // Unregister first so a request already holding the prompt permit sees the close
    gateway.registry.disconnect(id);
    if !frames.is_empty() {
        debug!("Cancelling {} pending request(s) for connection {}", frames.len(), id);
    }
    frames.shutdown().await;
}

// ================= Listeners =================

/// Listeners bound from one configured port pair
#[derive(Debug)]
pub struct BoundListeners {
    pub secure: Option<TcpListener>,
    pub insecure: Option<TcpListener>,
}

/// Bind the first port pair where every wanted listener is free
pub fn bind_listeners(config: &ServerConfig, want_secure: bool, want_insecure: bool) -> Result<BoundListeners> {
    if !want_secure && !want_insecure {
        bail!("No listener requested");
    }
    let pairs = config.secure_ports.len().max(config.insecure_ports.len());
    for idx in 0..pairs {
        let secure = match (want_secure, config.secure_ports.get(idx)) {
            (true, Some(port)) => match bind(&config.host, *port) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            },
            (true, None) => continue,
            (false, _) => None,
        };
        let insecure = match (want_insecure, config.insecure_ports.get(idx)) {
            (true, Some(port)) => match bind(&config.host, *port) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("{:#}", e);
                    continue;
                }
            },
            (true, None) => continue,
            (false, _) => None,
        };
        return Ok(BoundListeners { secure, insecure });
    }
    Err(anyhow!(
        "No free port pair among secure {:?} / insecure {:?}",
        config.secure_ports,
        config.insecure_ports
    ))
}

fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener =
        TcpListener::bind((host, port)).context(format!("Failed to bind {}:{}", host, port))?;
    listener
        .set_nonblocking(true)
        .context(format!("Failed to configure {}:{}", host, port))?;
    Ok(listener)
}

/// Serve until ctrl-c
///
/// Without a TLS config only the insecure listener runs.
pub async fn serve(gateway: Arc<Gateway>, config: &ServerConfig, tls: Option<Arc<TlsServerConfig>>) -> Result<()> {
    let want_insecure = config.enable_insecure || tls.is_none();
    if tls.is_none() {
        warn!("Running without a secure listener; pages served over HTTPS cannot connect");
    }
    let listeners = bind_listeners(config, tls.is_some(), want_insecure)?;
    let app = build_app(gateway);
    let handle = Handle::new();
    let mut servers = Vec::new();

    if let (Some(listener), Some(tls)) = (listeners.secure, tls) {
        let addr = local_addr(&listener)?;
        info!("Secure listener on wss://{}", addr);
        let server = axum_server::from_tcp_rustls(listener, RustlsConfig::from_config(tls))
            .handle(handle.clone())
            .serve(app.clone().into_make_service());
        servers.push(tokio::spawn(server));
    }
    if let Some(listener) = listeners.insecure {
        let addr = local_addr(&listener)?;
        info!("Insecure listener on ws://{}", addr);
        let server = axum_server::from_tcp(listener)
            .handle(handle.clone())
            .serve(app.into_make_service());
        servers.push(tokio::spawn(server));
    }

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    for server in servers {
        server
            .await
            .context("Listener task panicked")?
            .context("Listener failed")?;
    }
    Ok(())
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener.local_addr().context("Failed to read listener address")
}

// ================= Certificate renewal =================

/// Renew the transport certificate when it expires within `within_days`
pub fn renew_if_due(manager: &mut CertificateManager, host_names: &[String], within_days: i32) -> Result<bool> {
    let remaining = manager.leaf_days_remaining()?;
    if remaining > within_days {
        debug!("Transport certificate valid for {} more days", remaining);
        return Ok(false);
    }
    info!("Transport certificate expires in {} days, renewing", remaining);
    manager.renew(host_names)?;
    Ok(true)
}

pub fn spawn_renewal_watcher(
    manager: Arc<Mutex<CertificateManager>>,
    host_names: Vec<String>,
    within_days: i32,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let manager = Arc::clone(&manager);
            let hosts = host_names.clone();
            let checked = tokio::task::spawn_blocking(move || {
                let mut manager = manager.lock().unwrap_or_else(|e| e.into_inner());
                renew_if_due(&mut manager, &hosts, within_days)
            })
            .await;
            match checked {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Transport certificate renewal failed: {:#}", e),
                Err(e) => error!("Renewal check panicked: {}", e),
            }
        }
    })
}
