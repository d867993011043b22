//! Per-account gateway session: connect, hello, identify/resume, heartbeat,
//! dispatch, reconnect. One spawned task per account; the orchestrator
//! consumes the event stream and drives sends through the command channel.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, Encoding, Inflater};
use crate::model::{GatewayPayload, GuildId};
use crate::rate_limit::RateLimiter;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";
pub const GATEWAY_VERSION: u8 = 9;

// Opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_REQUEST_GUILD_MEMBERS: u8 = 8;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | GUILD_MESSAGE_REACTIONS |
/// MESSAGE_CONTENT.
pub const DEFAULT_INTENTS: u64 = (1 << 0) | (1 << 1) | (1 << 9) | (1 << 10) | (1 << 15);

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Close 4004: the token is no longer valid.
    #[error("gateway rejected credentials")]
    AuthenticationFailed,
    #[error("gateway closed fatally (code {code}): {reason}")]
    FatalClose { code: u16, reason: String },
    #[error("expected READY as the first dispatch, got {0}")]
    UnexpectedFirstDispatch(String),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// One decoded dispatch, ready for the orchestrator.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub name: String,
    pub data: serde_json::Value,
}

#[derive(Debug)]
pub enum GatewayEvent {
    Connecting,
    ConnectionLost {
        was_connected: bool,
        code: Option<u16>,
        reason: String,
    },
    Dispatch {
        dispatch: Dispatch,
        /// False while the server replays missed events after a resume.
        live: bool,
    },
    /// A resume failed; a fresh session replaces it. Any in-flight member
    /// requests on the old session are gone.
    SessionLost,
    Error(GatewayError),
}

#[derive(Debug)]
pub enum GatewayCommand {
    RequestGuildMembers { guild_id: GuildId, nonce: String },
    Destroy,
}

#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayHandle {
    pub fn request_guild_members(&self, guild_id: GuildId, nonce: String) {
        let _ = self
            .commands
            .send(GatewayCommand::RequestGuildMembers { guild_id, nonce });
    }

    /// Idempotent: the session task closes with 1000 and exits; repeated
    /// calls after that are no-ops.
    pub fn destroy(&self) {
        let _ = self.commands.send(GatewayCommand::Destroy);
    }
}

#[derive(Clone)]
pub struct GatewayOptions {
    pub token: String,
    pub intents: u64,
    pub compress: bool,
    /// Start a fresh session instead of destroying the connection when the
    /// server declares the session unresumable.
    pub reidentify: bool,
    pub gateway_url: String,
}

impl GatewayOptions {
    pub fn new(token: &str) -> Self {
        GatewayOptions {
            token: token.to_string(),
            intents: DEFAULT_INTENTS,
            compress: true,
            reidentify: true,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
        }
    }
}

/// Saved resume state, carried across reconnects.
#[derive(Debug, Default, Clone)]
struct SavedSession {
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
}

enum SessionEnd {
    Reconnect { delay: Duration },
    Destroyed,
    Fatal(GatewayError),
}

/// Spawn a gateway connection task. The returned receiver yields lifecycle
/// events and dispatches; the handle sends commands in.
pub fn connect(options: GatewayOptions) -> (GatewayHandle, mpsc::UnboundedReceiver<GatewayEvent>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(options, cmd_rx, event_tx));

    (GatewayHandle { commands: cmd_tx }, event_rx)
}

async fn run(
    options: GatewayOptions,
    mut commands: mpsc::UnboundedReceiver<GatewayCommand>,
    events: mpsc::UnboundedSender<GatewayEvent>,
) {
    let mut saved = SavedSession::default();

    loop {
        let _ = events.send(GatewayEvent::Connecting);
        match run_session(&options, &mut saved, &mut commands, &events).await {
            SessionEnd::Reconnect { delay } => {
                tokio::time::sleep(delay).await;
            }
            SessionEnd::Destroyed => {
                debug!("gateway destroyed");
                return;
            }
            SessionEnd::Fatal(err) => {
                let _ = events.send(GatewayEvent::Error(err));
                return;
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

fn gateway_url(options: &GatewayOptions, saved: &SavedSession) -> String {
    let base = saved
        .resume_url
        .as_deref()
        .unwrap_or(&options.gateway_url)
        .trim_end_matches('/');
    let mut url = format!(
        "{base}/?v={GATEWAY_VERSION}&encoding={}",
        Encoding::Json.query_value()
    );
    if options.compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

async fn run_session(
    options: &GatewayOptions,
    saved: &mut SavedSession,
    commands: &mut mpsc::UnboundedReceiver<GatewayCommand>,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) -> SessionEnd {
    let url = gateway_url(options, saved);
    debug!(%url, "connecting to gateway");

    let ws: WsStream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(error = %e, "gateway connect failed");
            let _ = events.send(GatewayEvent::ConnectionLost {
                was_connected: false,
                code: None,
                reason: e.to_string(),
            });
            return SessionEnd::Reconnect {
                delay: Duration::from_secs(1),
            };
        }
    };

    // Reads and writes interleave freely in the session loop; split the
    // transport so each side borrows independently.
    let (mut sink, mut source) = ws.split();
    let mut inflater = options.compress.then(Inflater::new);
    let send_limiter = RateLimiter::gateway_send();

    // Await HELLO before anything else.
    let hello = loop {
        match next_payload(&mut source, &mut inflater).await {
            Ok(Some(payload)) if payload.op == OP_HELLO => break payload,
            Ok(Some(payload)) => {
                debug!(op = payload.op, "ignoring pre-hello payload");
            }
            Ok(None) => continue,
            Err(end) => return finish(end, false, events),
        }
    };

    let heartbeat_interval = hello
        .d
        .get("heartbeat_interval")
        .and_then(|v| v.as_u64())
        .unwrap_or(41_250);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick is immediate; skip it

    // Identify fresh, or resume with the saved session.
    let mut resuming = saved.session_id.is_some() && saved.sequence.is_some();
    let identify = if resuming {
        resume_payload(options, saved)
    } else {
        identify_payload(options)
    };
    if let Err(end) = send_payload(&mut sink, &send_limiter, &identify).await {
        return finish(end, false, events);
    }

    let mut ready = false;
    let mut acked = true;

    loop {
        tokio::select! {
            incoming = next_payload(&mut source, &mut inflater) => {
                let payload = match incoming {
                    Ok(Some(payload)) => payload,
                    Ok(None) => continue,
                    Err(SessionFail::Decode(e)) => {
                        // A broken frame is recoverable: close cleanly and
                        // resume with the saved sequence.
                        warn!(error = %e, "gateway decode error, resuming");
                        let _ = close_with(&mut sink, CloseCode::Normal, "decode error").await;
                        let _ = events.send(GatewayEvent::ConnectionLost {
                            was_connected: ready,
                            code: None,
                            reason: "decode error".into(),
                        });
                        return SessionEnd::Reconnect { delay: Duration::from_secs(1) };
                    }
                    Err(end) => return finish(end, ready, events),
                };

                if let Some(sequence) = payload.s {
                    saved.sequence = Some(sequence);
                }

                match payload.op {
                    OP_DISPATCH => {
                        let name = payload.t.clone().unwrap_or_default();
                        if !ready && !resuming {
                            if name != "READY" {
                                let _ = close_with(&mut sink, CloseCode::Library(4000), "protocol error").await;
                                return SessionEnd::Fatal(GatewayError::UnexpectedFirstDispatch(name));
                            }
                            saved.session_id = payload.d.get("session_id")
                                .and_then(|v| v.as_str())
                                .map(str::to_string);
                            saved.resume_url = payload.d.get("resume_gateway_url")
                                .and_then(|v| v.as_str())
                                .map(str::to_string);
                            ready = true;
                            info!("gateway session ready");
                        } else if resuming && name == "RESUMED" {
                            resuming = false;
                            ready = true;
                            info!("gateway session resumed");
                        }

                        let _ = events.send(GatewayEvent::Dispatch {
                            dispatch: Dispatch { name, data: payload.d },
                            // Replayed events during a resume are not live.
                            live: !resuming,
                        });
                    }
                    OP_HEARTBEAT => {
                        // Server-requested heartbeat: answer immediately.
                        let beat = heartbeat_payload(saved.sequence);
                        if let Err(end) = send_payload(&mut sink, &send_limiter, &beat).await {
                            return finish(end, ready, events);
                        }
                    }
                    OP_HEARTBEAT_ACK => {
                        acked = true;
                    }
                    OP_RECONNECT => {
                        debug!("server requested reconnect");
                        let _ = close_with(&mut sink, CloseCode::Restart, "reconnect requested").await;
                        let _ = events.send(GatewayEvent::ConnectionLost {
                            was_connected: ready,
                            code: None,
                            reason: "reconnect requested".into(),
                        });
                        return SessionEnd::Reconnect { delay: Duration::from_secs(1) };
                    }
                    OP_INVALID_SESSION => {
                        let resumable = payload.d.as_bool().unwrap_or(false);
                        if resumable {
                            debug!("session invalidated but resumable, re-resuming");
                            resuming = true;
                            ready = false;
                            let resume = resume_payload(options, saved);
                            if let Err(end) = send_payload(&mut sink, &send_limiter, &resume).await {
                                return finish(end, ready, events);
                            }
                        } else {
                            warn!("session invalidated, starting fresh");
                            *saved = SavedSession::default();
                            let _ = events.send(GatewayEvent::SessionLost);
                            if options.reidentify {
                                resuming = false;
                                ready = false;
                                let identify = identify_payload(options);
                                if let Err(end) = send_payload(&mut sink, &send_limiter, &identify).await {
                                    return finish(end, ready, events);
                                }
                            } else {
                                let _ = close_with(&mut sink, CloseCode::Normal, "destroyed").await;
                                return SessionEnd::Destroyed;
                            }
                        }
                    }
                    other => {
                        debug!(op = other, "unhandled gateway opcode");
                    }
                }
            }

            _ = heartbeat.tick() => {
                if !acked {
                    // Zombied connection: tear down and resume.
                    warn!("heartbeat not acknowledged, reconnecting");
                    let _ = close_with(&mut sink, CloseCode::Restart, "heartbeat timeout").await;
                    let _ = events.send(GatewayEvent::ConnectionLost {
                        was_connected: ready,
                        code: None,
                        reason: "heartbeat timeout".into(),
                    });
                    return SessionEnd::Reconnect { delay: Duration::from_secs(1) };
                }
                acked = false;
                let beat = heartbeat_payload(saved.sequence);
                if let Err(end) = send_payload(&mut sink, &send_limiter, &beat).await {
                    return finish(end, ready, events);
                }
            }

            command = commands.recv() => {
                match command {
                    Some(GatewayCommand::RequestGuildMembers { guild_id, nonce }) => {
                        if !ready {
                            // Sending while not ready is a caller bug.
                            let _ = close_with(&mut sink, CloseCode::Library(4000), "send before ready").await;
                            return SessionEnd::Fatal(GatewayError::FatalClose {
                                code: 4000,
                                reason: "send before ready".into(),
                            });
                        }
                        let request = GatewayPayload {
                            op: OP_REQUEST_GUILD_MEMBERS,
                            d: json!({
                                "guild_id": guild_id.to_string(),
                                "query": "",
                                "limit": 0,
                                "nonce": nonce,
                            }),
                            s: None,
                            t: None,
                        };
                        if let Err(end) = send_payload(&mut sink, &send_limiter, &request).await {
                            return finish(end, ready, events);
                        }
                    }
                    Some(GatewayCommand::Destroy) => {
                        let _ = close_with(&mut sink, CloseCode::Normal, "destroyed").await;
                        return SessionEnd::Destroyed;
                    }
                    None => {
                        let _ = close_with(&mut sink, CloseCode::Normal, "handle dropped").await;
                        return SessionEnd::Destroyed;
                    }
                }
            }
        }
    }
}

enum SessionFail {
    Decode(CodecError),
    Closed { code: Option<u16>, reason: String },
    Transport(tokio_tungstenite::tungstenite::Error),
}

/// Read frames until one decodes to a payload. `Ok(None)` means a partial
/// compressed unit or a control frame; call again.
async fn next_payload(
    source: &mut WsSource,
    inflater: &mut Option<Inflater>,
) -> Result<Option<GatewayPayload>, SessionFail> {
    let message = match source.next().await {
        Some(Ok(message)) => message,
        Some(Err(e)) => return Err(SessionFail::Transport(e)),
        None => {
            return Err(SessionFail::Closed {
                code: None,
                reason: "connection dropped".into(),
            });
        }
    };

    match message {
        WsMessage::Text(text) => codec::decode_payload(text.as_bytes())
            .map(Some)
            .map_err(SessionFail::Decode),
        WsMessage::Binary(bytes) => {
            let decompressed = match inflater {
                Some(inflater) => match inflater.push(&bytes) {
                    Ok(Some(out)) => out,
                    Ok(None) => return Ok(None),
                    Err(e) => return Err(SessionFail::Decode(e)),
                },
                None => bytes,
            };
            codec::decode_payload(&decompressed)
                .map(Some)
                .map_err(SessionFail::Decode)
        }
        WsMessage::Close(frame) => {
            let (code, reason) = match frame {
                Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                None => (None, String::new()),
            };
            Err(SessionFail::Closed { code, reason })
        }
        // Ping/pong are handled at the protocol layer.
        _ => Ok(None),
    }
}

async fn send_payload(
    sink: &mut WsSink,
    limiter: &RateLimiter,
    payload: &GatewayPayload,
) -> Result<(), SessionFail> {
    limiter.acquire().await;
    let text = codec::encode_payload(payload).map_err(SessionFail::Decode)?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(SessionFail::Transport)
}

async fn close_with(
    sink: &mut WsSink,
    code: CloseCode,
    reason: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    sink.send(WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    })))
    .await
}

/// Map a session failure to what happens next, emitting `ConnectionLost`.
fn finish(
    fail: SessionFail,
    was_connected: bool,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) -> SessionEnd {
    match fail {
        // Broken frames are recoverable: drop the connection and resume.
        SessionFail::Decode(e) => {
            warn!(error = %e, "gateway decode error, resuming");
            let _ = events.send(GatewayEvent::ConnectionLost {
                was_connected,
                code: None,
                reason: "decode error".into(),
            });
            SessionEnd::Reconnect {
                delay: Duration::from_secs(1),
            }
        }
        SessionFail::Transport(e) => {
            let _ = events.send(GatewayEvent::ConnectionLost {
                was_connected,
                code: None,
                reason: e.to_string(),
            });
            SessionEnd::Reconnect {
                delay: Duration::from_secs(1),
            }
        }
        SessionFail::Closed { code, reason } => {
            let _ = events.send(GatewayEvent::ConnectionLost {
                was_connected,
                code,
                reason: reason.clone(),
            });
            match code {
                // 4004: the credentials themselves are bad.
                Some(4004) => SessionEnd::Fatal(GatewayError::AuthenticationFailed),
                // Pre-4000 codes and the transient 4xxx band resume after a
                // short delay.
                Some(c) if c < 4000 || (4000..4010).contains(&c) => SessionEnd::Reconnect {
                    delay: Duration::from_secs(1),
                },
                Some(c) => SessionEnd::Fatal(GatewayError::FatalClose {
                    code: c,
                    reason,
                }),
                None => SessionEnd::Reconnect {
                    delay: Duration::from_secs(1),
                },
            }
        }
    }
}

fn identify_payload(options: &GatewayOptions) -> GatewayPayload {
    GatewayPayload {
        op: OP_IDENTIFY,
        d: json!({
            "token": options.token,
            "intents": options.intents,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "chat-archiver",
                "device": "chat-archiver",
            },
        }),
        s: None,
        t: None,
    }
}

fn resume_payload(options: &GatewayOptions, saved: &SavedSession) -> GatewayPayload {
    GatewayPayload {
        op: OP_RESUME,
        d: json!({
            "token": options.token,
            "session_id": saved.session_id,
            "seq": saved.sequence,
        }),
        s: None,
        t: None,
    }
}

fn heartbeat_payload(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: OP_HEARTBEAT,
        d: sequence.map(|s| json!(s)).unwrap_or(serde_json::Value::Null),
        s: None,
        t: None,
    }
}
