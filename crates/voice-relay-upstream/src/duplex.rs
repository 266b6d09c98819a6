//! Persistent WebSocket connector shared by the duplex providers.
//!
//! A [`DuplexProtocol`] describes one endpoint's wire format; the
//! [`DuplexConnector`] owns the socket lifecycle: handshake, setup
//! acknowledgment, the receive loop, and deadline-bounded sends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voice_relay_core::config::UpstreamConfig;
use voice_relay_media::PcmChunk;

use crate::error::{ProtocolError, Result, UpstreamError};
use crate::{
    ConnectorState, InputFormat, StateCell, UpstreamEvent, UpstreamEventHandler, UpstreamLink,
    UpstreamProvider,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Wire format of one duplex endpoint.
pub trait DuplexProtocol: Send + Sync + 'static {
    fn id(&self) -> &'static str;

    /// The WebSocket upgrade request, including URL credentials or headers.
    fn request(&self) -> Result<Request>;

    /// First message sent after the socket opens.
    fn setup_message(&self) -> serde_json::Value;

    /// Wrap one chunk of PCM for sending.
    fn encode_audio(&self, chunk: &PcmChunk) -> serde_json::Value;

    /// Parse one text or binary frame. Setup acknowledgment maps to
    /// [`UpstreamEvent::SetupComplete`].
    fn parse_events(&self, raw: &[u8]) -> std::result::Result<Vec<UpstreamEvent>, ProtocolError>;
}

#[derive(Debug, Clone, Copy)]
pub struct DuplexTimeouts {
    pub handshake: Duration,
    pub send: Duration,
    /// Close the link when nothing arrives for this long.
    pub idle: Option<Duration>,
}

/// `base` with one query parameter appended, percent-encoded.
pub fn url_with_query(base: &str, key: &str, value: &str) -> Result<String> {
    reqwest::Url::parse_with_params(base, &[(key, value)])
        .map(String::from)
        .map_err(|e| UpstreamError::Connect(format!("invalid URL {base}: {e}")))
}

impl DuplexTimeouts {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            handshake: config.handshake_timeout(),
            send: config.send_timeout(),
            idle: config.idle_timeout(),
        }
    }
}

pub struct DuplexConnector<P: DuplexProtocol> {
    protocol: Arc<P>,
    input: InputFormat,
    timeouts: DuplexTimeouts,
}

impl<P: DuplexProtocol> DuplexConnector<P> {
    pub fn new(protocol: P, input: InputFormat, timeouts: DuplexTimeouts) -> Self {
        Self {
            protocol: Arc::new(protocol),
            input,
            timeouts,
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    async fn open(&self) -> Result<(WsSink, WsSource)> {
        let request = self.protocol.request()?;
        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let setup = self.protocol.setup_message().to_string();
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| UpstreamError::Handshake(format!("sending setup: {e}")))?;

        wait_for_setup_ack(self.protocol.as_ref(), &mut source).await?;
        Ok((sink, source))
    }
}

async fn wait_for_setup_ack<P: DuplexProtocol>(protocol: &P, source: &mut WsSource) -> Result<()> {
    loop {
        let msg = match source.next().await {
            None => {
                return Err(UpstreamError::Handshake(
                    "connection closed before setup acknowledgment".into(),
                ));
            }
            Some(Err(e)) => return Err(UpstreamError::Handshake(e.to_string())),
            Some(Ok(msg)) => msg,
        };

        match msg {
            Message::Text(_) | Message::Binary(_) => {
                match protocol.parse_events(&msg.into_data()) {
                    Ok(events) => {
                        for event in events {
                            match event {
                                UpstreamEvent::SetupComplete => return Ok(()),
                                UpstreamEvent::Error(message) => {
                                    return Err(UpstreamError::Handshake(message));
                                }
                                other => debug!(provider = protocol.id(), ?other, "Skipping pre-setup event"),
                            }
                        }
                    }
                    Err(e) => warn!(provider = protocol.id(), error = %e, "Unparseable message during setup"),
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "no reason".into());
                return Err(UpstreamError::Handshake(format!("closed by endpoint: {reason}")));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<P: DuplexProtocol> UpstreamProvider for DuplexConnector<P> {
    fn id(&self) -> &str {
        self.protocol.id()
    }

    fn input_format(&self) -> InputFormat {
        self.input
    }

    fn is_duplex(&self) -> bool {
        true
    }

    async fn connect(
        &self,
        handler: Arc<dyn UpstreamEventHandler>,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn UpstreamLink>> {
        let provider = self.protocol.id();
        info!(provider, "Connecting to upstream");

        let (sink, source) = tokio::select! {
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            opened = tokio::time::timeout(self.timeouts.handshake, self.open()) => {
                opened.map_err(|_| UpstreamError::Timeout("upstream handshake"))??
            }
        };

        let link = Arc::new(DuplexLink {
            protocol: self.protocol.clone(),
            sink: Mutex::new(sink),
            state: StateCell::new(ConnectorState::Ready),
            send_timeout: self.timeouts.send,
            cancel: cancel.clone(),
        });

        tokio::spawn(receive_loop(
            link.clone(),
            source,
            handler,
            cancel,
            self.timeouts.idle,
        ));

        info!(provider, "Upstream ready");
        Ok(link)
    }
}

pub struct DuplexLink<P: DuplexProtocol> {
    protocol: Arc<P>,
    sink: Mutex<WsSink>,
    state: StateCell,
    send_timeout: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl<P: DuplexProtocol> UpstreamLink for DuplexLink<P> {
    fn state(&self) -> ConnectorState {
        self.state.get()
    }

    async fn send_audio(&self, chunk: PcmChunk) -> Result<()> {
        let state = self.state.get();
        if state != ConnectorState::Ready {
            return Err(UpstreamError::NotReady(state));
        }

        let text = self.protocol.encode_audio(&chunk).to_string();
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.send_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {
                debug!(provider = self.protocol.id(), samples = chunk.samples.len(), "Sent audio chunk");
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.set(ConnectorState::Failed);
                Err(UpstreamError::Send(e.to_string()))
            }
            Err(_) => {
                self.state.set(ConnectorState::Failed);
                Err(UpstreamError::Timeout("audio send"))
            }
        }
    }

    async fn close(&self) {
        self.state.set(ConnectorState::Closed);
        self.cancel.cancel();
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(self.send_timeout, sink.close()).await;
    }
}

async fn receive_loop<P: DuplexProtocol>(
    link: Arc<DuplexLink<P>>,
    mut source: WsSource,
    handler: Arc<dyn UpstreamEventHandler>,
    cancel: CancellationToken,
    idle: Option<Duration>,
) {
    let provider = link.protocol.id();
    let mut unparsed: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(provider, "Upstream receive loop cancelled");
                break;
            }
            next = next_message(&mut source, idle) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(provider, "Upstream idle deadline elapsed");
                break;
            }
            Ok(None) => {
                info!(provider, "Upstream connection closed");
                break;
            }
            Ok(Some(Err(e))) => {
                error!(provider, error = %e, "Upstream read failed");
                link.state.set(ConnectorState::Failed);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(_) | Message::Binary(_) => {
                match link.protocol.parse_events(&msg.into_data()) {
                    Ok(events) => {
                        for event in events {
                            handler.on_event(event).await;
                        }
                    }
                    Err(e) => {
                        unparsed += 1;
                        warn!(provider, error = %e, unparsed, "Unparseable upstream message");
                    }
                }
            }
            Message::Close(frame) => {
                info!(provider, ?frame, "Upstream sent close");
                break;
            }
            _ => {}
        }
    }

    link.state.set(ConnectorState::Closed);
}

async fn next_message(
    source: &mut WsSource,
    idle: Option<Duration>,
) -> std::result::Result<
    Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    tokio::time::error::Elapsed,
> {
    match idle {
        Some(deadline) => tokio::time::timeout(deadline, source.next()).await,
        None => Ok(source.next().await),
    }
}
