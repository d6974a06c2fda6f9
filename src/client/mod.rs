//! The USP session context: configuration, connection lifecycle, the audio
//! upstream protocol, and the wiring between transport, telemetry, and user
//! callbacks.

pub mod callbacks;
mod dispatch;

pub use callbacks::{
    RecognitionStatus, SpeechEndDetected, SpeechFragment, SpeechHypothesis, SpeechPhrase,
    SpeechStartDetected, TurnEnd, TurnStart, UspCallbacks, USP_CALLBACK_VERSION,
};
pub use dispatch::{
    PATH_SPEECH_END_DETECTED, PATH_SPEECH_FRAGMENT, PATH_SPEECH_HYPOTHESIS, PATH_SPEECH_PHRASE,
    PATH_SPEECH_START_DETECTED, PATH_TURN_END, PATH_TURN_START,
};

use crate::dns_cache::DnsCache;
use crate::error::{Result, UspError};
use crate::telemetry::{current_tick, TelemetryEvent, TelemetryRecorder};
use crate::transport::{Transport, TransportError};
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use url::Url;
use usp_protocol::Header;

const HEADER_USER_AGENT: &str = "User-Agent";
const HEADER_SUBSCRIPTION_KEY: &str = "Ocp-Apim-Subscription-Key";
const HEADER_AUTHORIZATION: &str = "Authorization";
const HEADER_RPS_TOKEN: &str = "X-Search-DelegationRPSToken";
const HEADER_AUDIO_RESPONSE_FORMAT: &str = "X-Output-AudioCodec";

const AUDIO_RESPONSE_CODEC: &str = "riff-16khz-16bit-mono-pcm";
const USER_AGENT: &str = concat!("usp-client/", env!("CARGO_PKG_VERSION"));
const AUDIO_STREAM_PATH: &str = "/audio";

/// Endpoint flavor. CDSDK endpoints additionally require the audio-codec
/// and user-agent headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Default,
    CdSdk,
}

impl FromStr for EndpointKind {
    type Err = UspError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(EndpointKind::Default),
            "cdsdk" => Ok(EndpointKind::CdSdk),
            other => Err(UspError::InvalidEnumValue(format!(
                "unknown endpoint kind '{}'",
                other
            ))),
        }
    }
}

/// Result detail level requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Simple,
    Detailed,
}

impl OutputFormat {
    fn as_query_value(&self) -> &'static str {
        match self {
            OutputFormat::Simple => "simple",
            OutputFormat::Detailed => "detailed",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = UspError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(OutputFormat::Simple),
            "detailed" => Ok(OutputFormat::Detailed),
            other => Err(UspError::InvalidEnumValue(format!(
                "unknown output format '{}'",
                other
            ))),
        }
    }
}

/// Credential presented when the session is established.
pub enum Authentication {
    SubscriptionKey(SecretString),
    AuthorizationToken(SecretString),
    SearchDelegationRpsToken(SecretString),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

/// Caller-supplied handler for inbound frames whose path is not in the
/// system dispatch table: `(path, content_type, body)`.
pub type UserHandler = dyn Fn(&str, Option<&str>, &[u8]) + Send + Sync;

pub(crate) struct ClientState {
    pub(crate) connection: ConnectionState,
    pub(crate) audio_offset: u64,
    endpoint: Option<(Url, EndpointKind)>,
    auth: Option<Authentication>,
    language: Option<String>,
    output_format: Option<OutputFormat>,
    model_id: Option<String>,
    pub(crate) transport: Option<Arc<Transport>>,
    pub(crate) user_handlers: Vec<(String, Arc<UserHandler>)>,
    dispatch_busy: bool,
}

pub(crate) struct ClientInner {
    pub(crate) state: Mutex<ClientState>,
    dispatch_idle: Condvar,
    pub(crate) telemetry: Arc<TelemetryRecorder>,
    dns: Arc<DnsCache>,
    pub(crate) callbacks: Mutex<Option<Arc<UspCallbacks>>>,
    creation_tick: u64,
}

impl ClientInner {
    fn lifetime_tick(&self) -> u64 {
        current_tick().saturating_sub(self.creation_tick)
    }

    /// Marks the dispatch worker busy so shutdown can wait for the
    /// in-flight callback to return.
    fn begin_dispatch(&self) {
        let mut state = self.state.lock().unwrap();
        state.dispatch_busy = true;
    }

    fn end_dispatch(&self) {
        let mut state = self.state.lock().unwrap();
        state.dispatch_busy = false;
        self.dispatch_idle.notify_all();
    }

    /// Transport-observed failure: record the error state and notify the
    /// caller. The connection is not closed here; that stays the caller's
    /// decision.
    fn on_transport_error(&self, reason: TransportError) {
        info!(
            "TS:{}, transport error: {:?}",
            self.lifetime_tick(),
            reason
        );
        {
            let mut state = self.state.lock().unwrap();
            state.connection = ConnectionState::Error;
        }

        let error = map_transport_error(reason);
        let callbacks = self.callbacks.lock().unwrap().clone();
        match callbacks.as_ref().and_then(|cb| cb.on_error.as_ref()) {
            Some(handler) => handler(&error),
            None => info!("No callback is defined for onError."),
        }
    }
}

pub(crate) fn map_transport_error(reason: TransportError) -> UspError {
    match reason {
        TransportError::None => {
            UspError::TransportGeneric("Unknown transport error.".to_string())
        }
        TransportError::Authentication => UspError::AuthError,
        TransportError::ConnectionFailure => UspError::ConnectionFailure(
            "Connection failed (no connection to the remote host).".to_string(),
        ),
        TransportError::DnsFailure => UspError::ConnectionFailure(
            "Connection failed (the remote host did not respond).".to_string(),
        ),
        TransportError::RemoteClosed => UspError::RemoteClosed,
    }
}

/// A USP session: one duplex connection to the speech service, one turn in
/// flight at a time.
///
/// Configure the endpoint and credentials while idle, install callbacks,
/// `connect`, then stream audio and exchange path-tagged messages until
/// `shutdown`.
pub struct UspClient {
    inner: Arc<ClientInner>,
}

impl Default for UspClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UspClient {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            // The telemetry sink forwards flushed blocks to the transport
            // through a non-owning back-reference.
            let sink_ref = weak.clone();
            let telemetry = Arc::new(TelemetryRecorder::new(Box::new(
                move |payload: &[u8], request_id: &str| {
                    let Some(inner) = sink_ref.upgrade() else {
                        return;
                    };
                    let transport = inner.state.lock().unwrap().transport.clone();
                    if let Some(transport) = transport {
                        if let Err(e) = transport.write_telemetry(payload, request_id) {
                            warn!("Failed to send telemetry for {}: {}", request_id, e);
                        }
                    }
                },
            )));

            ClientInner {
                state: Mutex::new(ClientState {
                    connection: ConnectionState::Idle,
                    audio_offset: 0,
                    endpoint: None,
                    auth: None,
                    language: None,
                    output_format: None,
                    model_id: None,
                    transport: None,
                    user_handlers: Vec::new(),
                    dispatch_busy: false,
                }),
                dispatch_idle: Condvar::new(),
                telemetry,
                dns: Arc::new(DnsCache::new()),
                callbacks: Mutex::new(None),
                creation_tick: current_tick(),
            }
        });

        Self { inner }
    }

    fn configure<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClientState),
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.connection != ConnectionState::Idle {
            return Err(UspError::WrongState(state.connection));
        }
        f(&mut state);
        Ok(())
    }

    /// Sets the service endpoint. The URL must name a host and an explicit
    /// port.
    pub fn set_endpoint(&self, url: &str, kind: EndpointKind) -> Result<()> {
        let parsed = Url::parse(url)
            .map_err(|e| UspError::InvalidArgument(format!("invalid endpoint url: {}", e)))?;
        if parsed.host_str().is_none() {
            return Err(UspError::InvalidArgument(
                "endpoint url must name a host".to_string(),
            ));
        }
        if parsed.port().is_none() {
            return Err(UspError::InvalidArgument(
                "endpoint url must carry an explicit port".to_string(),
            ));
        }
        self.configure(|state| state.endpoint = Some((parsed, kind)))
    }

    pub fn set_auth(&self, auth: Authentication) -> Result<()> {
        self.configure(|state| state.auth = Some(auth))
    }

    pub fn set_language(&self, language: &str) -> Result<()> {
        let language = language.to_string();
        self.configure(|state| state.language = Some(language))
    }

    pub fn set_output_format(&self, format: OutputFormat) -> Result<()> {
        self.configure(|state| state.output_format = Some(format))
    }

    pub fn set_model_id(&self, model_id: &str) -> Result<()> {
        let model_id = model_id.to_string();
        self.configure(|state| state.model_id = Some(model_id))
    }

    /// Installs the callback table after validating its compatibility
    /// envelope.
    pub fn set_callbacks(&self, callbacks: UspCallbacks) -> Result<()> {
        callbacks.validate()?;
        let mut slot = self.inner.callbacks.lock().unwrap();
        *slot = Some(Arc::new(callbacks));
        Ok(())
    }

    /// Registers a handler for an inbound path outside the system dispatch
    /// table. Re-registering a path replaces the previous handler in place.
    pub fn register_user_path_handler(
        &self,
        path: &str,
        handler: Box<UserHandler>,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(UspError::InvalidArgument("path is empty".to_string()));
        }
        let handler: Arc<UserHandler> = Arc::from(handler);
        let mut state = self.inner.state.lock().unwrap();
        match state.user_handlers.iter_mut().find(|(p, _)| p.as_str() == path) {
            Some((_, slot)) => *slot = handler,
            None => state.user_handlers.push((path.to_string(), handler)),
        }
        Ok(())
    }

    /// Establishes the session: builds the connection header table from the
    /// configured endpoint kind and credentials, decorates the endpoint URL
    /// with the recognition parameters, and opens the transport.
    pub fn connect(&self) -> Result<()> {
        let transport = {
            let mut state = self.inner.state.lock().unwrap();
            match state.connection {
                ConnectionState::Idle => {}
                ConnectionState::Connecting | ConnectionState::Connected => {
                    return Err(UspError::AlreadyInitialized);
                }
                other => return Err(UspError::WrongState(other)),
            }

            let (url, kind) = state.endpoint.clone().ok_or_else(|| {
                UspError::InitializationFailure("endpoint is not configured".to_string())
            })?;
            let auth = state.auth.as_ref().ok_or_else(|| {
                UspError::InitializationFailure(
                    "authentication must be configured before connecting".to_string(),
                )
            })?;

            let mut headers: Vec<Header> = Vec::new();
            if kind == EndpointKind::CdSdk {
                headers.push((
                    HEADER_AUDIO_RESPONSE_FORMAT.to_string(),
                    AUDIO_RESPONSE_CODEC.to_string(),
                ));
                headers.push((HEADER_USER_AGENT.to_string(), USER_AGENT.to_string()));
            }
            match auth {
                Authentication::SubscriptionKey(key) => headers.push((
                    HEADER_SUBSCRIPTION_KEY.to_string(),
                    key.expose_secret().to_string(),
                )),
                Authentication::AuthorizationToken(token) => headers.push((
                    HEADER_AUTHORIZATION.to_string(),
                    format!("Bearer {}", token.expose_secret()),
                )),
                Authentication::SearchDelegationRpsToken(token) => headers.push((
                    HEADER_RPS_TOKEN.to_string(),
                    token.expose_secret().to_string(),
                )),
            }

            let mut url = url;
            {
                let mut query = url.query_pairs_mut();
                if let Some(language) = &state.language {
                    query.append_pair("language", language);
                }
                if let Some(format) = &state.output_format {
                    query.append_pair("format", format.as_query_value());
                }
                if let Some(model_id) = &state.model_id {
                    query.append_pair("modelId", model_id);
                }
            }

            let transport = Arc::new(Transport::create(
                url,
                headers,
                self.inner.dns.clone(),
                self.inner.telemetry.clone(),
            ));

            let error_ref = Arc::downgrade(&self.inner);
            let recv_ref = Arc::downgrade(&self.inner);
            transport.set_callbacks(
                Box::new(move |reason| {
                    if let Some(inner) = error_ref.upgrade() {
                        inner.on_transport_error(reason);
                    }
                }),
                Box::new(move |headers, body| {
                    if let Some(inner) = recv_ref.upgrade() {
                        dispatch::dispatch_event(&inner, headers, body);
                    }
                }),
            );

            state.connection = ConnectionState::Connecting;
            state.transport = Some(transport.clone());
            transport
        };

        // The open handshake runs without the context lock so the error
        // callback can take it.
        match transport.open() {
            Ok(()) => {
                let mut state = self.inner.state.lock().unwrap();
                state.connection = ConnectionState::Connected;
                info!("TS:{}, session connected", self.inner.lifetime_tick());
                Ok(())
            }
            Err(reason) => {
                let mut state = self.inner.state.lock().unwrap();
                state.connection = ConnectionState::Error;
                Err(map_transport_error(reason))
            }
        }
    }

    fn connected_transport(&self) -> Result<Arc<Transport>> {
        let state = self.inner.state.lock().unwrap();
        if state.connection != ConnectionState::Connected {
            return Err(UspError::WrongState(state.connection));
        }
        state.transport.clone().ok_or(UspError::InvalidHandle)
    }

    /// Sends a discrete message tagged with `path` on the current request.
    pub fn message_write(&self, path: &str, body: &[u8]) -> Result<()> {
        if path.is_empty() {
            return Err(UspError::InvalidArgument(
                "the path is null or empty".to_string(),
            ));
        }
        let transport = self.connected_transport()?;
        transport.message_write(path, body)
    }

    /// Streams one chunk of audio on the current turn. The first chunk of a
    /// turn opens the streamed body. Returns the number of bytes accepted.
    pub fn audio_write(&self, data: &[u8]) -> Result<usize> {
        debug!(
            "TS:{}, write {} bytes audio data.",
            self.inner.lifetime_tick(),
            data.len()
        );
        if data.is_empty() {
            return Err(UspError::InvalidArgument(
                "size should not be 0, use audio_flush to flush the stream".to_string(),
            ));
        }

        let (transport, first_chunk) = {
            let state = self.inner.state.lock().unwrap();
            if state.connection != ConnectionState::Connected {
                return Err(UspError::WrongState(state.connection));
            }
            let transport = state.transport.clone().ok_or(UspError::InvalidHandle)?;
            (transport, state.audio_offset == 0)
        };

        let request_id = transport.request_id();
        if first_chunk {
            self.inner
                .telemetry
                .record(&request_id, TelemetryEvent::AudioStreamInit);
            self.inner
                .telemetry
                .record(&request_id, TelemetryEvent::AudioStart);
            transport.stream_prepare(AUDIO_STREAM_PATH)?;
        } else {
            self.inner.telemetry.record(
                &request_id,
                TelemetryEvent::AudioStreamData { bytes: data.len() },
            );
        }

        transport.stream_write(data)?;

        let mut state = self.inner.state.lock().unwrap();
        state.audio_offset += data.len() as u64;
        Ok(data.len())
    }

    /// Ends the audio stream for the current turn. A no-op success when no
    /// turn is in progress, so end-of-stream can be signalled from multiple
    /// code paths.
    pub fn audio_flush(&self) -> Result<()> {
        debug!("TS:{}, flush audio buffer.", self.inner.lifetime_tick());

        let transport = {
            let state = self.inner.state.lock().unwrap();
            if state.audio_offset == 0 {
                return Ok(());
            }
            state.transport.clone().ok_or(UspError::InvalidHandle)?
        };

        let result = transport.stream_flush();

        {
            let mut state = self.inner.state.lock().unwrap();
            state.audio_offset = 0;
        }
        let request_id = transport.request_id();
        self.inner
            .telemetry
            .record(&request_id, TelemetryEvent::AudioStreamFlush);
        self.inner
            .telemetry
            .record(&request_id, TelemetryEvent::AudioEnd);

        result
    }

    /// Closes the transport. Waits for an in-flight callback to return
    /// first; idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let transport = {
            let mut state = self.inner.state.lock().unwrap();
            if state.connection == ConnectionState::Closed {
                return Ok(());
            }
            while state.dispatch_busy {
                state = self.inner.dispatch_idle.wait(state).unwrap();
            }
            state.connection = ConnectionState::Closing;
            state.audio_offset = 0;
            state.transport.take()
        };

        if let Some(transport) = transport {
            transport.destroy();
        }

        let mut state = self.inner.state.lock().unwrap();
        state.connection = ConnectionState::Closed;
        info!("TS:{}, session closed", self.inner.lifetime_tick());
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().unwrap().connection
    }

    /// Frames the service sent that no handler could take, plus dropped
    /// protocol violations.
    pub fn unhandled_response_count(&self) -> u64 {
        self.inner.telemetry.unhandled_response_count()
    }
}

impl Drop for UspClient {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
