//! Inbound frame routing: the static system dispatch table, the user path
//! handler registry, and content dispatch into typed callbacks.

use super::{ClientInner, UserHandler};
use crate::client::callbacks::{
    SpeechEndDetected, SpeechFragment, SpeechHypothesis, SpeechPhrase, SpeechStartDetected,
    TurnEnd, TurnStart, UspCallbacks,
};
use crate::error::UspError;
use crate::transport::{CONTENT_TYPE_JSON, HEADER_CONTENT_TYPE, HEADER_PATH};
use log::{info, warn};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use usp_protocol::{find_header, Header};

pub const PATH_SPEECH_HYPOTHESIS: &str = "speech.hypothesis";
pub const PATH_SPEECH_PHRASE: &str = "speech.phrase";
pub const PATH_SPEECH_FRAGMENT: &str = "speech.fragment";
pub const PATH_TURN_START: &str = "turn.start";
pub const PATH_TURN_END: &str = "turn.end";
pub const PATH_SPEECH_START_DETECTED: &str = "speech.startDetected";
pub const PATH_SPEECH_END_DETECTED: &str = "speech.endDetected";

type SystemHandler = fn(&ClientInner, &str, Option<&str>, &[u8]) -> Result<(), UspError>;

/// System paths and their handlers. Checked before the user registry.
const SYSTEM_HANDLERS: &[(&str, SystemHandler)] = &[
    (PATH_TURN_START, handle_content),
    (PATH_SPEECH_START_DETECTED, handle_speech_start),
    (PATH_SPEECH_END_DETECTED, handle_speech_end),
    (PATH_TURN_END, handle_turn_end),
    (PATH_SPEECH_HYPOTHESIS, handle_content),
    (PATH_SPEECH_PHRASE, handle_content),
    (PATH_SPEECH_FRAGMENT, handle_content),
];

/// Entry point for every validated downstream frame. Runs on the transport
/// worker; user callbacks are invoked with the context lock released.
pub(crate) fn dispatch_event(inner: &Arc<ClientInner>, headers: &[Header], body: &[u8]) {
    let Some(path) = find_header(headers, HEADER_PATH) else {
        // The transport guarantees the header; a frame without it never
        // reaches us.
        return;
    };
    let mime = find_header(headers, HEADER_CONTENT_TYPE);

    info!(
        "Response message: path: {}, content type: {:?}, size: {}.",
        path,
        mime,
        body.len()
    );

    inner.begin_dispatch();

    if let Some((_, handler)) = SYSTEM_HANDLERS.iter().find(|(p, _)| *p == path) {
        if let Err(e) = handler(inner, path, mime, body) {
            warn!("Handler for '{}' failed: {}", path, e);
        }
    } else {
        let user_handler: Option<Arc<UserHandler>> = {
            let state = inner.state.lock().unwrap();
            state
                .user_handlers
                .iter()
                .find(|(p, _)| p.as_str() == path)
                .map(|(_, h)| h.clone())
        };

        match user_handler {
            Some(handler) => {
                info!("User message: path: {}, size: {}.", path, body.len());
                handler(path, mime, body);
            }
            None => {
                warn!("Protocol violation: unhandled response '{}'", path);
                inner.telemetry.record_unhandled_response();
            }
        }
    }

    inner.end_dispatch();
}

/// Runs `f` against the installed callback table; `f` reports whether a
/// callback was present for the event.
fn with_callbacks<F>(inner: &ClientInner, name: &str, f: F)
where
    F: FnOnce(&UspCallbacks) -> bool,
{
    let callbacks = inner.callbacks.lock().unwrap().clone();
    match callbacks {
        Some(callbacks) => {
            if !f(&callbacks) {
                info!("No user callback is defined for {}.", name);
            }
        }
        None => info!("No callback table is installed."),
    }
}

fn handle_speech_start(
    inner: &ClientInner,
    _path: &str,
    _mime: Option<&str>,
    _body: &[u8],
) -> Result<(), UspError> {
    with_callbacks(inner, "onSpeechStartDetected", |cb| {
        if let Some(handler) = &cb.on_speech_start_detected {
            handler(SpeechStartDetected);
            true
        } else {
            false
        }
    });
    Ok(())
}

fn handle_speech_end(
    inner: &ClientInner,
    _path: &str,
    _mime: Option<&str>,
    _body: &[u8],
) -> Result<(), UspError> {
    with_callbacks(inner, "onSpeechEndDetected", |cb| {
        if let Some(handler) = &cb.on_speech_end_detected {
            handler(SpeechEndDetected);
            true
        } else {
            false
        }
    });
    Ok(())
}

/// Flushes telemetry for the finished turn, delivers the event, then
/// allocates the next turn's request id.
fn handle_turn_end(
    inner: &ClientInner,
    _path: &str,
    _mime: Option<&str>,
    _body: &[u8],
) -> Result<(), UspError> {
    let transport = inner.state.lock().unwrap().transport.clone();

    if let Some(transport) = &transport {
        inner.telemetry.flush(&transport.request_id());
    }

    with_callbacks(inner, "onTurnEnd", |cb| {
        if let Some(handler) = &cb.on_turn_end {
            handler(TurnEnd);
            true
        } else {
            false
        }
    });

    if let Some(transport) = &transport {
        transport.create_request_id();
    }
    Ok(())
}

/// Handler for the paths whose payload is a typed JSON body.
fn handle_content(
    inner: &ClientInner,
    path: &str,
    mime: Option<&str>,
    body: &[u8],
) -> Result<(), UspError> {
    if body.is_empty() {
        warn!("Protocol violation: response '{}' contains no body", path);
        return Err(UspError::InvalidResponse(format!(
            "'{}' response contains no body",
            path
        )));
    }
    let mime = mime.unwrap_or_default();
    if !mime.starts_with(CONTENT_TYPE_JSON) {
        return Err(UspError::InvalidResponse(format!(
            "unsupported content type '{}' for '{}'",
            mime, path
        )));
    }

    match path {
        PATH_TURN_START => {
            let msg: TurnStart = parse_body(path, body)?;
            with_callbacks(inner, "onTurnStart", |cb| {
                if let Some(handler) = &cb.on_turn_start {
                    handler(msg);
                    true
                } else {
                    false
                }
            });
        }
        PATH_SPEECH_HYPOTHESIS => {
            let msg: SpeechHypothesis = parse_body(path, body)?;
            with_callbacks(inner, "onSpeechHypothesis", |cb| {
                if let Some(handler) = &cb.on_speech_hypothesis {
                    handler(msg);
                    true
                } else {
                    false
                }
            });
        }
        PATH_SPEECH_PHRASE => {
            let msg: SpeechPhrase = parse_body(path, body)?;
            with_callbacks(inner, "onSpeechPhrase", |cb| {
                if let Some(handler) = &cb.on_speech_phrase {
                    handler(msg);
                    true
                } else {
                    false
                }
            });
        }
        PATH_SPEECH_FRAGMENT => {
            let msg: SpeechFragment = parse_body(path, body)?;
            with_callbacks(inner, "onSpeechFragment", |cb| {
                if let Some(handler) = &cb.on_speech_fragment {
                    handler(msg);
                    true
                } else {
                    false
                }
            });
        }
        other => {
            return Err(UspError::InvalidResponse(format!(
                "no content handler for path '{}'",
                other
            )));
        }
    }
    Ok(())
}

fn parse_body<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, UspError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| UspError::InvalidResponse(format!("'{}' body is not valid UTF-8", path)))?;
    serde_json::from_str(text).map_err(|e| {
        UspError::InvalidResponse(format!("malformed '{}' payload: {}", path, e))
    })
}
