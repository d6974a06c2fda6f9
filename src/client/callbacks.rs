//! Typed recognition events and the user callback table.
//!
//! The callback table keeps the version+size compatibility envelope of the
//! wire-level API: `set_callbacks` validates both fields and rejects tables
//! built for another revision instead of silently degrading.

use crate::error::UspError;
use serde::Deserialize;

pub const USP_CALLBACK_VERSION: u16 = 1;

/// Recognition outcome reported in a `speech.phrase` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RecognitionStatus {
    Success,
    NoMatch,
    InitialSilenceTimeout,
    BabbleTimeout,
    Error,
    EndOfDictation,
}

/// Partial recognition result, streamed while the user is still speaking.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechHypothesis {
    pub text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
}

/// Stable fragment of a dictation result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechFragment {
    pub text: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
}

/// Final recognition result for an utterance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechPhrase {
    pub recognition_status: RecognitionStatus,
    #[serde(default)]
    pub display_text: Option<String>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnStartContext {
    #[serde(rename = "serviceTag", default)]
    pub service_tag: Option<String>,
}

/// Opens a turn; carries the service-side correlation context.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnStart {
    #[serde(default)]
    pub context: TurnStartContext,
}

/// Marker events with no payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechStartDetected;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechEndDetected;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnEnd;

pub type OnError = Box<dyn Fn(&UspError) + Send + Sync>;
pub type OnSpeechStartDetected = Box<dyn Fn(SpeechStartDetected) + Send + Sync>;
pub type OnSpeechEndDetected = Box<dyn Fn(SpeechEndDetected) + Send + Sync>;
pub type OnSpeechHypothesis = Box<dyn Fn(SpeechHypothesis) + Send + Sync>;
pub type OnSpeechPhrase = Box<dyn Fn(SpeechPhrase) + Send + Sync>;
pub type OnSpeechFragment = Box<dyn Fn(SpeechFragment) + Send + Sync>;
pub type OnTurnStart = Box<dyn Fn(TurnStart) + Send + Sync>;
pub type OnTurnEnd = Box<dyn Fn(TurnEnd) + Send + Sync>;

/// User callback table. Build with [`UspCallbacks::new`] and fill in the
/// callbacks you care about; a missing callback is never an error.
pub struct UspCallbacks {
    pub version: u16,
    pub size: usize,
    pub on_error: Option<OnError>,
    pub on_speech_start_detected: Option<OnSpeechStartDetected>,
    pub on_speech_end_detected: Option<OnSpeechEndDetected>,
    pub on_speech_hypothesis: Option<OnSpeechHypothesis>,
    pub on_speech_phrase: Option<OnSpeechPhrase>,
    pub on_speech_fragment: Option<OnSpeechFragment>,
    pub on_turn_start: Option<OnTurnStart>,
    pub on_turn_end: Option<OnTurnEnd>,
}

impl UspCallbacks {
    pub fn new() -> Self {
        Self {
            version: USP_CALLBACK_VERSION,
            size: std::mem::size_of::<UspCallbacks>(),
            on_error: None,
            on_speech_start_detected: None,
            on_speech_end_detected: None,
            on_speech_hypothesis: None,
            on_speech_phrase: None,
            on_speech_fragment: None,
            on_turn_start: None,
            on_turn_end: None,
        }
    }

    /// Checks the compatibility envelope.
    pub(crate) fn validate(&self) -> Result<(), UspError> {
        if self.version != USP_CALLBACK_VERSION {
            return Err(UspError::InvalidArgument(format!(
                "callback table version {} is not supported (expected {})",
                self.version, USP_CALLBACK_VERSION
            )));
        }
        let expected = std::mem::size_of::<UspCallbacks>();
        if self.size != expected {
            return Err(UspError::InvalidArgument(format!(
                "callback table size {} does not match expected {}",
                self.size, expected
            )));
        }
        Ok(())
    }
}

impl Default for UspCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_validates() {
        assert!(UspCallbacks::new().validate().is_ok());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut table = UspCallbacks::new();
        table.version = 2;
        assert!(matches!(
            table.validate(),
            Err(UspError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut table = UspCallbacks::new();
        table.size = 12;
        assert!(matches!(
            table.validate(),
            Err(UspError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_phrase_payload_parses() {
        let body = r#"{
            "RecognitionStatus": "Success",
            "DisplayText": "Remind me to buy milk.",
            "Offset": 1200000,
            "Duration": 21300000
        }"#;
        let phrase: SpeechPhrase = serde_json::from_str(body).unwrap();
        assert_eq!(phrase.recognition_status, RecognitionStatus::Success);
        assert_eq!(phrase.display_text.as_deref(), Some("Remind me to buy milk."));
        assert_eq!(phrase.offset, 1200000);
    }

    #[test]
    fn test_turn_start_payload_parses() {
        let body = r#"{"context":{"serviceTag":"7b33…e1"}}"#;
        let start: TurnStart = serde_json::from_str(body).unwrap();
        assert_eq!(start.context.service_tag.as_deref(), Some("7b33…e1"));

        let empty: TurnStart = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.context.service_tag, None);
    }
}
