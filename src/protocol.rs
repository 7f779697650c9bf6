// Wire protocol - domain messages and the versioned codec

//! # Wire Protocol
//!
//! This module defines the domain messages that travel over the bus and the
//! codec that maps them to byte payloads. Encoding is a pure bijection:
//! `decode(encode(m)) == m` for every valid message, and
//! `encode(decode(b)) == b` for every payload the codec itself produced.
//! Payloads that fail decoding surface as [`FlowError::InvalidMessage`] and
//! are rejected by the broker without requeue.
//!
//! The wire format is a JSON envelope carrying a codec version and a
//! `message_class` tag that selects the variant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{FlowError, Result};

/// Version stamped into every encoded payload; decoding any other version
/// is an invalid message.
pub const CODEC_VERSION: u8 = 1;

/// Resource limits forwarded to batch-scheduler executors.
///
/// Local fork execution ignores these; schedulers translate them into
/// per-job rlimits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_resident_memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_virtual_memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_open_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stack_size: Option<u64>,
}

/// Options handed to the shell-command executor alongside the command line.
///
/// The dispatch action fills `user_id`, `group_id`, `environment` and
/// `working_directory` from the net's constants; everything else comes from
/// the transition's own arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOptions {
    /// Job name shown by the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Scheduler queue to submit into (batch executors only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,

    #[serde(default, skip_serializing_if = "rlimits_is_default")]
    pub resources: Rlimits,
}

fn rlimits_is_default(r: &Rlimits) -> bool {
    *r == Rlimits::default()
}

/// Domain messages carried by the bus.
///
/// The `message_class` tag is the wire-level discriminator; field names are
/// part of the wire format and must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_class")]
pub enum Message {
    /// Create a fresh token and place it, kicking off or continuing a flow
    CreateToken {
        net_key: String,
        place_idx: u64,
        color: u64,
        color_group_idx: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Place an already-created token
    SetToken {
        net_key: String,
        place_idx: u64,
        token_idx: u64,
    },

    /// A (color, place) pair may have gained a token; drive its arcs out
    NotifyPlace {
        net_key: String,
        place_idx: u64,
        color: u64,
    },

    /// Attempt to fire a transition with the given token as enabler
    NotifyTransition {
        net_key: String,
        transition_idx: u64,
        place_idx: u64,
        token_idx: u64,
    },

    /// Submit a shell command to an executor service
    Submit {
        command_line: Vec<String>,
        net_key: String,
        /// Logical response name -> place index ("pre_dispatch",
        /// "post_dispatch_success", "post_dispatch_failure")
        response_places: BTreeMap<String, u64>,
        color: u64,
        color_group_idx: u64,
        #[serde(default)]
        executor_options: ExecutorOptions,
    },
}

impl Message {
    /// Short name used in logs
    pub fn class_name(&self) -> &'static str {
        match self {
            Message::CreateToken { .. } => "CreateToken",
            Message::SetToken { .. } => "SetToken",
            Message::NotifyPlace { .. } => "NotifyPlace",
            Message::NotifyTransition { .. } => "NotifyTransition",
            Message::Submit { .. } => "Submit",
        }
    }

    /// The net this message operates on
    pub fn net_key(&self) -> &str {
        match self {
            Message::CreateToken { net_key, .. }
            | Message::SetToken { net_key, .. }
            | Message::NotifyPlace { net_key, .. }
            | Message::NotifyTransition { net_key, .. }
            | Message::Submit { net_key, .. } => net_key,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    #[serde(flatten)]
    message: Message,
}

/// Codec between domain messages and byte payloads
pub mod codec {
    use super::*;

    /// Encode a message into its wire payload
    pub fn encode(message: &Message) -> Result<Vec<u8>> {
        let envelope = Envelope {
            v: CODEC_VERSION,
            message: message.clone(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode a wire payload back into a message.
    ///
    /// Any failure - malformed JSON, unknown `message_class`, missing
    /// fields, wrong codec version - is an [`FlowError::InvalidMessage`].
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|e| FlowError::InvalidMessage(e.to_string()))?;
        if envelope.v != CODEC_VERSION {
            return Err(FlowError::InvalidMessage(format!(
                "unsupported codec version {}",
                envelope.v
            )));
        }
        Ok(envelope.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::CreateToken {
                net_key: "n1".into(),
                place_idx: 0,
                color: 0,
                color_group_idx: 0,
                data: Some(json!({"k": "v"})),
            },
            Message::SetToken {
                net_key: "n1".into(),
                place_idx: 3,
                token_idx: 7,
            },
            Message::NotifyPlace {
                net_key: "n1".into(),
                place_idx: 2,
                color: 5,
            },
            Message::NotifyTransition {
                net_key: "n1".into(),
                transition_idx: 1,
                place_idx: 2,
                token_idx: 4,
            },
            Message::Submit {
                command_line: vec!["df".into(), "/".into()],
                net_key: "n1".into(),
                response_places: BTreeMap::from([
                    ("pre_dispatch".into(), 1),
                    ("post_dispatch_success".into(), 2),
                    ("post_dispatch_failure".into(), 3),
                ]),
                color: 0,
                color_group_idx: 0,
                executor_options: ExecutorOptions {
                    working_directory: Some("/tmp".into()),
                    ..Default::default()
                },
            },
        ]
    }

    #[test]
    fn round_trips_every_message_class() {
        for message in sample_messages() {
            let payload = codec::encode(&message).unwrap();
            let decoded = codec::decode(&payload).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn canonical_bytes_re_encode_unchanged() {
        for message in sample_messages() {
            let payload = codec::encode(&message).unwrap();
            let re_encoded = codec::encode(&codec::decode(&payload).unwrap()).unwrap();
            assert_eq!(payload, re_encoded);
        }
    }

    #[test]
    fn rejects_garbage_payloads() {
        assert!(matches!(
            codec::decode(b"not json"),
            Err(FlowError::InvalidMessage(_))
        ));
        assert!(matches!(
            codec::decode(b"{\"v\":1}"),
            Err(FlowError::InvalidMessage(_))
        ));
        assert!(matches!(
            codec::decode(b"{\"v\":1,\"message_class\":\"NoSuchThing\"}"),
            Err(FlowError::InvalidMessage(_))
        ));
    }

    #[test]
    fn rejects_wrong_codec_version() {
        let mut payload = codec::encode(&Message::NotifyPlace {
            net_key: "n1".into(),
            place_idx: 0,
            color: 0,
        })
        .unwrap();
        // {"v":1,... -> {"v":9,...
        let pos = payload.windows(4).position(|w| w == b"\"v\":").unwrap();
        payload[pos + 4] = b'9';
        assert!(matches!(
            codec::decode(&payload),
            Err(FlowError::InvalidMessage(_))
        ));
    }

    #[test]
    fn wire_format_uses_message_class_tag() {
        let payload = codec::encode(&Message::SetToken {
            net_key: "abc".into(),
            place_idx: 0,
            token_idx: 1,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["message_class"], "SetToken");
        assert_eq!(value["v"], 1);
    }
}
