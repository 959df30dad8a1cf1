//! Typed signaling payloads
//!
//! The wire format of the signaling transport is out of scope; these
//! types pin down the *shape* of every named request, response, and push
//! event so malformed payloads are rejected at the boundary instead of
//! leaking undefined fields inward.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::media::MediaKind;

/// Request/response events issued by the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingRequest {
    #[serde(rename = "joinMeeting")]
    JoinMeeting {
        meeting_id: String,
        participant_id: String,
    },
    #[serde(rename = "reconnectMeeting")]
    ReconnectMeeting {
        meeting_id: String,
        participant_id: String,
    },
    #[serde(rename = "create-producer-transport")]
    CreateProducerTransport { meeting_id: String },
    #[serde(rename = "create-consumer-transport")]
    CreateConsumerTransport { meeting_id: String },
    #[serde(rename = "connect-producer-transport")]
    ConnectProducerTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename = "connect-consumer-transport")]
    ConnectConsumerTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename = "produce")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },
    #[serde(rename = "consume")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
}

impl SignalingRequest {
    /// The wire event name; also drives the per-call timeout heuristics
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinMeeting { .. } => "joinMeeting",
            Self::ReconnectMeeting { .. } => "reconnectMeeting",
            Self::CreateProducerTransport { .. } => "create-producer-transport",
            Self::CreateConsumerTransport { .. } => "create-consumer-transport",
            Self::ConnectProducerTransport { .. } => "connect-producer-transport",
            Self::ConnectConsumerTransport { .. } => "connect-consumer-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
        }
    }
}

/// Response to `joinMeeting` / `reconnectMeeting`
#[derive(Debug, Clone, Deserialize)]
pub struct JoinResponse {
    /// Media-session capabilities of the SFU router
    pub rtp_capabilities: Value,
    /// Participants already in the meeting
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
}

/// A participant already present when joining
#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: String,
    /// Producers this participant is already announcing
    #[serde(default)]
    pub producers: Vec<RemoteProducerInfo>,
}

/// Response to `create-{producer,consumer}-transport`
#[derive(Debug, Clone, Deserialize)]
pub struct TransportCreated {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Response to `produce`
#[derive(Debug, Clone, Deserialize)]
pub struct ProduceResponse {
    pub producer_id: String,
}

/// Response to `consume`
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumeResponse {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// A remote-producer announcement (`new-producer` push event, or part of
/// the join response)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteProducerInfo {
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub participant_id: Option<String>,
}

/// Push events from the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingNotification {
    #[serde(rename = "new-producer")]
    NewProducer(RemoteProducerInfo),
    #[serde(rename = "producer-closed")]
    ProducerClosed { producer_id: String },
    #[serde(rename = "participant-disconnected")]
    ParticipantDisconnected { participant_id: String },
    #[serde(rename = "meeting-ended")]
    MeetingEnded,
}

/// Why the signaling channel went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Clean server-initiated close; not an error
    ServerClose,
    /// Underlying transport error
    TransportError(String),
    /// Keepalive timed out
    PingTimeout,
}

impl DisconnectReason {
    /// Whether this close should be surfaced as a connection error
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, Self::ServerClose)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::ServerClose => "server closed the connection".to_string(),
            Self::TransportError(detail) => format!("transport error: {detail}"),
            Self::PingTimeout => "keepalive timed out".to_string(),
        }
    }
}

/// Everything that can arrive from the server side of the channel
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Reply to an in-flight request. A body carrying an `"error"` string
    /// field is a rejection.
    Response { request_id: u64, body: Value },
    /// Unsolicited push event
    Notification(SignalingNotification),
    /// The channel itself went away
    Disconnected { reason: DisconnectReason },
}
