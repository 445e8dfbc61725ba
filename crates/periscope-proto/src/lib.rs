//! Wire protocol for the periscope signaling server.
//! Keeping this in a dedicated crate allows client bindings to be generated
//! against one source of truth without pulling in server runtime code.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role a socket declares in its first message.
///
/// `PoolManager` is the singleton process that spawns and tears down agent
/// processes. `Agent` sockets are opened by those processes and carry the slot
/// id they were spawned for. `Viewer` sockets are interactive clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketKind {
    PoolManager,
    Agent,
    Viewer,
}

/// Messages accepted from any connected socket. The first message on every
/// connection must be `Identify`; everything else is validated against the
/// declared role by the server.
///
/// Offer/answer/candidate/result payloads are opaque to the server and relayed
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Identify {
        socket_kind: SocketKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slot_id: Option<Uuid>,
    },
    StartRecording {
        url: String,
    },
    StopRecording,
    IceCandidate {
        candidate: Value,
    },
    Offer {
        offer: Value,
    },
    Answer {
        answer: Value,
    },
    ResizeEvent {
        width: u32,
        height: u32,
    },
    MouseEvent {
        #[serde(rename = "type")]
        event_type: String,
        x: f64,
        y: f64,
    },
    KeyboardEvent {
        #[serde(rename = "type")]
        event_type: String,
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    SlotResult {
        slot_id: Uuid,
        result: Value,
    },
}

/// Messages sent by the server. Slot control messages go to the pool manager,
/// relays go to the paired session, input events go to the manager re-tagged
/// with the slot they concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    SpawnSlot {
        slot_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    NavigateSlot {
        slot_id: Uuid,
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    StopSlot {
        slot_id: Uuid,
    },
    IceCandidate {
        candidate: Value,
    },
    Offer {
        offer: Value,
    },
    Answer {
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResizeEvent {
        slot_id: Uuid,
        width: u32,
        height: u32,
    },
    #[serde(rename_all = "camelCase")]
    MouseEvent {
        slot_id: Uuid,
        #[serde(rename = "type")]
        event_type: String,
        x: f64,
        y: f64,
    },
    #[serde(rename_all = "camelCase")]
    KeyboardEvent {
        slot_id: Uuid,
        #[serde(rename = "type")]
        event_type: String,
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    SlotResult {
        slot_id: Uuid,
        result: Value,
    },
    Error {
        message: String,
    },
}
