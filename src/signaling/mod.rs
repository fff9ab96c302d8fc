//! Signaling Module - WebSocket Client für das Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalSender, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
