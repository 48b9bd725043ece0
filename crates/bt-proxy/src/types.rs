//! Domain vocabulary of the Bluetooth control service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A service module that must be opened before its commands are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Phone,
    Music,
    Phonebook,
}

impl Module {
    pub const ALL: [Module; 3] = [Module::Phone, Module::Music, Module::Phonebook];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Phone => "phone",
            Module::Music => "music",
            Module::Phonebook => "phonebook",
        }
    }

    /// Capability granted by a successful open.
    pub fn capability(&self) -> String {
        format!("module:{}", self.as_str())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phonebook categories, downloaded one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhonebookKind {
    Contacts,
    ReceivedCalls,
    DialedCalls,
    MissedCalls,
    SimContacts,
}

impl PhonebookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhonebookKind::Contacts => "contacts",
            PhonebookKind::ReceivedCalls => "received_calls",
            PhonebookKind::DialedCalls => "dialed_calls",
            PhonebookKind::MissedCalls => "missed_calls",
            PhonebookKind::SimContacts => "sim_contacts",
        }
    }
}

impl fmt::Display for PhonebookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-change streams published by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    LinkState,
    CallState,
    MediaState,
    BatteryLevel,
    SignalStrength,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::LinkState => "link_state",
            Topic::CallState => "call_state",
            Topic::MediaState => "media_state",
            Topic::BatteryLevel => "battery_level",
            Topic::SignalStrength => "signal_strength",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}
