//! Scripted Central System behavior
//!
//! Decides how the fake Central System answers each charge point call:
//! - BootNotification status (with a number of Pending rounds first)
//! - Authorize / StartTransaction idTagInfo per id tag
//! - Actions that are never answered (to exercise call timeouts)

use std::collections::{HashMap, HashSet};

/// BootNotification answer once the Pending rounds are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootReply {
    Accepted,
    Rejected,
}

impl BootReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootReply::Accepted => "Accepted",
            BootReply::Rejected => "Rejected",
        }
    }
}

/// How the fake Central System answers
#[derive(Debug, Clone)]
pub struct CsBehavior {
    pub boot_reply: BootReply,
    /// Answer this many BootNotifications with Pending first
    pub pending_boots: u32,
    /// Interval sent with Accepted, in seconds
    pub heartbeat_interval: i32,
    /// Interval sent with Pending / Rejected, in seconds
    pub retry_interval: i32,
    /// idTag -> AuthorizationStatus; unlisted tags are Accepted
    pub tag_status: HashMap<String, String>,
    /// Actions that are recorded but never answered
    pub silent_actions: HashSet<String>,
    /// First transaction id handed out
    pub first_transaction_id: i32,
}

impl Default for CsBehavior {
    fn default() -> Self {
        Self {
            boot_reply: BootReply::Accepted,
            pending_boots: 0,
            heartbeat_interval: 300,
            retry_interval: 1,
            tag_status: HashMap::new(),
            silent_actions: HashSet::new(),
            first_transaction_id: 1,
        }
    }
}

impl CsBehavior {
    /// Accepts everything
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Rejects BootNotification
    pub fn rejecting() -> Self {
        Self {
            boot_reply: BootReply::Rejected,
            ..Default::default()
        }
    }

    /// Answers `rounds` BootNotifications with Pending before accepting
    pub fn pending(rounds: u32) -> Self {
        Self {
            pending_boots: rounds,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    pub fn with_tag_status(mut self, id_tag: &str, status: &str) -> Self {
        self.tag_status.insert(id_tag.to_string(), status.to_string());
        self
    }

    pub fn with_silent_action(mut self, action: &str) -> Self {
        self.silent_actions.insert(action.to_string());
        self
    }

    pub fn with_first_transaction_id(mut self, id: i32) -> Self {
        self.first_transaction_id = id;
        self
    }

    pub fn status_for(&self, id_tag: &str) -> &str {
        self.tag_status
            .get(id_tag)
            .map(String::as_str)
            .unwrap_or("Accepted")
    }

    pub fn is_silent(&self, action: &str) -> bool {
        self.silent_actions.contains(action)
    }
}
