use serde::{Deserialize, Serialize};

/// Conversation kinds. `Direct` conversations always have exactly two
/// active participants and are deduplicated per user pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Channel,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// How message content travels: through the hub, directly peer-to-peer,
/// or P2P with hub fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Hub,
    P2p,
    Hybrid,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::P2p => "p2p",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hub" => Some(Self::Hub),
            "p2p" => Some(Self::P2p),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Admin,
    Owner,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Owners and admins may change membership.
    pub fn can_manage_participants(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

/// P2P signaling session states.
///
/// initiating --answer--> connecting --confirm--> connected --> disconnected
/// Any non-terminal state may transition to `Failed` on timeout or
/// protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum P2pSessionStatus {
    Initiating,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl P2pSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiating" => Some(Self::Initiating),
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}
