//! Connection states.
//!
//! [`SessionState`] is the fine-grained state the session sequences
//! operations with. Observers only see the collapsed [`ConnectionState`].

/// Connection state as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Currently attempting to connect, bond, or read.
    Connecting,
    /// Connected to the peripheral.
    Connected,
    /// Not connected.
    #[default]
    Disconnected,
    /// The last attempt ended with an explicit failure.
    Error,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Internal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// A scan is running and no connection is in progress.
    Scanning,
    /// Bond state is being queried.
    Connecting,
    /// Waiting for a bonding procedure to finish.
    Bonding,
    /// Waiting for the link to come up.
    LinkEstablishing,
    /// Looking for the battery service.
    DiscoveringServices,
    /// Waiting for the battery level value.
    ReadingCharacteristic,
    /// Link up, battery read finished or unavailable.
    Connected,
    /// The last session ended normally.
    Disconnected,
    /// The last session ended with an explicit failure.
    Error,
}

impl SessionState {
    /// Collapse to the observer-facing state.
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Connecting
            | Self::Bonding
            | Self::LinkEstablishing
            | Self::DiscoveringServices
            | Self::ReadingCharacteristic => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
            Self::Idle | Self::Scanning | Self::Disconnected => ConnectionState::Disconnected,
            Self::Error => ConnectionState::Error,
        }
    }

    /// Whether a connection attempt is in flight or established.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Scanning | Self::Disconnected | Self::Error
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning",
            Self::Connecting => "Connecting",
            Self::Bonding => "Bonding",
            Self::LinkEstablishing => "LinkEstablishing",
            Self::DiscoveringServices => "DiscoveringServices",
            Self::ReadingCharacteristic => "ReadingCharacteristic",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}
