/// Connection lifecycle state.
///
/// Initiating side walks `Closed → SynSent → Open → CloseWait`; the
/// accepting side is spawned directly into `SynRcvd` by its listener and
/// walks `SynRcvd → Open → CloseWait`. A connection in `CloseWait` longer
/// than the close-wait window is purged from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No handshake attempted yet.
    #[default]
    Closed,
    /// Active open: SYN sent, waiting for the peer's SYN+ACK.
    SynSent,
    /// Passive open: SYN received and answered, waiting for the final ACK.
    SynRcvd,
    /// Handshake complete; data flows.
    Open,
    /// Reset sent or received; lingering until purge.
    CloseWait,
}

impl ConnectionState {
    /// True once the handshake has completed.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// True while the handshake is still in progress.
    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionState::SynSent | ConnectionState::SynRcvd)
    }

    /// True once the connection has been reset and awaits purging.
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::CloseWait)
    }
}
