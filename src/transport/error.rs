use lapin::{ChannelState, ConnectionState};

/// The two classes of failure a broker call can end with.
///
/// The pools decide whether a channel must be flagged dead purely from the kind:
/// see [`TransportErrorKind::should_flag_dead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The channel or its connection has been closed, remotely or locally.
    /// The channel cannot be used anymore.
    Closed,
    /// Any other error reported by the broker or the client library.
    /// The channel is assumed to still be usable.
    Transient,
}

impl TransportErrorKind {
    pub fn should_flag_dead(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Error returned by [`Transport`](super::Transport) operations.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("The channel or connection to the RabbitMq broker is closed")]
    Closed(#[source] anyhow::Error),
    #[error("The RabbitMq broker operation failed")]
    Transient(#[source] anyhow::Error),
}

impl TransportError {
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed(anyhow::anyhow!(message.into()))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(anyhow::anyhow!(message.into()))
    }

    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Closed(_) => TransportErrorKind::Closed,
            Self::Transient(_) => TransportErrorKind::Transient,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == TransportErrorKind::Closed
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        let closed = match &err {
            lapin::Error::InvalidChannelState(state) => !matches!(state, ChannelState::Connected),
            lapin::Error::InvalidConnectionState(state) => {
                !matches!(state, ConnectionState::Connected)
            }
            lapin::Error::InvalidChannel(_)
            | lapin::Error::IOError(_)
            | lapin::Error::MissingHeartbeatError => true,
            _ => false,
        };
        if closed {
            Self::Closed(err.into())
        } else {
            Self::Transient(err.into())
        }
    }
}
