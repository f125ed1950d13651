use crate::transport::TransportError;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("None of the {attempted} connections to the RabbitMq broker could be established")]
    BrokerUnreachable {
        attempted: usize,
        #[source]
        source: TransportError,
    },
    #[error("Connection {connection_id} is dead and could not be re-established")]
    ConnectionUnavailable {
        connection_id: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to open a channel")]
    Transport(#[from] TransportError),
    #[error("The pool has been shut down")]
    Closed,
    #[error("Invalid pool configuration: {0}")]
    Misconfigured(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Closed => Self::Closed,
            err => Self::Other(anyhow::anyhow!("{err}")),
        }
    }
}

impl From<deadpool::managed::BuildError<Error>> for Error {
    fn from(err: deadpool::managed::BuildError<Error>) -> Self {
        Self::Misconfigured(err.to_string())
    }
}
