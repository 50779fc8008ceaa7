use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,
}
