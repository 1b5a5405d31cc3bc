use std::io;

/// Fallible setup-time failures. Everything past startup is expressed as the
/// scheduler's `Pending|Positive|Negative` tri-state instead (see
/// `scheduler::task::Success`) -- these variants only cover the handful of
/// places where there genuinely is no sensible retry and `?` is the right tool.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("failed to open device channel: {0}")]
    ChannelOpen(#[source] io::Error),

    #[error("failed to bind listening socket on port {port}: {source}")]
    ListenerBind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;
