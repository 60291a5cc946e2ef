#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegisterError {
    #[error(
        "Channel '{0}' is already registered. Use allow_override to replace the existing handler."
    )]
    AlreadyRegistered(String),

    #[error("Handler reports type name '{actual}', cannot be registered as '{requested}'")]
    InvalidHandler { requested: String, actual: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubscribeError {
    #[error("Channel '{channel}' is not registered. Available channels: {available:?}")]
    UnknownChannel {
        channel: String,
        available: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PublishError {
    #[error("Channel '{0}' is not registered")]
    UnknownChannel(String),
}
