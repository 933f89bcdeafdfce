/// Errors raised by the data model.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A yrs update could not be decoded or applied
    InvalidUpdate(String),
    /// Base64 payload could not be decoded
    InvalidEncoding(String),
    /// JSON (de)serialization failed
    SerializationError(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            CoreError::InvalidEncoding(e) => write!(f, "Invalid encoding: {e}"),
            CoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<yrs::encoding::read::Error> for CoreError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CoreError::InvalidUpdate(e.to_string())
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(e: base64::DecodeError) -> Self {
        CoreError::InvalidEncoding(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::SerializationError(e.to_string())
    }
}
