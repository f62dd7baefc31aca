use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed packet payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("frame body of {0} bytes exceeds the 16-bit length field")]
    FrameTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;
