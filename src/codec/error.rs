use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Record ends early: wanted {wanted} bytes at offset {offset}")]
    UnexpectedEnd { offset: usize, wanted: usize },

    #[error("Unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("String is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed {0}")]
    Malformed(&'static str),
}

pub type DecodeResult<T> = Result<T, DecodeError>;
