use satchel_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("line has no section type")]
    MissingSectionType,
    #[error("unterminated quoted field")]
    UnterminatedQuote,
    #[error("unexpected character {0:?} after quoted field")]
    UnexpectedCharacter(char),
    #[error("line {line}: {source}")]
    AtLine {
        line: usize,
        #[source]
        source: Box<CodecError>,
    },
}

#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("bucket {bucket} is unreachable: {source}")]
    StoreUnavailable {
        bucket: String,
        #[source]
        source: StorageError,
    },
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error("storage fault: {0}")]
    TransientStorageFault(#[from] StorageError),
    #[error("policy object is not valid utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("policy object is malformed: {0}")]
    Codec(#[from] CodecError),
    #[error("gave up after {attempts} conflicting writes")]
    LostUpdateRace { attempts: u32 },
    #[error("{op} was not persisted")]
    NotPersisted { op: &'static str },
}

pub type PolicyStoreResult<T> = Result<T, PolicyStoreError>;
