use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("revision conflict on '{0}'")]
    Conflict(String),
    #[error("invalid collection name '{0}'")]
    InvalidName(String),
    #[error("invalid record id '{0}'")]
    InvalidId(String),
    #[error("invalid revision token '{0}'")]
    InvalidMvcc(String),
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt collection metadata: {0}")]
    CorruptMetadata(String),
    #[error("script failure: {0}")]
    Script(String),
    #[error("storage busy after {0} attempts")]
    Busy(u32),
    #[error("storage error")]
    Storage(#[from] rusqlite::Error),
    #[error("internal invariant breached: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidJson(err.to_string())
    }
}

/// Coarse classification used by front ends to map errors onto status
/// codes without matching every variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Invalid,
    Io,
    Corrupt,
    Script,
    Busy,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidName(_)
            | Error::InvalidId(_)
            | Error::InvalidMvcc(_)
            | Error::InvalidJson(_) => ErrorKind::Invalid,
            Error::Io(_) | Error::Storage(_) => ErrorKind::Io,
            Error::CorruptMetadata(_) => ErrorKind::Corrupt,
            Error::Script(_) => ErrorKind::Script,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Io => "io",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Script => "script",
            ErrorKind::Busy => "busy",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}
