//! The error taxonomy produced by the block-blob store core.
//!
//! Every public operation returns `Result<T, BlobError>` instead of the C
//! core's thread-local errno-style slot, but the multi-step cleanup paths
//! (`Blob::close`, `Blob::delete`, clone rollback) still need "the caller
//! sees the first error that occurred, regardless of best-effort unwind" —
//! that part of the original design is kept verbatim via [`record_first_error`]
//! and [`take_first_error`].

use std::cell::RefCell;
use std::io;

use thiserror::Error;

/// The core's error taxonomy. `OK` from the original design is simply
/// `Result::Ok` here and has no variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("no such entry: {0}")]
    NoEnt(String),
    #[error("out of memory: {0}")]
    NoMem(String),
    #[error("permission denied: {0}")]
    Acces(String),
    #[error("already exists: {0}")]
    Exist(String),
    #[error("invalid argument: {0}")]
    Inval(String),
    #[error("no space left: {0}")]
    NoSpc(String),
    #[error("would block: {0}")]
    Again(String),
    #[error("bad handle: {0}")]
    BadF(String),
    #[error("too many open handles: {0}")]
    MFile(String),
    #[error("signature mismatch: {0}")]
    Signature(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl BlobError {
    /// Short, stable tag for the error kind, independent of the context
    /// string. Useful for tests and for callers that want to match on kind
    /// without pattern-matching every variant.
    pub fn kind(&self) -> &'static str {
        match self {
            BlobError::NoEnt(_) => "NOENT",
            BlobError::NoMem(_) => "NOMEM",
            BlobError::Acces(_) => "ACCES",
            BlobError::Exist(_) => "EXIST",
            BlobError::Inval(_) => "INVAL",
            BlobError::NoSpc(_) => "NOSPC",
            BlobError::Again(_) => "AGAIN",
            BlobError::BadF(_) => "BADF",
            BlobError::MFile(_) => "MFILE",
            BlobError::Signature(_) => "SIGNATURE",
            BlobError::Unknown(_) => "UNKNOWN",
        }
    }

    pub(crate) fn inval<S: Into<String>>(msg: S) -> Self {
        BlobError::Inval(msg.into())
    }

    pub(crate) fn noent<S: Into<String>>(msg: S) -> Self {
        BlobError::NoEnt(msg.into())
    }

    pub(crate) fn again<S: Into<String>>(msg: S) -> Self {
        BlobError::Again(msg.into())
    }

    pub(crate) fn nospc<S: Into<String>>(msg: S) -> Self {
        BlobError::NoSpc(msg.into())
    }
}

/// Translate a raw `io::Error` through the fixed map described in the
/// design's error handling section: the errno (when present) decides the
/// kind, the formatted error becomes the context string.
impl From<io::Error> for BlobError {
    fn from(err: io::Error) -> Self {
        let msg = err.to_string();
        match err.raw_os_error() {
            Some(libc::ENOENT) => BlobError::NoEnt(msg),
            Some(libc::ENOMEM) => BlobError::NoMem(msg),
            Some(libc::EACCES) | Some(libc::EPERM) => BlobError::Acces(msg),
            Some(libc::EEXIST) => BlobError::Exist(msg),
            Some(libc::EINVAL) => BlobError::Inval(msg),
            Some(libc::ENOSPC) => BlobError::NoSpc(msg),
            Some(libc::EAGAIN) => BlobError::Again(msg),
            Some(libc::EBADF) => BlobError::BadF(msg),
            Some(libc::EMFILE) | Some(libc::ENFILE) => BlobError::MFile(msg),
            _ => match err.kind() {
                io::ErrorKind::NotFound => BlobError::NoEnt(msg),
                io::ErrorKind::PermissionDenied => BlobError::Acces(msg),
                io::ErrorKind::AlreadyExists => BlobError::Exist(msg),
                io::ErrorKind::WouldBlock => BlobError::Again(msg),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => BlobError::Inval(msg),
                _ => BlobError::Unknown(msg),
            },
        }
    }
}

impl From<nix::Error> for BlobError {
    fn from(err: nix::Error) -> Self {
        let msg = err.to_string();
        match err.as_errno() {
            Some(nix::errno::Errno::ENOENT) => BlobError::NoEnt(msg),
            Some(nix::errno::Errno::ENOMEM) => BlobError::NoMem(msg),
            Some(nix::errno::Errno::EACCES) | Some(nix::errno::Errno::EPERM) => {
                BlobError::Acces(msg)
            }
            Some(nix::errno::Errno::EEXIST) => BlobError::Exist(msg),
            Some(nix::errno::Errno::EINVAL) => BlobError::Inval(msg),
            Some(nix::errno::Errno::ENOSPC) => BlobError::NoSpc(msg),
            Some(nix::errno::Errno::EAGAIN) => BlobError::Again(msg),
            Some(nix::errno::Errno::EBADF) => BlobError::BadF(msg),
            Some(nix::errno::Errno::EMFILE) | Some(nix::errno::Errno::ENFILE) => {
                BlobError::MFile(msg)
            }
            _ => BlobError::Unknown(msg),
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<BlobError>> = RefCell::new(None);
}

/// Record `err` as the thread's "first error" if none is already recorded.
/// Used on cleanup/unwind paths that keep going best-effort after the first
/// failure (`Blob::delete`'s peer-refs loop, clone rollback) so the error the
/// caller eventually sees is the one that actually triggered the unwind, not
/// whatever incidental error a cleanup step produced afterwards.
pub fn record_first_error(err: BlobError) {
    LAST_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    });
}

/// Take and clear the thread's recorded first error, if any.
pub fn take_first_error() -> Option<BlobError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}
