use std::fmt::{self, Display};
use std::io;
use std::result;

use failure::{Backtrace, Context, Fail};

pub type Result<T> = result::Result<T, Error>;

/// One code per failure category. Everything the library can fail with maps
/// onto exactly one of these; the cause chain carries the detail.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "disk i/o failed")]
    Io,
    #[fail(display = "partition metadata is malformed")]
    MetaFormat,
    #[fail(display = "partition metadata signature verification failed")]
    MetaSig,
    #[fail(display = "public keyfile is missing or malformed")]
    CryptoKey,
    #[fail(display = "generated device-mapper table exceeds size limit")]
    DmTableOverflow,
    #[fail(display = "kernel keyring lookup failed")]
    KeyringLookup,
    #[fail(display = "TPM transport could not be opened")]
    TpmTransport,
    #[fail(display = "TPM policy rejected the unseal request")]
    TpmPolicy,
    #[fail(display = "TPM command failed")]
    TpmState,
    #[fail(display = "bad PCR selection")]
    TpmBadPcr,
    #[fail(display = "internal error")]
    Internal,
}

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        *self.inner.get_context()
    }

    /// Construct an error of `kind` with a free-form detail message as its
    /// cause.
    pub fn detail(kind: ErrorKind, msg: impl Into<String>) -> Error {
        Error { inner: failure::err_msg(msg.into()).context(kind) }
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { inner: Context::new(kind) }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error { inner: err.context(ErrorKind::Io) }
    }
}

/// Abort with an error of the given kind and a formatted detail message.
#[macro_export]
macro_rules! fail {
    ($kind:expr, $e:expr) => {
        return Err($crate::Error::detail($kind, $e))
    };
    ($kind:expr, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::detail($kind, format!($fmt, $($arg)+)))
    };
}
