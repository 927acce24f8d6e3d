use std::io;

/// Error terminating a connection driver.
#[derive(Debug)]
pub enum ConnectionError {
    /// Transport-level I/O failure. All outstanding calls on the connection
    /// have been rejected with `ConnectionClosed` by the time the driver
    /// returns this.
    Io(io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Error registering a type name that is already claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConflict {
    /// Every name in the rejected registration that was already taken.
    pub names: Vec<String>,
}

impl std::fmt::Display for TypeConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "types already registered: {}", self.names.join(", "))
    }
}

impl std::error::Error for TypeConflict {}
