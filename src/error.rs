use std::io;

#[derive(Debug)]
pub enum SyncError {
    /// config.txt exists but is missing one of the required keys.
    InvalidConfig(String),
    /// The configured list or calendar was not found within the page window.
    NotFound(String),
    Auth(String),
    Request(String),
    Io(String),
}

impl SyncError {
    pub fn message(&self) -> String {
        match self {
            SyncError::InvalidConfig(msg) => msg.clone(),
            SyncError::NotFound(msg) => msg.clone(),
            SyncError::Auth(msg) => format!("error getting access token: {msg}"),
            SyncError::Request(msg) => msg.clone(),
            SyncError::Io(msg) => msg.clone(),
        }
    }

    /// Conditions that end the run without signalling failure to the shell.
    /// Missing config keys and unlocated resources exit 0, matching the
    /// tool's long-standing behavior.
    pub fn is_controlled_stop(&self) -> bool {
        matches!(self, SyncError::InvalidConfig(_) | SyncError::NotFound(_))
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Request(err.to_string())
    }
}
