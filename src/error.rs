use std::path::PathBuf;

use crate::session::Phase;

/// Erreurs du stockage des tentatives
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rate-limit store I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rate-limit store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Erreurs du client SMTP. Toute erreur est fatale pour l'envoi en cours.
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase}: I/O error: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("{phase}: timed out waiting for the server")]
    Timeout { phase: Phase },

    #[error("{phase}: connection closed by server")]
    Closed { phase: Phase },

    #[error("{phase}: expected {expected}, got {line:?}")]
    UnexpectedReply {
        phase: Phase,
        expected: &'static str,
        line: String,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("invalid SMTP server name: {0}")]
    InvalidServerName(String),

    #[error("server sent data before the TLS handshake")]
    InjectedData,
}

impl SmtpError {
    /// Classe une erreur d'E/S : un délai dépassé est une erreur à part entière
    pub fn from_io(phase: Phase, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                SmtpError::Timeout { phase }
            }
            std::io::ErrorKind::UnexpectedEof => SmtpError::Closed { phase },
            _ => SmtpError::Io { phase, source },
        }
    }
}
