use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};

use tracing::debug;

use crate::error::SmtpError;
use crate::utils::safe_log_string;

/// Longueur maximale d'une ligne de réponse lue d'un coup (limite de RFC 5321).
/// Une ligne plus longue est coupée et son reste lu comme la réponse suivante.
const MAX_LINE: u64 = 512;

/// Étapes de l'échange, dans l'ordre
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Greet,
    Upgrade,
    Handshake,
    Regreet,
    AuthBegin,
    AuthUser,
    AuthPass,
    EnvelopeFrom,
    EnvelopeTo,
    DataBegin,
    Payload,
    Close,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "greeting",
            Phase::Greet => "EHLO",
            Phase::Upgrade => "STARTTLS",
            Phase::Handshake => "TLS handshake",
            Phase::Regreet => "EHLO (TLS)",
            Phase::AuthBegin => "AUTH LOGIN",
            Phase::AuthUser => "AUTH username",
            Phase::AuthPass => "AUTH password",
            Phase::EnvelopeFrom => "MAIL FROM",
            Phase::EnvelopeTo => "RCPT TO",
            Phase::DataBegin => "DATA",
            Phase::Payload => "message",
            Phase::Close => "QUIT",
        };
        f.write_str(name)
    }
}

/// État d'un envoi : un seul flux, une seule étape courante.
pub struct SmtpSession<S: Read + Write> {
    stream: BufReader<S>,
    phase: Phase,
}

impl<S: Read + Write> SmtpSession<S> {
    pub fn new(stream: S, phase: Phase) -> Self {
        Self {
            stream: BufReader::new(stream),
            phase,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        debug!(%phase, "smtp phase");
        self.phase = phase;
    }

    /// Envoie une commande terminée par CRLF
    pub fn send_line(&mut self, line: &str) -> Result<(), SmtpError> {
        let phase = self.phase;
        let writer = self.stream.get_mut();
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\r\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| SmtpError::from_io(phase, e))
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), SmtpError> {
        let phase = self.phase;
        let writer = self.stream.get_mut();
        writer
            .write_all(bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| SmtpError::from_io(phase, e))
    }

    fn read_line(&mut self) -> Result<String, SmtpError> {
        let phase = self.phase;
        let mut line = String::new();
        let n = self
            .stream
            .by_ref()
            .take(MAX_LINE)
            .read_line(&mut line)
            .map_err(|e| SmtpError::from_io(phase, e))?;
        if n == 0 {
            return Err(SmtpError::Closed { phase });
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        debug!(phase = %self.phase, reply = %safe_log_string(&line), "smtp reply");
        Ok(line)
    }

    /// Lit une ligne et exige qu'elle commence par `code`
    pub fn expect(&mut self, code: &'static str) -> Result<String, SmtpError> {
        let line = self.read_line()?;
        if line.starts_with(code) {
            Ok(line)
        } else {
            Err(SmtpError::UnexpectedReply {
                phase: self.phase,
                expected: code,
                line,
            })
        }
    }

    /// Consomme une réponse multi-ligne (`250-...`) jusqu'à la ligne finale (`250 ...`).
    pub fn drain_reply(&mut self) -> Result<Vec<String>, SmtpError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let last = is_final_line(&line);
            lines.push(line);
            if last {
                return Ok(lines);
            }
        }
    }

    /// Rend le flux sous-jacent. Refuse si le serveur a déjà envoyé
    /// des octets qui devraient suivre la négociation TLS.
    pub fn into_inner(self) -> Result<S, SmtpError> {
        if !self.stream.buffer().is_empty() {
            return Err(SmtpError::InjectedData);
        }
        Ok(self.stream.into_inner())
    }
}

/// Le quatrième caractère d'une ligne finale est une espace, pas un tiret
fn is_final_line(line: &str) -> bool {
    match line.as_bytes().get(3) {
        Some(b' ') => true,
        Some(_) => false,
        None => line.len() == 3,
    }
}
