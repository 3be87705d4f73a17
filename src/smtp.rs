//! Client SMTP minimal : EHLO, STARTTLS, AUTH LOGIN puis un seul message.
//!
//! L'échange est strictement séquentiel sur une seule connexion. Chaque étape
//! attend un code précis ; le moindre écart, délai dépassé ou échec TLS
//! interrompt l'envoi. Aucune nouvelle tentative n'est faite.

use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use rustls::{
    Certificate, ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerName,
    StreamOwned,
};
use rustls_pemfile::certs;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::error::SmtpError;
use crate::session::{Phase, SmtpSession};

pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Nom annoncé dans EHLO
    pub helo_name: String,
    /// Appliqué à la connexion et à chaque lecture
    pub timeout: Duration,
    pub password: SecretString,
    /// Certificats PEM ajoutés aux racines web
    pub ca_file: Option<PathBuf>,
}

impl SmtpConfig {
    pub fn new(password: SecretString) -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            helo_name: "localhost".to_string(),
            timeout: Duration::from_secs(10),
            password,
            ca_file: None,
        }
    }
}

/// Un expéditeur, un destinataire, un corps HTML.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

impl EmailMessage {
    /// En-têtes et corps prêts pour DATA, point final inclus
    pub fn render(&self, date: DateTime<Utc>) -> String {
        let from = header_value(&self.from);
        let mut out = String::with_capacity(self.html_body.len() + 512);
        out.push_str(&format!("Subject: {}\r\n", header_value(&self.subject)));
        out.push_str(&format!("From: {}\r\n", from));
        out.push_str(&format!("To: {}\r\n", header_value(&self.to)));
        out.push_str(&format!("Reply-To: {}\r\n", from));
        out.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str("Content-Type: text/html; charset=UTF-8\r\n");
        out.push_str("X-Priority: 1\r\n");
        out.push_str("X-MSMail-Priority: High\r\n");
        out.push_str("Importance: High\r\n");
        out.push_str("\r\n");

        for line in self.html_body.lines() {
            // Transparence (RFC 5321 4.5.2)
            if line.starts_with('.') {
                out.push('.');
            }
            out.push_str(line);
            out.push_str("\r\n");
        }
        out.push_str(".\r\n");
        out
    }
}

fn header_value(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Envoi d'un message, tout ou rien.
pub trait Mailer {
    fn send(&self, message: &EmailMessage) -> Result<(), SmtpError>;
}

/// Passage au chiffrement sur la connexion existante
pub trait Upgrade {
    type Stream: Read + Write;

    fn upgrade(&self, tcp: TcpStream, host: &str) -> Result<Self::Stream, SmtpError>;
}

pub struct RustlsUpgrade {
    config: Arc<ClientConfig>,
}

impl RustlsUpgrade {
    pub fn new(ca_file: Option<&std::path::Path>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        if let Some(path) = ca_file {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open CA file: {:?}", path))?;
            let mut reader = BufReader::new(file);
            let ders = certs(&mut reader)
                .map_err(|_| anyhow::anyhow!("Failed to parse CA file: {:?}", path))?;
            if ders.is_empty() {
                return Err(anyhow::anyhow!("No certificate found in {:?}", path));
            }
            for der in ders {
                roots
                    .add(&Certificate(der))
                    .map_err(|e| anyhow::anyhow!("Invalid CA certificate: {}", e))?;
            }
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl Upgrade for RustlsUpgrade {
    type Stream = StreamOwned<ClientConnection, TcpStream>;

    fn upgrade(&self, mut tcp: TcpStream, host: &str) -> Result<Self::Stream, SmtpError> {
        let name = ServerName::try_from(host)
            .map_err(|_| SmtpError::InvalidServerName(host.to_string()))?;
        let mut conn = ClientConnection::new(self.config.clone(), name)
            .map_err(|e| SmtpError::Tls(e.to_string()))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|e| SmtpError::Tls(e.to_string()))?;
        }
        Ok(StreamOwned::new(conn, tcp))
    }
}

pub struct SmtpClient<U: Upgrade = RustlsUpgrade> {
    config: SmtpConfig,
    upgrade: U,
}

impl SmtpClient<RustlsUpgrade> {
    pub fn with_rustls(config: SmtpConfig) -> Result<Self> {
        let upgrade = RustlsUpgrade::new(config.ca_file.as_deref())?;
        Ok(Self::new(config, upgrade))
    }
}

impl<U: Upgrade> SmtpClient<U> {
    pub fn new(config: SmtpConfig, upgrade: U) -> Self {
        Self { config, upgrade }
    }

    fn connect(&self) -> Result<TcpStream, SmtpError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connect_err = |source| SmtpError::Connect {
            addr: addr.clone(),
            source,
        };

        let mut last = None;
        for sock in addr.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&sock, self.config.timeout) {
                Ok(tcp) => {
                    let timeout = Some(self.config.timeout);
                    tcp.set_read_timeout(timeout).map_err(connect_err)?;
                    tcp.set_write_timeout(timeout).map_err(connect_err)?;
                    return Ok(tcp);
                }
                Err(e) => last = Some(e),
            }
        }
        Err(connect_err(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
        })))
    }

    fn exchange(&self, message: &EmailMessage) -> Result<(), SmtpError> {
        let ehlo = format!("EHLO {}", self.config.helo_name);

        // En clair
        let mut plain = SmtpSession::new(self.connect()?, Phase::Connect);
        plain.expect("220")?;

        plain.enter(Phase::Greet);
        plain.send_line(&ehlo)?;
        plain.drain_reply()?;

        plain.enter(Phase::Upgrade);
        plain.send_line("STARTTLS")?;
        plain.expect("220")?;

        plain.enter(Phase::Handshake);
        let tcp = plain.into_inner()?;
        let stream = self.upgrade.upgrade(tcp, &self.config.host)?;

        // Chiffré
        let mut tls = SmtpSession::new(stream, Phase::Regreet);
        tls.send_line(&ehlo)?;
        tls.drain_reply()?;

        tls.enter(Phase::AuthBegin);
        tls.send_line("AUTH LOGIN")?;
        tls.expect("334")?;

        tls.enter(Phase::AuthUser);
        tls.send_line(&Base64::encode_string(message.from.as_bytes()))?;
        tls.expect("334")?;

        tls.enter(Phase::AuthPass);
        tls.send_line(&Base64::encode_string(
            self.config.password.expose_secret().as_bytes(),
        ))?;
        tls.expect("235")?;

        tls.enter(Phase::EnvelopeFrom);
        tls.send_line(&format!("MAIL FROM:<{}>", header_value(&message.from)))?;
        tls.expect("250")?;

        tls.enter(Phase::EnvelopeTo);
        tls.send_line(&format!("RCPT TO:<{}>", header_value(&message.to)))?;
        tls.expect("250")?;

        tls.enter(Phase::DataBegin);
        tls.send_line("DATA")?;
        tls.expect("354")?;

        tls.enter(Phase::Payload);
        tls.send_raw(message.render(Utc::now()).as_bytes())?;
        tls.expect("250")?;

        // Le message est accepté : la réponse à QUIT n'a pas d'importance
        tls.enter(Phase::Close);
        if let Err(e) = tls.send_line("QUIT") {
            debug!(error = %e, "QUIT not delivered");
        }
        Ok(())
    }
}

impl<U: Upgrade> Mailer for SmtpClient<U> {
    fn send(&self, message: &EmailMessage) -> Result<(), SmtpError> {
        match self.exchange(message) {
            Ok(()) => {
                info!(to = %message.to, subject = %message.subject, "email sent");
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.config.host, error = %e, "email not sent");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Pas de TLS : le flux TCP est rendu tel quel
    struct Passthrough;

    impl Upgrade for Passthrough {
        type Stream = TcpStream;

        fn upgrade(&self, tcp: TcpStream, _host: &str) -> Result<TcpStream, SmtpError> {
            Ok(tcp)
        }
    }

    /// Serveur scripté : la première réponse est la bannière, puis une réponse
    /// par commande reçue. Renvoie les commandes et le contenu de DATA.
    fn serve(replies: Vec<&'static str>) -> (u16, JoinHandle<(Vec<String>, Vec<String>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut replies = replies.into_iter();
            let mut commands = Vec::new();
            let mut data = Vec::new();
            let mut in_data = false;

            let banner = replies.next().unwrap();
            writer.write_all(format!("{}\r\n", banner).as_bytes()).unwrap();

            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = line.trim_end_matches(['\r', '\n']).to_string();

                if in_data {
                    if line == "." {
                        in_data = false;
                    } else {
                        data.push(line);
                        continue;
                    }
                } else {
                    commands.push(line);
                }

                if let Some(reply) = replies.next() {
                    in_data = reply.starts_with("354");
                    if writer.write_all(format!("{}\r\n", reply).as_bytes()).is_err() {
                        break;
                    }
                }
            }
            (commands, data)
        });

        (port, handle)
    }

    fn client(port: u16) -> SmtpClient<Passthrough> {
        let mut config = SmtpConfig::new(SecretString::from("app-password".to_string()));
        config.host = "127.0.0.1".to_string();
        config.port = port;
        config.timeout = Duration::from_millis(500);
        SmtpClient::new(config, Passthrough)
    }

    fn message() -> EmailMessage {
        EmailMessage {
            from: "alerts@example.com".to_string(),
            to: "owner@example.com".to_string(),
            subject: "Security Alert".to_string(),
            html_body: "<p>blocked</p>\n.\n<p>end</p>".to_string(),
        }
    }

    const HAPPY_PATH: [&str; 11] = [
        "220 smtp.example.com ESMTP",
        "250-smtp.example.com\r\n250-SIZE 35882577\r\n250 STARTTLS",
        "220 2.0.0 Ready to start TLS",
        "250-smtp.example.com\r\n250 AUTH LOGIN PLAIN",
        "334 VXNlcm5hbWU6",
        "334 UGFzc3dvcmQ6",
        "235 2.7.0 Accepted",
        "250 2.1.0 OK",
        "250 2.1.5 OK",
        "354 Go ahead",
        "250 2.0.0 OK queued",
    ];

    #[test]
    fn full_exchange_succeeds() {
        let (port, server) = serve(HAPPY_PATH.to_vec());
        client(port).send(&message()).unwrap();
        let (commands, data) = server.join().unwrap();

        assert_eq!(
            commands,
            vec![
                "EHLO localhost".to_string(),
                "STARTTLS".to_string(),
                "EHLO localhost".to_string(),
                "AUTH LOGIN".to_string(),
                Base64::encode_string(b"alerts@example.com"),
                Base64::encode_string(b"app-password"),
                "MAIL FROM:<alerts@example.com>".to_string(),
                "RCPT TO:<owner@example.com>".to_string(),
                "DATA".to_string(),
                "QUIT".to_string(),
            ]
        );
        assert!(data.contains(&"Subject: Security Alert".to_string()));
        assert!(data.contains(&"To: owner@example.com".to_string()));
        assert!(data.contains(&"..".to_string()));
        assert_eq!(data.last().map(String::as_str), Some("<p>end</p>"));
    }

    #[test]
    fn bad_greeting_aborts_before_ehlo() {
        let (port, server) = serve(vec!["554 go away"]);
        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(
            err,
            SmtpError::UnexpectedReply {
                phase: Phase::Connect,
                ..
            }
        ));
        let (commands, _) = server.join().unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn starttls_refusal_aborts() {
        let (port, server) = serve(vec![
            "220 hi",
            "250-hi\r\n250 HELP",
            "454 TLS not available",
        ]);
        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(
            err,
            SmtpError::UnexpectedReply {
                phase: Phase::Upgrade,
                ..
            }
        ));
        let (commands, _) = server.join().unwrap();
        assert_eq!(commands, vec!["EHLO localhost", "STARTTLS"]);
    }

    #[test]
    fn auth_failure_stops_before_envelope() {
        let mut replies = HAPPY_PATH[..6].to_vec();
        replies.push("535 5.7.8 Username and Password not accepted");
        let (port, server) = serve(replies);

        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(
            err,
            SmtpError::UnexpectedReply {
                phase: Phase::AuthPass,
                ..
            }
        ));
        let (commands, _) = server.join().unwrap();
        assert!(!commands.iter().any(|c| c.starts_with("MAIL FROM")));
    }

    #[test]
    fn rejected_sender_never_issues_rcpt() {
        let mut replies = HAPPY_PATH[..7].to_vec();
        replies.push("550 5.7.1 sender rejected");
        let (port, server) = serve(replies);

        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(
            err,
            SmtpError::UnexpectedReply {
                phase: Phase::EnvelopeFrom,
                expected: "250",
                ..
            }
        ));
        let (commands, _) = server.join().unwrap();
        assert_eq!(commands.last().map(String::as_str), Some("MAIL FROM:<alerts@example.com>"));
        assert!(!commands.iter().any(|c| c.starts_with("RCPT")));
        assert!(!commands.iter().any(|c| c == "QUIT"));
    }

    #[test]
    fn rejected_payload_fails() {
        let mut replies = HAPPY_PATH[..10].to_vec();
        replies.push("552 message too big");
        let (port, server) = serve(replies);

        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(
            err,
            SmtpError::UnexpectedReply {
                phase: Phase::Payload,
                ..
            }
        ));
        server.join().unwrap();
    }

    #[test]
    fn silent_server_times_out() {
        let (port, server) = serve(vec!["220 hi"]);
        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(err, SmtpError::Timeout { phase: Phase::Greet }));
        server.join().unwrap();
    }

    #[test]
    fn refused_connection_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = client(port).send(&message()).unwrap_err();
        assert!(matches!(err, SmtpError::Connect { .. }));
    }

    #[test]
    fn render_strips_header_injection() {
        let msg = EmailMessage {
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
            subject: "hi\r\nBcc: evil@example.com".to_string(),
            html_body: "body".to_string(),
        };
        let date = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let rendered = msg.render(date);
        assert!(rendered.starts_with("Subject: hiBcc: evil@example.com\r\n"));
        assert!(!rendered.contains("\r\nBcc:"));
        assert!(rendered.contains(&format!("Date: {}\r\n", date.to_rfc2822())));
        assert!(rendered.ends_with("\r\nbody\r\n.\r\n"));
    }
}
