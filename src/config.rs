use std::path::Path;

use anyhow::{Context, Result};
use secrecy::SecretString;

/// Identifiants lus dans le fichier `.env`
#[derive(Default)]
pub struct Credentials {
    pub settings_user: Option<String>,
    pub settings_pass: Option<SecretString>,
    pub email_from: Option<String>,
    pub email_to: Option<String>,
    pub email_app_password: Option<SecretString>,
}

impl Credentials {
    /// Fichier absent : aucun identifiant, donc aucune authentification
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials: {:?}", path))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut creds = Self::default();
        for line in content.lines() {
            let line = line.trim_end_matches('\r');
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "SETTINGS_USER" => creds.settings_user = bare(value),
                "SETTINGS_PASS" => creds.settings_pass = bare(value).map(SecretString::from),
                "EMAIL_FROM" => creds.email_from = quoted(value),
                "EMAIL_TO" => creds.email_to = quoted(value),
                "EMAIL_APP_PASSWORD" => {
                    creds.email_app_password = quoted(value).map(SecretString::from)
                }
                _ => {}
            }
        }
        creds
    }

    /// Mot de passe attendu, si l'authentification est configurée
    pub fn expected_secret(&self) -> Option<SecretString> {
        match (&self.settings_user, &self.settings_pass) {
            (Some(_), Some(pass)) => Some(pass.clone()),
            _ => None,
        }
    }

    /// Expéditeur et destinataire, si les alertes peuvent partir
    pub fn mail_route(&self) -> Option<(&str, &str)> {
        match (&self.email_from, &self.email_to) {
            (Some(from), Some(to)) => Some((from.as_str(), to.as_str())),
            _ => None,
        }
    }
}

fn bare(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Seules les valeurs entre guillemets doubles sont retenues
fn quoted(value: &str) -> Option<String> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    let inner = inner.trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = "SETTINGS_USER=admin\r\nSETTINGS_PASS= s3cret \nEMAIL_FROM=\"alerts@example.com\"\r\nEMAIL_TO=\"me@example.com\"\nEMAIL_APP_PASSWORD=\"abcd efgh\"\nOTHER=1\n";

    #[test]
    fn parses_all_keys() {
        let creds = Credentials::parse(SAMPLE);
        assert_eq!(creds.settings_user.as_deref(), Some("admin"));
        assert_eq!(creds.expected_secret().unwrap().expose_secret(), "s3cret");
        assert_eq!(creds.mail_route(), Some(("alerts@example.com", "me@example.com")));
        assert_eq!(
            creds.email_app_password.as_ref().unwrap().expose_secret(),
            "abcd efgh"
        );
    }

    #[test]
    fn password_without_user_disables_auth() {
        let creds = Credentials::parse("SETTINGS_PASS=s3cret\n");
        assert!(creds.expected_secret().is_none());
    }

    #[test]
    fn unquoted_email_is_ignored() {
        let creds = Credentials::parse("EMAIL_FROM=alerts@example.com\nEMAIL_TO=\"me@example.com\"\n");
        assert!(creds.email_from.is_none());
        assert!(creds.mail_route().is_none());
    }

    #[test]
    fn missing_file_means_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::load(&dir.path().join(".env")).unwrap();
        assert!(creds.expected_secret().is_none());
        assert!(creds.mail_route().is_none());
    }
}
