use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Préférences de notification par courriel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default = "enabled")]
    pub purchase_success: bool,
    #[serde(default = "enabled")]
    pub purchase_failed: bool,
    #[serde(default = "enabled")]
    pub expiry_reminder: bool,
    #[serde(default = "enabled")]
    pub security_alerts: bool,
}

fn enabled() -> bool {
    true
}

/// Modification demandée une fois le mot de passe accepté
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsAction {
    SaveNotifications(Notifications),
    ToggleAutobuyer,
}

/// Effet d'une action appliquée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    NotificationsSaved,
    AutobuyerToggled { enabled: bool },
}

/// Document `settings.json`. Les champs inconnus sont conservés tels quels.
pub struct SettingsDocument {
    path: PathBuf,
    root: Map<String, Value>,
}

impl SettingsDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let root = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings: {:?}", path))?;
            match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            }
        } else {
            Map::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    pub fn autobuyer_enabled(&self) -> bool {
        self.root
            .get("autobuyer")
            .and_then(|a| a.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Préférences enregistrées ; tout est activé par défaut
    pub fn notifications(&self) -> Option<Notifications> {
        self.root
            .get("notifications")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn security_alerts_enabled(&self) -> bool {
        self.notifications().map_or(true, |n| n.security_alerts)
    }

    pub fn apply(&mut self, action: SettingsAction) -> Result<Applied> {
        let applied = match action {
            SettingsAction::SaveNotifications(prefs) => {
                self.root
                    .insert("notifications".to_string(), serde_json::to_value(prefs)?);
                Applied::NotificationsSaved
            }
            SettingsAction::ToggleAutobuyer => {
                let enabled = !self.autobuyer_enabled();
                let autobuyer = self
                    .root
                    .entry("autobuyer")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !autobuyer.is_object() {
                    *autobuyer = Value::Object(Map::new());
                }
                if let Value::Object(map) = autobuyer {
                    map.insert("enabled".to_string(), Value::Bool(enabled));
                }
                Applied::AutobuyerToggled { enabled }
            }
        };
        self.save()?;
        Ok(applied)
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.root)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to save settings: {:?}", self.path))
    }
}
