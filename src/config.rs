//! Service configuration (environment + CLI) and the per-session
//! registration config carried over REST.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Working-set cap per side.
pub const MAX_CRNS_PER_SIDE: usize = 20;

// ============================================================================
// SERVICE CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    /// `ENV=production` hides the endpoint index.
    pub production: bool,
}

impl AppConfig {
    pub fn from_env(host: &str, port: u16) -> Result<Self> {
        let bind = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        let mut cors_origins = vec![
            "http://localhost:3000".to_string(),
            "http://127.0.0.1:3000".to_string(),
        ];
        if let Ok(raw) = std::env::var("CORS_ORIGINS") {
            cors_origins.extend(
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty()),
            );
        }

        let production = std::env::var("ENV")
            .map(|v| v.to_lowercase() == "production")
            .unwrap_or(false);

        Ok(AppConfig {
            bind,
            cors_origins,
            production,
        })
    }
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

/// Per-session registration parameters. Field names are the wire contract
/// with the existing front end.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub ecrn_list: Vec<String>,
    pub scrn_list: Vec<String>,
    /// Opening instant "HH:MM:SS" in the deployment zone.
    pub kayit_saati: String,
    pub max_deneme: u32,
    pub retry_aralik: f64,
    pub gecikme_buffer: f64,
    pub dry_run: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ecrn_list: Vec::new(),
            scrn_list: Vec::new(),
            kayit_saati: String::new(),
            max_deneme: 60,
            retry_aralik: 3.0,
            gecikme_buffer: 0.005,
            dry_run: false,
        }
    }
}

/// Config write request. The token is write-only: omitted or empty keeps
/// the stored one.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub token: Option<String>,
    pub ecrn_list: Vec<String>,
    #[serde(default)]
    pub scrn_list: Vec<String>,
    #[serde(default)]
    pub kayit_saati: String,
    #[serde(default = "default_max_deneme")]
    pub max_deneme: u32,
    #[serde(default = "default_retry_aralik")]
    pub retry_aralik: f64,
    #[serde(default = "default_gecikme_buffer")]
    pub gecikme_buffer: f64,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_max_deneme() -> u32 {
    60
}

fn default_retry_aralik() -> f64 {
    3.0
}

fn default_gecikme_buffer() -> f64 {
    0.005
}

fn valid_crn(crn: &str) -> bool {
    crn.len() == 5 && crn.bytes().all(|b| b.is_ascii_digit())
}

fn valid_hms_shape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 8
        && bytes[2] == b':'
        && bytes[5] == b':'
        && [0, 1, 3, 4, 6, 7]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit())
}

impl ConfigRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.ecrn_list.len() > MAX_CRNS_PER_SIDE {
            return Err(format!("at most {} CRNs to add", MAX_CRNS_PER_SIDE));
        }
        if self.scrn_list.len() > MAX_CRNS_PER_SIDE {
            return Err(format!("at most {} CRNs to drop", MAX_CRNS_PER_SIDE));
        }
        for crn in self.ecrn_list.iter().chain(self.scrn_list.iter()) {
            if !valid_crn(crn) {
                return Err(format!("invalid CRN '{}': expected 5 digits", crn));
            }
        }
        if !self.kayit_saati.is_empty() && !valid_hms_shape(&self.kayit_saati) {
            return Err(format!(
                "invalid time '{}': expected HH:MM:SS",
                self.kayit_saati
            ));
        }
        if !(1..=300).contains(&self.max_deneme) {
            return Err("max_deneme must be between 1 and 300".to_string());
        }
        if !(3.0..=10.0).contains(&self.retry_aralik) {
            return Err("retry_aralik must be between 3 and 10 seconds".to_string());
        }
        if !(0.0..=0.1).contains(&self.gecikme_buffer) {
            return Err("gecikme_buffer must be between 0 and 0.1 seconds".to_string());
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut SessionConfig) {
        config.ecrn_list = self.ecrn_list.clone();
        config.scrn_list = self.scrn_list.clone();
        config.kayit_saati = self.kayit_saati.clone();
        config.max_deneme = self.max_deneme;
        config.retry_aralik = self.retry_aralik;
        config.gecikme_buffer = self.gecikme_buffer;
        config.dry_run = self.dry_run;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigResponse {
    pub ecrn_list: Vec<String>,
    pub scrn_list: Vec<String>,
    pub kayit_saati: String,
    pub max_deneme: u32,
    pub retry_aralik: f64,
    pub gecikme_buffer: f64,
    pub token_set: bool,
    pub token_preview: String,
    pub dry_run: bool,
}

impl ConfigResponse {
    pub fn from_session(config: &SessionConfig, token_set: bool) -> Self {
        ConfigResponse {
            ecrn_list: config.ecrn_list.clone(),
            scrn_list: config.scrn_list.clone(),
            kayit_saati: config.kayit_saati.clone(),
            max_deneme: config.max_deneme,
            retry_aralik: config.retry_aralik,
            gecikme_buffer: config.gecikme_buffer,
            token_set,
            token_preview: String::new(),
            dry_run: config.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConfigRequest {
        ConfigRequest {
            token: None,
            ecrn_list: vec!["12345".to_string()],
            scrn_list: vec![],
            kayit_saati: "14:00:00".to_string(),
            max_deneme: 60,
            retry_aralik: 3.0,
            gecikme_buffer: 0.005,
            dry_run: false,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_crn_format_enforced() {
        let mut req = request();
        req.ecrn_list = vec!["1234".to_string()];
        assert!(req.validate().is_err());
        req.ecrn_list = vec!["12a45".to_string()];
        assert!(req.validate().is_err());
        req.ecrn_list = vec!["123456".to_string()];
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_side_caps_enforced() {
        let mut req = request();
        req.ecrn_list = (0..21).map(|i| format!("{:05}", i)).collect();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_time_shape_enforced() {
        let mut req = request();
        req.kayit_saati = "14:00".to_string();
        assert!(req.validate().is_err());
        req.kayit_saati = String::new();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_ranges_enforced() {
        let mut req = request();
        req.max_deneme = 0;
        assert!(req.validate().is_err());
        let mut req = request();
        req.retry_aralik = 2.0;
        assert!(req.validate().is_err());
        let mut req = request();
        req.gecikme_buffer = 0.2;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_defaults_from_minimal_json() {
        let req: ConfigRequest =
            serde_json::from_str(r#"{"ecrn_list": ["12345"]}"#).unwrap();
        assert_eq!(req.max_deneme, 60);
        assert!((req.retry_aralik - 3.0).abs() < f64::EPSILON);
        assert!(!req.dry_run);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_apply_to_session() {
        let req = request();
        let mut config = SessionConfig::default();
        req.apply_to(&mut config);
        assert_eq!(config.ecrn_list, vec!["12345".to_string()]);
        assert_eq!(config.kayit_saati, "14:00:00");
    }
}
