use err_derive::Error;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use validator::Validate;
use validator_derive::Validate;

lazy_static! {
    // international-format account number, digits only
    static ref RE_MSISDN: Regex = Regex::new(r"^\d{6,15}$").unwrap();
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(display = "Could not read configuration file")]
    IoError(#[error(source)] std::io::Error),

    #[error(display = "Configuration syntax error")]
    ParseError(#[error(source)] toml::de::Error),

    #[error(display = "Invalid configuration")]
    ValidationError(#[error(source)] validator::ValidationErrors),
}

/// Account and connection settings.  Everything except the credentials has a
/// protocol-standard default.
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Config {
    /// Account number in international format, digits only.
    #[validate(regex(
        path = "RE_MSISDN",
        message = "msisdn must be digits in international format",
        code = "msisdn"
    ))]
    pub msisdn: String,

    /// Base64-encoded account secret, as issued at registration.
    #[validate(length(min = 1, message = "password must not be empty", code = "password"))]
    pub password: String,

    /// Display name sent along with outgoing messages.
    #[serde(default)]
    pub username: String,

    /// Reconnect immediately after a clean end of stream.
    #[serde(default)]
    pub reconnect: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Domain appended to bare destination numbers.
    #[serde(default = "default_server")]
    pub server: String,

    /// Domain appended to destinations carrying the group marker.
    #[serde(rename = "gserver", default = "default_group_server")]
    pub group_server: String,

    #[serde(default = "default_device_type")]
    pub device_type: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Where the last success payload is persisted for fast-path logins.
    #[serde(default = "default_challenge_file")]
    pub challenge_file: PathBuf,

    /// Verify inbound frame integrity tags.  The reference peers never do;
    /// turning this on makes a bad tag fatal.
    #[serde(default)]
    pub strict_integrity: bool,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Config::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Config> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_host() -> String {
    "bin-short.whatsapp.net".to_string()
}

fn default_port() -> u16 {
    5222
}

fn default_server() -> String {
    "s.whatsapp.net".to_string()
}

fn default_group_server() -> String {
    "g.us".to_string()
}

fn default_device_type() -> String {
    "android".to_string()
}

fn default_app_version() -> String {
    "1.5".to_string()
}

fn default_challenge_file() -> PathBuf {
    PathBuf::from(".challenge")
}

#[test]
fn test_minimal_config_gets_defaults() {
    let config = Config::from_str(
        r#"
        msisdn = "15551230000"
        password = "c2VjcmV0"
        "#,
    )
    .unwrap();

    assert_eq!(config.host, "bin-short.whatsapp.net");
    assert_eq!(config.port, 5222);
    assert_eq!(config.server, "s.whatsapp.net");
    assert_eq!(config.group_server, "g.us");
    assert_eq!(config.challenge_file, PathBuf::from(".challenge"));
    assert!(!config.reconnect);
    assert!(!config.strict_integrity);
}

#[test]
fn test_overrides() {
    let config = Config::from_str(
        r#"
        msisdn = "15551230000"
        password = "c2VjcmV0"
        username = "Tester"
        reconnect = true
        host = "127.0.0.1"
        port = 8443
        gserver = "groups.example.net"
        strict_integrity = true
        "#,
    )
    .unwrap();

    assert_eq!(config.port, 8443);
    assert_eq!(config.group_server, "groups.example.net");
    assert!(config.reconnect);
    assert!(config.strict_integrity);
}

#[test]
fn test_bad_msisdn_rejected() {
    let result = Config::from_str(
        r#"
        msisdn = "+1 555 123 0000"
        password = "c2VjcmV0"
        "#,
    );
    assert!(matches!(result, Err(Error::ValidationError(_))));
}

#[test]
fn test_empty_password_rejected() {
    let result = Config::from_str(
        r#"
        msisdn = "15551230000"
        password = ""
        "#,
    );
    assert!(matches!(result, Err(Error::ValidationError(_))));
}

#[test]
fn test_syntax_error() {
    assert!(matches!(
        Config::from_str("msisdn = ["),
        Err(Error::ParseError(_))
    ));
}
