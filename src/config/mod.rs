//! Runtime configuration
//!
//! YAML configuration for the server host, module loading, logging, the
//! auth collaborator and the broker's target descriptors. Validation runs
//! at load time; a configuration that passes here never fails structurally
//! at runtime.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::error::{ServiceError, ServiceResult};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub server: Server,

    #[validate(nested)]
    #[serde(default)]
    pub runtime: Runtime,

    #[serde(default)]
    pub log: Log,

    #[validate(nested)]
    #[serde(default)]
    pub auth: Auth,

    /// Logical service name to ordered failover target list.
    #[validate(custom(function = "Config::validate_targets"))]
    #[serde(default)]
    pub targets: HashMap<String, Vec<Target>>,

    #[serde(default)]
    pub orchestration: Orchestration,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> ServiceResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).map_err(|e| {
            ServiceError::Configuration(format!("unable to read conf file from {path}: {e}"))
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> ServiceResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .map_err(|e| ServiceError::Configuration(format!("unable to parse yaml conf: {e}")))?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()
            .map_err(|e| ServiceError::Configuration(format!("conf validation failed: {e}")))?;

        Ok(conf)
    }

    fn validate_targets(targets: &HashMap<String, Vec<Target>>) -> Result<(), ValidationError> {
        for entries in targets.values() {
            for target in entries {
                target.validate_entry()?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Server {
    pub address: SocketAddr,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8700".parse().unwrap(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Runtime {
    /// Directories scanned for module bundles.
    #[validate(length(min = 1))]
    pub module_dirs: Vec<PathBuf>,

    /// Isolated bundles cannot see handlers exported by other bundles.
    #[serde(default)]
    pub isolated: bool,

    /// Abort a load pass on the first bad bundle instead of skipping it.
    #[serde(default = "Runtime::default_fail_on_error")]
    pub fail_on_error: bool,

    /// Wire encoding assumed when a request does not negotiate one.
    #[serde(default = "Runtime::default_encoding")]
    pub default_encoding: String,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            module_dirs: vec![PathBuf::from("modules")],
            isolated: false,
            fail_on_error: Self::default_fail_on_error(),
            default_encoding: Self::default_encoding(),
        }
    }
}

impl Runtime {
    fn default_fail_on_error() -> bool {
        true
    }

    fn default_encoding() -> String {
        "json".to_string()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Log {
    /// Level filter, e.g. `info` or `modserve=debug`.
    pub level: Option<String>,
    /// When set, log lines are written asynchronously to this file.
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Auth::validate_secret"))]
pub struct Auth {
    #[serde(default)]
    pub mode: AuthMode,

    /// Symmetric secret for JWT validation.
    pub secret: Option<String>,

    /// Whether the secret is base64-encoded.
    #[serde(default)]
    pub base64_secret: bool,

    /// Attribute holding the bearer token (default: `authorization`).
    #[serde(default = "Auth::default_attribute")]
    pub attribute: String,
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            mode: AuthMode::AllowAll,
            secret: None,
            base64_secret: false,
            attribute: Self::default_attribute(),
        }
    }
}

impl Auth {
    fn default_attribute() -> String {
        "authorization".to_string()
    }

    fn validate_secret(&self) -> Result<(), ValidationError> {
        if self.mode == AuthMode::Jwt && self.secret.is_none() {
            return Err(ValidationError::new("jwt_secret_required"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    AllowAll,
    Jwt,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    /// Raw targets move opaque bytes; structured targets move framed wire
    /// messages.
    #[serde(default)]
    pub kind: TargetKind,

    /// Endpoint of a remote target; ignored for local ones.
    pub url: Option<String>,

    /// In-process short-circuit through the orchestration engine.
    #[serde(default)]
    pub local: bool,

    /// Evaluate the auth collaborator before dispatching to this target.
    #[serde(default)]
    pub auth: bool,

    /// Connection timeout in seconds.
    pub connect_timeout: Option<u64>,

    /// Read timeout in seconds; a caller-supplied `read-timeout` parameter
    /// overrides it per request.
    pub read_timeout: Option<u64>,
}

impl Target {
    fn validate_entry(&self) -> Result<(), ValidationError> {
        if !self.local && self.url.is_none() {
            return Err(ValidationError::new("remote_target_url_required"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Raw,
    #[default]
    Structured,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Orchestration {
    /// Abort composed batches on the first fault instead of dispatching
    /// the remaining sub-requests.
    #[serde(default)]
    pub abort_composed_on_fault: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONF: &str = r#"
server:
  address: "127.0.0.1:9700"
runtime:
  module_dirs: ["bundles"]
  isolated: true
  fail_on_error: false
log:
  level: "debug"
auth:
  mode: jwt
  secret: "s3cret"
targets:
  billing:
    - kind: structured
      url: "http://127.0.0.1:9800/wire"
      auth: true
      connect_timeout: 2
      read_timeout: 10
    - local: true
orchestration:
  abort_composed_on_fault: true
"#;

    #[test]
    fn parses_a_full_config() {
        let conf = Config::from_yaml(FULL_CONF).unwrap();
        assert_eq!(conf.server.address.port(), 9700);
        assert!(conf.runtime.isolated);
        assert!(!conf.runtime.fail_on_error);
        assert_eq!(conf.auth.mode, AuthMode::Jwt);
        let billing = &conf.targets["billing"];
        assert_eq!(billing.len(), 2);
        assert_eq!(billing[0].kind, TargetKind::Structured);
        assert!(billing[1].local);
        assert!(conf.orchestration.abort_composed_on_fault);
    }

    #[test]
    fn defaults_fill_in() {
        let conf = Config::from_yaml("runtime:\n  module_dirs: [\"m\"]\n").unwrap();
        assert_eq!(conf.server.address.port(), 8700);
        assert!(conf.runtime.fail_on_error);
        assert_eq!(conf.runtime.default_encoding, "json");
        assert_eq!(conf.auth.mode, AuthMode::AllowAll);
        assert!(conf.targets.is_empty());
    }

    #[test]
    fn jwt_mode_requires_a_secret() {
        let err = Config::from_yaml("auth:\n  mode: jwt\n").unwrap_err();
        assert!(err.to_string().contains("jwt_secret_required"));
    }

    #[test]
    fn remote_target_requires_url() {
        let err = Config::from_yaml("targets:\n  x:\n    - kind: raw\n").unwrap_err();
        assert!(err.to_string().contains("remote_target_url_required"));
    }
}
