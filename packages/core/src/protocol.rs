//! Protocol types for talking to a partitioning backend daemon.
//!
//! The daemon (`mountmap-cli backend`) owns a backend state and answers
//! JSON-lines requests on stdin/stdout.
//!
//! ## Security Model
//!
//! Requests are signed with HMAC-SHA256 so that nothing else writing to the
//! daemon's stdin can change the partitioning plan:
//! 1. Daemon generates a random 32-byte secret on startup and sends it to parent
//! 2. Each request includes an HMAC signature: `HMAC-SHA256(secret, id || cmd_json)`
//! 3. Daemon verifies signature and rejects requests with invalid signatures
//! 4. Request IDs must be monotonically increasing to prevent replay attacks
//!
//! Responses echo the request id. A client discards responses whose id is
//! older than the request it is waiting for.

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::backend::PartitioningTarget;
use crate::error::{Error, Result};
use crate::request::Request;

type HmacSha256 = Hmac<Sha256>;

/// Secret length in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Generates a random secret for HMAC signing.
pub fn generate_secret() -> [u8; SECRET_LENGTH] {
    let mut rng = rand::rng();
    let mut secret = [0u8; SECRET_LENGTH];
    rng.fill(&mut secret);
    secret
}

/// Computes HMAC-SHA256 signature for a request.
pub fn compute_hmac(secret: &[u8], id: u64, payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| Error::SessionCommunication {
        message: format!("invalid HMAC key: {}", e),
    })?;
    mac.update(&id.to_le_bytes());
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies HMAC-SHA256 signature for a request.
pub fn verify_hmac(secret: &[u8], id: u64, payload: &str, signature: &str) -> bool {
    compute_hmac(secret, id, payload).is_ok_and(|expected| constant_time_eq(&expected, signature))
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Initial handshake message sent by daemon to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHandshake {
    /// Hex-encoded secret for HMAC signing.
    pub secret: String,
}

/// Request sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Request ID (must be monotonically increasing).
    pub id: u64,
    /// HMAC-SHA256 signature of (id || cmd_json).
    pub hmac: String,
    #[serde(flatten)]
    pub cmd: BackendCommand,
}

impl BackendRequest {
    /// Builds a signed request.
    pub fn signed(secret: &[u8], id: u64, cmd: BackendCommand) -> Result<Self> {
        let hmac = compute_hmac(secret, id, &cmd.signing_payload()?)?;
        Ok(Self { id, hmac, cmd })
    }
}

/// Commands understood by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum BackendCommand {
    /// Set (or clear, when empty) the bootloader drive.
    SetBootloaderDrive { drive: String },
    /// Create a new manual partitioning plan.
    CreatePartitioning,
    /// Replace the requests of a plan.
    SetRequests {
        target: PartitioningTarget,
        requests: Vec<Request>,
    },
    /// Reset the applied partitioning.
    ResetPartitioning,
    /// Read a plan.
    GetPartitioning { target: PartitioningTarget },
    /// Read the mount point constraints.
    GetConstraints,
    /// Read the device snapshot.
    GetDevices,
    /// Shutdown the daemon.
    Shutdown,
}

impl BackendCommand {
    /// Canonical JSON of the command, the part covered by the signature.
    pub fn signing_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SessionCommunication {
            message: format!("failed to serialize command: {}", e),
        })
    }

    /// Name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetBootloaderDrive { .. } => "set_bootloader_drive",
            Self::CreatePartitioning => "create_partitioning",
            Self::SetRequests { .. } => "set_requests",
            Self::ResetPartitioning => "reset_partitioning",
            Self::GetPartitioning { .. } => "get_partitioning",
            Self::GetConstraints => "get_constraints",
            Self::GetDevices => "get_devices",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    /// Request ID this response corresponds to.
    pub id: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message if success is false.
    #[serde(default)]
    pub error: Option<String>,
    /// Command result, `null` for commands without one.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BackendResponse {
    pub fn success(id: u64, payload: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            error: None,
            payload,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(message.into()),
            payload: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sign_and_verify() {
        let secret = generate_secret();
        let id = 1u64;
        let payload = r#"{"cmd":"get_devices"}"#;

        let signature = compute_hmac(&secret, id, payload).unwrap();
        assert!(verify_hmac(&secret, id, payload, &signature));

        // Wrong secret should fail
        let wrong_secret = generate_secret();
        assert!(!verify_hmac(&wrong_secret, id, payload, &signature));

        // Wrong id should fail
        assert!(!verify_hmac(&secret, 2, payload, &signature));

        // Wrong payload should fail
        assert!(!verify_hmac(&secret, id, "wrong", &signature));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn test_request_wire_format() {
        let secret = generate_secret();
        let cmd = BackendCommand::SetRequests {
            target: PartitioningTarget::from("/partitioning/1"),
            requests: vec![Request::new("/", "sda1").with_reformat(true)],
        };
        let request = BackendRequest::signed(&secret, 7, cmd.clone()).unwrap();

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["cmd"], "set_requests");
        assert_eq!(json["target"], "/partitioning/1");
        assert_eq!(json["requests"][0]["mount-point"], "/");

        let parsed: BackendRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.cmd, cmd);
        assert!(verify_hmac(
            &secret,
            parsed.id,
            &parsed.cmd.signing_payload().unwrap(),
            &parsed.hmac
        ));
    }

    #[test]
    fn test_response_defaults() {
        let response: BackendResponse = serde_json::from_str(r#"{"id":3,"success":true}"#).unwrap();
        assert_eq!(response.error, None);
        assert!(response.payload.is_null());
        assert_eq!(BackendCommand::GetConstraints.name(), "get_constraints");
    }
}
