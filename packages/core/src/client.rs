//! Client side of the backend daemon protocol.
//!
//! [`BackendSession`] speaks the signed JSON-lines protocol over any reader
//! and writer pair. [`BackendClient`] adapts a session to the
//! [`PartitioningBackend`] port and [`ProcessBackend`] spawns the daemon as a
//! child process and talks to it over its stdio.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backend::{PartitioningBackend, PartitioningInfo, PartitioningTarget};
use crate::constraint::MountPointConstraint;
use crate::device::DeviceSnapshot;
use crate::error::{Error, IoResultExt, Result};
use crate::protocol::{BackendCommand, BackendHandshake, BackendRequest, BackendResponse};
use crate::request::Request;

fn communication(message: impl Into<String>) -> Error {
    Error::SessionCommunication {
        message: message.into(),
    }
}

/// A connected protocol session.
#[derive(Debug)]
pub struct BackendSession<R, W> {
    reader: R,
    writer: W,
    secret: Vec<u8>,
    last_id: u64,
}

impl<R: BufRead, W: Write> BackendSession<R, W> {
    /// Reads the daemon's handshake and returns a ready session.
    pub fn connect(mut reader: R, writer: W) -> Result<Self> {
        let line = read_line(&mut reader)?.ok_or_else(|| communication("backend exited before handshake"))?;
        let handshake: BackendHandshake = serde_json::from_str(&line)
            .map_err(|e| communication(format!("invalid handshake: {}", e)))?;
        let secret =
            hex::decode(&handshake.secret).map_err(|e| communication(format!("invalid handshake secret: {}", e)))?;

        Ok(Self {
            reader,
            writer,
            secret,
            last_id: 0,
        })
    }

    /// Sends a command and waits for its response payload.
    ///
    /// Responses to earlier requests still in the pipe are skipped. A failed
    /// command is returned as [`Error::BackendRejected`].
    pub fn call(&mut self, cmd: BackendCommand) -> Result<serde_json::Value> {
        let operation = cmd.name();
        let id = self.send(cmd)?;

        loop {
            let line = read_line(&mut self.reader)?
                .ok_or_else(|| communication(format!("backend closed the connection during '{}'", operation)))?;
            let response: BackendResponse = serde_json::from_str(&line)
                .map_err(|e| communication(format!("invalid response: {}", e)))?;

            if response.id < id {
                warn!(id = response.id, expected = id, "skipping stale backend response");
                continue;
            }
            if response.id > id {
                return Err(communication(format!(
                    "unexpected response id {} while waiting for {}",
                    response.id, id
                )));
            }

            if !response.success {
                return Err(Error::BackendRejected {
                    operation: operation.to_string(),
                    message: response.error.unwrap_or_else(|| "unknown error".to_string()),
                });
            }
            return Ok(response.payload);
        }
    }

    /// Like [`Self::call`], decoding the payload.
    pub fn call_as<T: DeserializeOwned>(&mut self, cmd: BackendCommand) -> Result<T> {
        let operation = cmd.name();
        let payload = self.call(cmd)?;
        serde_json::from_value(payload)
            .map_err(|e| communication(format!("invalid payload for '{}': {}", operation, e)))
    }

    /// Asks the daemon to exit. No response is expected.
    pub fn shutdown(&mut self) -> Result<()> {
        self.send(BackendCommand::Shutdown).map(|_| ())
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    fn send(&mut self, cmd: BackendCommand) -> Result<u64> {
        self.last_id += 1;
        let id = self.last_id;
        let request = BackendRequest::signed(&self.secret, id, cmd)?;
        let json = serde_json::to_string(&request)
            .map_err(|e| communication(format!("failed to serialize request: {}", e)))?;

        debug!(id, cmd = request.cmd.name(), "sending backend request");
        writeln!(self.writer, "{}", json).map_err(|e| communication(format!("failed to send request: {}", e)))?;
        self.writer
            .flush()
            .map_err(|e| communication(format!("failed to send request: {}", e)))?;
        Ok(id)
    }
}

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>> {
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| communication(format!("failed to read from backend: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(line));
        }
    }
}

/// [`PartitioningBackend`] over a protocol session.
#[derive(Debug)]
pub struct BackendClient<R, W> {
    session: RefCell<BackendSession<R, W>>,
}

impl<R: BufRead, W: Write> BackendClient<R, W> {
    pub fn new(session: BackendSession<R, W>) -> Self {
        Self {
            session: RefCell::new(session),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.session.borrow_mut().shutdown()
    }

    pub fn into_session(self) -> BackendSession<R, W> {
        self.session.into_inner()
    }

    fn call(&self, cmd: BackendCommand) -> Result<()> {
        self.session.borrow_mut().call(cmd).map(|_| ())
    }

    fn call_as<T: DeserializeOwned>(&self, cmd: BackendCommand) -> Result<T> {
        self.session.borrow_mut().call_as(cmd)
    }
}

impl<R: BufRead, W: Write> PartitioningBackend for BackendClient<R, W> {
    fn set_bootloader_drive(&mut self, drive: &str) -> Result<()> {
        self.call(BackendCommand::SetBootloaderDrive {
            drive: drive.to_string(),
        })
    }

    fn create_manual_partitioning(&mut self) -> Result<PartitioningTarget> {
        self.call_as(BackendCommand::CreatePartitioning)
    }

    fn set_manual_partitioning_requests(
        &mut self,
        target: &PartitioningTarget,
        requests: &[Request],
    ) -> Result<()> {
        self.call(BackendCommand::SetRequests {
            target: target.clone(),
            requests: requests.to_vec(),
        })
    }

    fn reset_partitioning(&mut self) -> Result<()> {
        self.call(BackendCommand::ResetPartitioning)
    }

    fn partitioning(&self, target: &PartitioningTarget) -> Result<PartitioningInfo> {
        self.call_as(BackendCommand::GetPartitioning {
            target: target.clone(),
        })
    }

    fn mount_point_constraints(&self) -> Result<Vec<MountPointConstraint>> {
        self.call_as(BackendCommand::GetConstraints)
    }

    fn device_data(&self) -> Result<DeviceSnapshot> {
        self.call_as(BackendCommand::GetDevices)
    }
}

/// Backend daemon running as a child process.
///
/// The child is started as `<program> backend --state <state>`.
#[derive(Debug)]
pub struct ProcessBackend {
    child: Child,
    client: BackendClient<BufReader<ChildStdout>, ChildStdin>,
}

impl ProcessBackend {
    pub fn spawn(program: &Path, state: &Path) -> Result<Self> {
        let command = format!("{} backend", program.display());
        let mut child = Command::new(program)
            .arg("backend")
            .arg("--state")
            .arg(state)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .command_context(&command)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(communication("backend stdio is not piped"));
        };

        let session = BackendSession::connect(BufReader::new(stdout), stdin)?;
        debug!(pid = child.id(), "connected to backend daemon");
        Ok(Self {
            child,
            client: BackendClient::new(session),
        })
    }

    /// Stops the daemon and waits for it to exit.
    pub fn shutdown(&mut self) -> Result<()> {
        self.client.shutdown()?;
        self.child.wait().command_context("backend")?;
        Ok(())
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl PartitioningBackend for ProcessBackend {
    fn set_bootloader_drive(&mut self, drive: &str) -> Result<()> {
        self.client.set_bootloader_drive(drive)
    }

    fn create_manual_partitioning(&mut self) -> Result<PartitioningTarget> {
        self.client.create_manual_partitioning()
    }

    fn set_manual_partitioning_requests(
        &mut self,
        target: &PartitioningTarget,
        requests: &[Request],
    ) -> Result<()> {
        self.client.set_manual_partitioning_requests(target, requests)
    }

    fn reset_partitioning(&mut self) -> Result<()> {
        self.client.reset_partitioning()
    }

    fn partitioning(&self, target: &PartitioningTarget) -> Result<PartitioningInfo> {
        self.client.partitioning(target)
    }

    fn mount_point_constraints(&self) -> Result<Vec<MountPointConstraint>> {
        self.client.mount_point_constraints()
    }

    fn device_data(&self) -> Result<DeviceSnapshot> {
        self.client.device_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::verify_hmac;
    use std::io::Cursor;

    const SECRET: &str = "00112233445566778899aabbccddeeff";

    fn script(responses: &[&str]) -> Cursor<Vec<u8>> {
        let mut input = format!("{{\"secret\":\"{}\"}}\n", SECRET);
        for response in responses {
            input.push_str(response);
            input.push('\n');
        }
        Cursor::new(input.into_bytes())
    }

    fn sent(writer: Vec<u8>) -> Vec<BackendRequest> {
        String::from_utf8(writer)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_requests_are_signed_with_increasing_ids() {
        let input = script(&[
            r#"{"id":1,"success":true,"payload":"/partitioning/1"}"#,
            r#"{"id":2,"success":true,"payload":null}"#,
        ]);
        let mut client = BackendClient::new(BackendSession::connect(input, Vec::new()).unwrap());

        let target = client.create_manual_partitioning().unwrap();
        assert_eq!(target, PartitioningTarget::from("/partitioning/1"));
        client
            .set_manual_partitioning_requests(&target, &[Request::new("/", "sda1")])
            .unwrap();

        let (_, writer) = client.into_session().into_inner();
        let requests = sent(writer);
        let secret = hex::decode(SECRET).unwrap();
        assert_eq!(requests.len(), 2);
        for (expected_id, request) in (1..).zip(&requests) {
            assert_eq!(request.id, expected_id);
            let payload = request.cmd.signing_payload().unwrap();
            assert!(verify_hmac(&secret, request.id, &payload, &request.hmac));
        }
    }

    #[test]
    fn test_stale_responses_are_skipped() {
        let input = script(&[
            r#"{"id":1,"success":true,"payload":[]}"#,
            r#"{"id":1,"success":true,"payload":[]}"#,
            r#"{"id":2,"success":true,"payload":{}}"#,
        ]);
        let client = BackendClient::new(BackendSession::connect(input, Vec::new()).unwrap());

        assert!(client.mount_point_constraints().unwrap().is_empty());
        assert!(client.device_data().unwrap().is_empty());
    }

    #[test]
    fn test_rejected_command() {
        let input = script(&[r#"{"id":1,"success":false,"error":"unknown partitioning target '/x'"}"#]);
        let client = BackendClient::new(BackendSession::connect(input, Vec::new()).unwrap());

        let err = client.partitioning(&PartitioningTarget::from("/x")).unwrap_err();
        match err {
            Error::BackendRejected { operation, message } => {
                assert_eq!(operation, "get_partitioning");
                assert!(message.contains("/x"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_connection_errors() {
        let err = BackendSession::connect(Cursor::new(Vec::new()), Vec::new()).unwrap_err();
        assert!(matches!(err, Error::SessionCommunication { .. }));

        let client = BackendClient::new(BackendSession::connect(script(&[]), Vec::new()).unwrap());
        assert!(matches!(
            client.device_data(),
            Err(Error::SessionCommunication { .. })
        ));

        let input = script(&[r#"{"id":5,"success":true}"#]);
        let client = BackendClient::new(BackendSession::connect(input, Vec::new()).unwrap());
        assert!(matches!(
            client.device_data(),
            Err(Error::SessionCommunication { .. })
        ));
    }
}
