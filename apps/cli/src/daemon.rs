//! Backend daemon mode.
//!
//! Serves a file-backed partitioning backend over stdin/stdout using the
//! signed JSON-lines protocol of [`mountmap_core::protocol`].
//!
//! ## Security Model
//!
//! 1. On startup, generates a random secret and sends it to parent via handshake
//! 2. All requests must include a valid HMAC-SHA256 signature
//! 3. Request IDs must be monotonically increasing (anti-replay)
//! 4. Uses PR_SET_PDEATHSIG to terminate when parent dies

use std::io::{self, BufRead, Write};
use std::path::Path;

use mountmap_core::protocol::{
    BackendCommand, BackendHandshake, BackendRequest, BackendResponse, generate_secret, verify_hmac,
};
use mountmap_core::{FileBackend, PartitioningBackend};
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info, warn};

/// Runs the daemon on the given state file, reading requests from stdin and
/// writing responses to stdout.
pub fn run_daemon(state: &Path) -> mountmap_core::Result<()> {
    // When parent dies, this process receives SIGTERM.
    #[cfg(target_os = "linux")]
    {
        use nix::sys::{prctl, signal::Signal};
        if let Err(e) = prctl::set_pdeathsig(Signal::SIGTERM) {
            warn!(error = %e, "failed to set parent death signal");
        }
    }

    let mut backend = FileBackend::open(state)?;
    info!(state = %state.display(), "backend daemon started");

    let secret = generate_secret();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    serve(&mut backend, &secret, stdin.lock(), &mut stdout)
        .with_whatever_context(|e| format!("backend daemon I/O failed: {}", e))?;

    info!("backend daemon stopped");
    Ok(())
}

/// Sends the handshake, then answers requests until shutdown or end of input.
pub fn serve<R: BufRead, W: Write>(
    backend: &mut dyn PartitioningBackend,
    secret: &[u8],
    reader: R,
    writer: &mut W,
) -> io::Result<()> {
    let handshake = BackendHandshake {
        secret: hex::encode(secret),
    };
    write_line(writer, &handshake)?;

    // Track last request ID for anti-replay
    let mut last_id: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: BackendRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                // Can't respond without an ID
                warn!(error = %e, "failed to parse request");
                continue;
            }
        };

        if request.id <= last_id {
            let response = BackendResponse::error(
                request.id,
                format!(
                    "Replay attack detected: ID {} <= last ID {}",
                    request.id, last_id
                ),
            );
            write_line(writer, &response)?;
            continue;
        }

        let authentic = request
            .cmd
            .signing_payload()
            .is_ok_and(|payload| verify_hmac(secret, request.id, &payload, &request.hmac));
        if !authentic {
            write_line(writer, &BackendResponse::error(request.id, "HMAC authentication failed"))?;
            continue;
        }

        last_id = request.id;
        debug!(id = request.id, cmd = request.cmd.name(), "handling backend request");

        if request.cmd == BackendCommand::Shutdown {
            break;
        }

        let response = match handle(backend, request.cmd) {
            Ok(payload) => BackendResponse::success(request.id, payload),
            Err(e) => BackendResponse::error(request.id, e.to_string()),
        };
        write_line(writer, &response)?;
    }

    Ok(())
}

fn handle(
    backend: &mut dyn PartitioningBackend,
    cmd: BackendCommand,
) -> mountmap_core::Result<serde_json::Value> {
    match cmd {
        BackendCommand::SetBootloaderDrive { drive } => {
            backend.set_bootloader_drive(&drive)?;
            Ok(serde_json::Value::Null)
        }
        BackendCommand::CreatePartitioning => payload(backend.create_manual_partitioning()?),
        BackendCommand::SetRequests { target, requests } => {
            backend.set_manual_partitioning_requests(&target, &requests)?;
            Ok(serde_json::Value::Null)
        }
        BackendCommand::ResetPartitioning => {
            backend.reset_partitioning()?;
            Ok(serde_json::Value::Null)
        }
        BackendCommand::GetPartitioning { target } => payload(backend.partitioning(&target)?),
        BackendCommand::GetConstraints => payload(backend.mount_point_constraints()?),
        BackendCommand::GetDevices => payload(backend.device_data()?),
        BackendCommand::Shutdown => Ok(serde_json::Value::Null),
    }
}

fn payload(value: impl Serialize) -> mountmap_core::Result<serde_json::Value> {
    serde_json::to_value(value).with_whatever_context(|e| format!("failed to serialize payload: {}", e))
}

fn write_line<W: Write>(writer: &mut W, message: &impl Serialize) -> io::Result<()> {
    let json = serde_json::to_string(message).map_err(io::Error::other)?;
    writeln!(writer, "{}", json)?;
    writer.flush()
}
