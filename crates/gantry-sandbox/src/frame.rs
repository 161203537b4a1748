//! Framed stdio protocol: every frame is `[stream_id: u8][payload]` over a
//! bidirectional binary channel (one WebSocket message per frame).
//!
//! `unpack(pack(id, payload)) == (id, payload)` for every frame; an empty
//! buffer is the only unpackable failure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gantry_core::error::GantryError;

/// stdout bytes, server → client.
pub const STREAM_STDOUT: u8 = 1;
/// stderr bytes, server → client.
pub const STREAM_STDERR: u8 = 2;
/// stdin bytes, client → server.
pub const STREAM_STDIN: u8 = 3;
/// stdin EOF, client → server; zero payload.
pub const STREAM_EOF: u8 = 4;
/// signal delivery, client → server; payload is the ASCII signal name.
pub const STREAM_SIGNAL: u8 = 5;
/// exit notification, server → client; payload is the i32 exit code, LE.
pub const STREAM_EXIT: u8 = 6;
/// spawn request, client → server; payload is a UTF-8 JSON object.
pub const STREAM_SPAWN: u8 = 7;

pub fn pack(stream_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(stream_id);
    frame.extend_from_slice(payload);
    frame
}

pub fn unpack(frame: &[u8]) -> Result<(u8, &[u8]), GantryError> {
    match frame.split_first() {
        Some((id, payload)) => Ok((*id, payload)),
        None => Err(GantryError::MalformedPayload("empty frame".into())),
    }
}

pub fn pack_exit(code: i32) -> Vec<u8> {
    pack(STREAM_EXIT, &code.to_le_bytes())
}

pub fn unpack_exit(payload: &[u8]) -> Result<i32, GantryError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| GantryError::MalformedPayload("exit payload must be 4 bytes".into()))?;
    Ok(i32::from_le_bytes(bytes))
}

// ── Signals ──────────────────────────────────────────────────────────────

/// The only signals deliverable over the transport.
pub const ALLOWED_SIGNALS: [&str; 4] = ["SIGINT", "SIGTERM", "SIGKILL", "SIGHUP"];

pub fn signal_number(name: &str) -> Option<i32> {
    match name {
        "SIGINT" => Some(libc::SIGINT),
        "SIGTERM" => Some(libc::SIGTERM),
        "SIGKILL" => Some(libc::SIGKILL),
        "SIGHUP" => Some(libc::SIGHUP),
        _ => None,
    }
}

/// Exit code reported when a child dies to `signal`: `128 + signo`
/// (SIGINT → 130, SIGTERM → 143, SIGKILL → 137, SIGHUP → 129).
pub fn signal_exit_code(signo: i32) -> i32 {
    128 + signo
}

// ── Spawn request ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
}

impl SpawnRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, GantryError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| GantryError::MalformedPayload("spawn request is not UTF-8".into()))?;
        let req: Self = serde_json::from_str(text)
            .map_err(|e| GantryError::MalformedPayload(format!("spawn request: {e}")))?;
        if req.cmd.trim().is_empty() {
            return Err(GantryError::MalformedPayload("spawn request: empty cmd".into()));
        }
        Ok(req)
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let json = serde_json::to_vec(self).unwrap_or_default();
        pack(STREAM_SPAWN, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_inverse() {
        for (id, payload) in [
            (STREAM_STDOUT, b"hello".as_slice()),
            (STREAM_EOF, b"".as_slice()),
            (STREAM_SIGNAL, b"SIGTERM".as_slice()),
            (0xff, &[0u8, 1, 2, 255][..]),
        ] {
            let frame = pack(id, payload);
            let (got_id, got_payload) = unpack(&frame).unwrap();
            assert_eq!(got_id, id);
            assert_eq!(got_payload, payload);
        }
    }

    #[test]
    fn empty_frame_is_malformed() {
        assert!(unpack(&[]).is_err());
    }

    #[test]
    fn exit_codes_round_trip_little_endian() {
        let frame = pack_exit(-9);
        let (id, payload) = unpack(&frame).unwrap();
        assert_eq!(id, STREAM_EXIT);
        assert_eq!(payload, (-9i32).to_le_bytes());
        assert_eq!(unpack_exit(payload).unwrap(), -9);
        assert!(unpack_exit(b"abc").is_err());
    }

    #[test]
    fn signal_set_and_exit_mapping() {
        assert_eq!(signal_number("SIGINT").map(signal_exit_code), Some(130));
        assert_eq!(signal_number("SIGTERM").map(signal_exit_code), Some(143));
        assert_eq!(signal_number("SIGKILL").map(signal_exit_code), Some(137));
        assert_eq!(signal_number("SIGHUP").map(signal_exit_code), Some(129));
        assert_eq!(signal_number("SIGUSR1"), None);
        assert_eq!(signal_number("sigterm"), None);
    }

    #[test]
    fn spawn_request_parsing() {
        let req = SpawnRequest::parse(br#"{"cmd":"cat","args":["-"]}"#).unwrap();
        assert_eq!(req.cmd, "cat");
        assert_eq!(req.args, vec!["-"]);
        assert!(req.env.is_empty());

        assert!(SpawnRequest::parse(b"not json").is_err());
        assert!(SpawnRequest::parse(br#"{"cmd":""}"#).is_err());
        assert!(SpawnRequest::parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn spawn_request_frame_round_trip() {
        let req = SpawnRequest {
            cmd: "echo".into(),
            args: vec!["hi".into()],
            ..Default::default()
        };
        let frame = req.to_frame();
        let (id, payload) = unpack(&frame).unwrap();
        assert_eq!(id, STREAM_SPAWN);
        let back = SpawnRequest::parse(payload).unwrap();
        assert_eq!(back.cmd, "echo");
    }
}
