// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Probes a candidate serial path, issues an identity handshake, and
//! admits it if it self-identifies as a SHA256 device. The higher-level
//! enumerator that iterates OS-provided serial candidates (and may consult
//! a hints file) is an external collaborator -- see `candidates` for a
//! minimal default.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use slog::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{self, opcode};
use crate::session::DeviceSession;
use crate::transport::{SerialTransport, Transport};

/// Opens `path` with the short probe timeout, sends the identify opcode,
/// and admits the device if the reply contains `SHA256`. On success,
/// returns a `DeviceSession` with its handle still closed -- discovery
/// never leaves a handle open; `prepare` (or `reinit`) opens the handle the
/// session will actually hash with.
pub fn probe_one(
    path: &str,
    nonce_range_opt_in: bool,
    process_hw_errors: Arc<AtomicU64>,
    logger: slog::Logger,
) -> Result<DeviceSession<SerialTransport>> {
    debug!(logger, "attempting to open"; "path" => path);

    let mut transport = SerialTransport::open_for_probe(path).map_err(|e| {
        debug!(logger, "failed to open"; "path" => path);
        e
    })?;

    transport.write_all(opcode::IDENTIFY)?;
    let line = transport.read_line()?;
    drop(transport);

    if line.is_empty() {
        debug!(logger, "error reading/timeout (ZGX)"; "path" => path);
        return Err(Error::from(ErrorKind::NotFound(path.to_string())));
    }

    let name = protocol::parse_identity(&line).ok_or_else(|| {
        debug!(logger, "didn't recognise BitForce"; "path" => path);
        Error::from(ErrorKind::NotFound(path.to_string()))
    })?;

    Ok(DeviceSession::new(
        path.to_string(),
        name,
        line,
        nonce_range_opt_in,
        process_hw_errors,
        logger,
    ))
}

/// A conservative default serial-candidate enumerator for USB-to-serial
/// adapters, grounded on the glob patterns a BFL-style serial tool uses to
/// shortlist `/dev` entries before probing them. Hosts with their own
/// device inventory (udev rules, a hints file, ...) should supply their
/// own list instead of relying on this.
pub fn default_candidates() -> Vec<String> {
    const PATTERNS: &[&str] = &[
        "/dev/ttyUSB*",
        "/dev/ttyACM*",
        "/dev/cu.usbserial*",
        "/dev/cu.usbmodem*",
        "/dev/tty.usbserial*",
    ];
    let mut out = Vec::new();
    for pattern in PATTERNS {
        if let Ok(paths) = glob::glob(pattern) {
            for entry in paths.flatten() {
                out.push(entry.display().to_string());
            }
        }
    }
    out
}
