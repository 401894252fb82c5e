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

//! Frames the fixed ASCII command set the BFL firmware understands and
//! parses the single-line replies it sends back.

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use crate::config::NONCE_RANGE_SIZE;
use crate::error::{Error, ErrorKind};

/// Three-byte ASCII opcodes understood by the firmware. They are written
/// without any terminator.
pub mod opcode {
    pub const IDENTIFY: &[u8; 3] = b"ZGX";
    pub const WORK_FULL: &[u8; 3] = b"ZDX";
    pub const WORK_RANGE: &[u8; 3] = b"ZPX";
    pub const POLL: &[u8; 3] = b"ZFX";
    pub const TEMPERATURE: &[u8; 3] = b"ZLX";
    pub const FLASH_LED: &[u8; 3] = b"ZMX";
}

/// The opcode used to submit work, chosen by the device session's current
/// capability state.
pub fn submit_opcode(nonce_range_supported: bool) -> &'static [u8; 3] {
    if nonce_range_supported {
        opcode::WORK_RANGE
    } else {
        opcode::WORK_FULL
    }
}

/// Full-range work frame: `">>>>>>>>" || midstate[32] || data[64..76] ||
/// ">>>>>>>>"`, exactly 60 bytes.
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(endian = "msb")]
pub struct WorkFrame {
    prefix: [u8; 8],
    midstate: [u8; 32],
    block_tail: [u8; 12],
    trailer: [u8; 8],
}

impl WorkFrame {
    const MARKER: [u8; 8] = *b">>>>>>>>";

    pub fn new(midstate: &[u8; 32], block_tail: &[u8; 12]) -> Self {
        Self {
            prefix: Self::MARKER,
            midstate: *midstate,
            block_tail: *block_tail,
            trailer: Self::MARKER,
        }
    }

    pub fn into_bytes(self) -> [u8; 60] {
        self.pack().expect("fixed-size frame always packs")
    }
}

/// Nonce-range work frame: the trailing marker is replaced by two
/// big-endian 32-bit bounds `[start_nonce, end_nonce]`, for 68 bytes total.
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(endian = "msb")]
pub struct RangeWorkFrame {
    prefix: [u8; 8],
    midstate: [u8; 32],
    block_tail: [u8; 12],
    start_nonce: u32,
    end_nonce: u32,
}

impl RangeWorkFrame {
    pub fn new(midstate: &[u8; 32], block_tail: &[u8; 12], start_nonce: u32) -> Self {
        Self {
            prefix: WorkFrame::MARKER,
            midstate: *midstate,
            block_tail: *block_tail,
            start_nonce,
            end_nonce: start_nonce.wrapping_add(NONCE_RANGE_SIZE),
        }
    }

    pub fn end_nonce(&self) -> u32 {
        self.end_nonce
    }

    pub fn into_bytes(self) -> [u8; 68] {
        self.pack().expect("fixed-size frame always packs")
    }
}

/// Outcome of one `ZDX`/`ZPX`/second-reply exchange during work submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitReply {
    Ok,
    Busy,
    /// Anything other than `OK`/`BUSY`; carries the raw reply text.
    Rejected(String),
    /// Read timed out (empty line).
    Timeout,
}

impl SubmitReply {
    pub fn classify(line: &str) -> Self {
        if line.is_empty() {
            SubmitReply::Timeout
        } else if starts_with_ci(line, "B") {
            SubmitReply::Busy
        } else if starts_with_ci(line, "OK") {
            SubmitReply::Ok
        } else {
            SubmitReply::Rejected(line.to_string())
        }
    }
}

/// Outcome of a single `ZFX` poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    /// Device is still working (or, if `timed_out` during this call, didn't
    /// reply at all -- the two are distinguished so the poll loop can pick
    /// the appropriate backoff per §4.5 step 4.5).
    Busy { timed_out: bool },
    NoNonce,
    Idle,
    NonceFound(Vec<u32>),
    /// Anything that doesn't start with `N`, `B`, or `I`.
    Garbled(String),
}

impl PollReply {
    pub fn classify(line: &str) -> crate::error::Result<Self> {
        if line.is_empty() {
            return Ok(PollReply::Busy { timed_out: true });
        }
        if starts_with_ci(line, "B") {
            return Ok(PollReply::Busy { timed_out: false });
        }
        if starts_with_ci(line, "I") {
            return Ok(PollReply::Idle);
        }
        if starts_with_ci(line, "N") {
            if line.len() >= 3 && &line[2..3] == "-" {
                // "NO-NONCE"
                return Ok(PollReply::NoNonce);
            }
            if starts_with_ci(line, "NONCE-FOUND") {
                let nonces = parse_nonce_list(line)?;
                return Ok(PollReply::NonceFound(nonces));
            }
            return Ok(PollReply::Garbled(line.to_string()));
        }
        Ok(PollReply::Garbled(line.to_string()))
    }

    /// True for any reply that must never be treated as terminal (§3 invariant 4).
    pub fn is_busy(&self) -> bool {
        matches!(self, PollReply::Busy { .. })
    }
}

fn parse_nonce_list(line: &str) -> crate::error::Result<Vec<u32>> {
    let rest = line
        .splitn(2, ':')
        .nth(1)
        .ok_or_else(|| Error::from(ErrorKind::Protocol(format!("malformed NONCE-FOUND: {}", line))))?;
    let rest = rest.trim_end_matches(|c| c == '\r' || c == '\n');
    let mut nonces = Vec::new();
    for hex_nonce in rest.split(',') {
        let hex_nonce = hex_nonce.trim();
        if hex_nonce.is_empty() {
            continue;
        }
        let bytes = hex::decode(hex_nonce)
            .map_err(|_| Error::from(ErrorKind::Protocol(format!("bad nonce hex: {}", hex_nonce))))?;
        if bytes.len() != 4 {
            return Err(ErrorKind::Protocol(format!("bad nonce width: {}", hex_nonce)).into());
        }
        nonces.push(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    }
    Ok(nonces)
}

/// Parsed `TEMP:<float>` reply. The primary decode is Rust's standard float
/// parser; per §4.6/§9, a result greater than 100 degrees is implausible for
/// this hardware and is re-decoded with the lenient reader instead of being
/// trusted, compensating for older firmware that appends stray bytes after
/// the numeric field.
pub fn parse_temperature(line: &str) -> Option<f32> {
    if !starts_with_ci(line, "TEMP") {
        return None;
    }
    let value = line.splitn(2, ':').nth(1)?.trim();
    match value.parse::<f32>() {
        Ok(temp) if temp > 100.0 => lenient_parse_f32(value),
        Ok(temp) => Some(temp),
        Err(_) => lenient_parse_f32(value),
    }
}

/// A more permissive numeric reader than `f32::from_str`, used to cope with
/// older firmware that sometimes appends trailing garbage to the `TEMP:`
/// reply. Reads as many valid leading float characters as it can rather
/// than rejecting the whole string.
pub fn lenient_parse_f32(text: &str) -> Option<f32> {
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_digit = false;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'+' | b'-' if i == 0 => {}
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end = i + 1;
    }
    if !seen_digit {
        return None;
    }
    text[..end].parse::<f32>().ok()
}

/// Extracts the device name from an identify reply of the form
/// `">>>ID: <name> >>>..."`, returning `None` if the reply doesn't contain
/// the literal substring `SHA256` (i.e. isn't a BFL SHA256 device).
pub fn parse_identity(line: &str) -> Option<String> {
    if !line.contains("SHA256") {
        return None;
    }
    if line.starts_with(">>>ID: ") {
        let rest = &line[7..];
        if let Some(end) = rest.find(">>>") {
            return Some(rest[..end].trim().to_string());
        }
    }
    // Recognised as a SHA256 device but didn't match the `>>>ID: ... >>>`
    // shape -- fall back to the raw line so discovery can still admit it.
    Some(line.trim().to_string())
}

fn starts_with_ci(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}
