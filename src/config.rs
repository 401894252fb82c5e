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

//! This module holds configuration for the BitForce backend until a better
//! solution (registry of sorts?) is implemented.

use std::time::Duration;

/// Baud rate used on the BFL serial link. Fixed by the hardware.
pub const BAUD_RATE: u32 = 115_200;

/// Per-byte read timeout used for normal operation.
pub const NORMAL_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Per-byte read timeout used while probing a candidate path during discovery,
/// so a non-BFL port fails fast instead of blocking the scan.
pub const INIT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Line buffer capacity for a single `read_line` call.
pub const LINE_BUF_CAP: usize = 0x100;

/// Initial first-poll delay for a full-range job.
pub const BASE_SLEEP_MS: u64 = 500;

/// Soft completion-time bound: past this, report overheat/throttle.
pub const TIMEOUT_S: u64 = 7;

/// Hard completion-time bound: past this, abandon the job outright.
pub const LONG_TIMEOUT_S: u64 = 25;
pub const LONG_TIMEOUT_MS: u64 = LONG_TIMEOUT_S * 1000;

/// Busy-poll spacing once the device has started replying.
pub const CHECK_INTERVAL_MS: u64 = 10;

/// Spacing used while waiting for work submission to be accepted, and as the
/// base for the "device isn't replying at all" backoff during polling.
pub const WORK_CHECK_INTERVAL_MS: u64 = 50;

/// Maximum per-thread stagger delay applied by `thread_init`.
pub const MAX_START_DELAY_MS: u64 = 100;

/// Divisor for the exponential moving average of completion time.
pub const TIME_AVG_CONSTANT: f64 = 8.0;

/// Width (minus one) of a nonce-range slice: one fifth of the 32-bit space.
pub const NONCE_RANGE_SIZE: u32 = 0x3333_3332;

/// Time the device is held unresponsive by an LED flash.
pub const LED_FLASH_HOLD: Duration = Duration::from_secs(4);

/// Quiesce delay observed before reopening the handle during reinit.
pub const REINIT_QUIESCE: Duration = Duration::from_secs(5);

/// Retry spacing while waiting out a `BUSY` reply during the reinit handshake.
pub const REINIT_RETRY_INTERVAL_MS: u64 = 10;

/// Maximum number of discarded lines `clear_buffer` will read before giving up.
pub const CLEAR_BUFFER_MAX_READS: usize = 10;

/// Sentinel return value billed to the work-accounting layer by a full-range job.
pub const FULL_RANGE_NONCES: u32 = 0xFFFF_FFFF;
