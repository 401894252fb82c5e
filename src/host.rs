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

//! The small set of operations (`detect`, `prepare`, `thread_init`,
//! `scan`, `shutdown`, `reinit`, `identify`, `get_stats`, `status_line`)
//! a host scheduler invokes, plus the collaborator traits the host injects
//! (work source is represented directly by `work::Work`/`work::StaleCheck`,
//! the rest -- nonce sink, error-category reporters, hardware-error
//! counters -- are captured here).

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MAX_START_DELAY_MS;
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Where a found nonce goes. The driver never validates it -- that's the
/// host's job.
pub trait NonceSink: Send + Sync {
    fn submit_nonce(&self, nonce: u32);
}

/// Error-category reporters the host supplies so the driver can surface
/// `comms`/`throttle`/`overheat` events without owning a logging/metrics
/// stack of its own.
pub trait EventReporter: Send + Sync {
    fn comms_error(&self, device_path: &str);
    fn throttle(&self, device_path: &str);
    fn overheat(&self, device_path: &str);
}

/// A `DeviceSession` plus the process-wide hardware-error counter every
/// session shares, bundled the way a host typically constructs one counter
/// and hands it to every backend it spawns.
pub struct Backend {
    pub process_hw_errors: Arc<AtomicU64>,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            process_hw_errors: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Backend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses each new worker thread by `worker_index * MAX_START_DELAY_MS`
    /// so many devices don't issue identical bus traffic at once.
    pub fn thread_init(&self, worker_index: u64) {
        let wait = worker_index * MAX_START_DELAY_MS;
        std::thread::sleep(Duration::from_millis(wait));
    }

    pub fn process_hw_errors(&self) -> u64 {
        self.process_hw_errors
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Name/value pairs reported by `get_stats`, matching the original driver's
/// API stats fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub sleep_time_ms: u64,
    pub avg_wait_ms: u32,
}

impl<T: Transport> DeviceSession<T> {
    pub fn get_stats(&self) -> Stats {
        Stats {
            sleep_time_ms: self.sleep_ms(),
            avg_wait_ms: self.avg_wait(),
        }
    }

    /// A short human-readable status fragment, mirroring the original
    /// driver's `get_bitforce_statline_before`: temperature renders as
    /// blank padding when unknown (`<= 0`) rather than as a bogus number.
    pub fn status_line(&self) -> String {
        let temp = self.temperature_c();
        if temp > 0.0 {
            format!("{:5.1}C |", temp)
        } else {
            "      |".to_string()
        }
    }

    /// Marks this session for an identification LED flash at the next
    /// temperature-cycle slot.
    pub fn identify(&self) {
        self.lock_state().flash_led_pending = true;
    }
}
