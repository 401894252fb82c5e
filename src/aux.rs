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

//! Temperature polling and the identification LED flash. Both are
//! best-effort: they never block hashing, and skip outright while a scan's
//! poll loop is in flight.

use slog::warn;

use crate::host::EventReporter;
use crate::protocol::{self, opcode};
use crate::session::DeviceSession;
use crate::transport::Transport;

impl<T: Transport> DeviceSession<T> {
    /// Reads the current temperature if the device is idle and the mutex is
    /// free, updating the cached value on success. Returns `None` whenever
    /// no read was attempted or the reply couldn't be parsed -- callers
    /// that want the last known value should use `temperature_c` instead.
    ///
    /// A pending LED flash preempts this call (firmware can't service both
    /// promptly), and a garbled reply is treated as a throttling symptom:
    /// it counts as a hardware error and triggers a buffer flush.
    pub fn poll_temperature(&self, events: &dyn EventReporter) -> Option<f32> {
        if self.flash_led_if_pending() {
            return None;
        }

        let mut guard = self.try_lock_state()?;
        if guard.polling {
            return None;
        }

        let handle = guard.handle.as_mut()?;
        if handle.write_all(opcode::TEMPERATURE).is_err() {
            return None;
        }
        let line = match handle.read_line() {
            Ok(line) => line,
            Err(_) => return None,
        };
        drop(guard);

        if line.is_empty() {
            self.count_hw_error();
            return None;
        }

        match protocol::parse_temperature(&line) {
            Some(temp) if temp > 0.0 => {
                self.lock_state().temperature_c = temp;
                Some(temp)
            }
            Some(_) => None,
            None => {
                warn!(self.logger, "garbled temperature reply, probably throttling"; "reply" => line);
                events.throttle(self.device_path());
                self.count_hw_error();
                self.clear_buffer();
                None
            }
        }
    }

    /// If an identification flash is pending and the mutex is free, sends
    /// `ZMX` (which draws no reply) and holds the mutex for
    /// `LED_FLASH_HOLD` -- not cancellable, since the firmware genuinely
    /// stops answering anything else for that window. Returns whether a
    /// flash was attempted, so `poll_temperature` can skip its own request
    /// this cycle rather than contend for the same window.
    fn flash_led_if_pending(&self) -> bool {
        let mut guard = match self.try_lock_state() {
            Some(guard) => guard,
            None => return false,
        };
        if guard.polling || !guard.flash_led_pending {
            return false;
        }

        let wrote = guard
            .handle
            .as_mut()
            .map(|handle| handle.write_all(opcode::FLASH_LED).is_ok())
            .unwrap_or(false);
        guard.flash_led_pending = false;
        if wrote {
            std::thread::sleep(crate::config::LED_FLASH_HOLD);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{EventReporter, NonceSink};
    use crate::test_utils::{fake_session, FakeTransport};

    struct NullHost;
    impl NonceSink for NullHost {
        fn submit_nonce(&self, _nonce: u32) {}
    }
    impl EventReporter for NullHost {
        fn comms_error(&self, _device_path: &str) {}
        fn throttle(&self, _device_path: &str) {}
        fn overheat(&self, _device_path: &str) {}
    }

    fn new_session() -> (DeviceSession<FakeTransport>, FakeTransport) {
        fake_session(true)
    }

    #[test]
    fn reads_and_caches_temperature() {
        let (session, fake) = new_session();
        fake.push_reply("TEMP:42.5");
        let host = NullHost;
        let read = session.poll_temperature(&host);
        assert_eq!(read, Some(42.5));
        assert_eq!(session.temperature_c(), 42.5);
    }

    #[test]
    fn garbled_reply_flushes_and_counts_hw_error() {
        let (session, fake) = new_session();
        fake.push_reply("???");
        for _ in 0..3 {
            fake.push_reply("junk");
        }
        let host = NullHost;
        let read = session.poll_temperature(&host);
        assert_eq!(read, None);
        assert_eq!(session.hw_errors(), 1);
    }

    #[test]
    fn skips_while_polling() {
        let (session, fake) = new_session();
        fake.push_reply("TEMP:42.5");
        session.lock_state().polling = true;
        let host = NullHost;
        assert_eq!(session.poll_temperature(&host), None);
        assert_eq!(fake.calls().len(), 0);
    }

    #[test]
    #[ignore = "holds the mutex for the real 4s LED flash window"]
    fn identify_flash_clears_pending_flag() {
        let (session, fake) = new_session();
        session.identify();
        let start = std::time::Instant::now();
        let flashed = session.flash_led_if_pending();
        assert!(flashed);
        assert!(start.elapsed() >= crate::config::LED_FLASH_HOLD);
        assert!(!session.lock_state().flash_led_pending);
        assert_eq!(
            fake.calls(),
            vec![crate::test_utils::Call::Write(opcode::FLASH_LED.to_vec())]
        );
    }
}
