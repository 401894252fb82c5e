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

//! Per-device state: the serial handle, the mutex guarding it, tuning
//! counters, capability flags, health metrics, and identity strings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use slog::{o, warn};

use crate::config::BASE_SLEEP_MS;
use crate::protocol::{self, opcode};
use crate::transport::{SerialTransport, Transport};

/// Everything a single mutex acquisition ever needs to touch. Guarded as a
/// unit per the "every read/write on `handle` occurs while `mutex` is held"
/// invariant -- the capability flag, tuning counters and identity strings
/// live here too since only code already holding the lock ever mutates
/// them.
pub(crate) struct State<T: Transport> {
    pub(crate) handle: Option<T>,
    pub(crate) name: String,
    pub(crate) identity: String,
    pub(crate) nonce_range_supported: bool,
    pub(crate) sleep_ms: u64,
    pub(crate) wait_ms: u64,
    pub(crate) avg_wait_f: f64,
    pub(crate) avg_wait_d: u32,
    pub(crate) work_start: Option<Instant>,
    pub(crate) temperature_c: f32,
    pub(crate) nonces_claimed: u32,
    pub(crate) polling: bool,
    pub(crate) flash_led_pending: bool,
}

impl<T: Transport> State<T> {
    fn new(name: String, identity: String, nonce_range_supported: bool) -> Self {
        let sleep_ms = if nonce_range_supported {
            BASE_SLEEP_MS
        } else {
            BASE_SLEEP_MS * 5
        };
        Self {
            handle: None,
            name,
            identity,
            nonce_range_supported,
            sleep_ms,
            wait_ms: 0,
            avg_wait_f: 0.0,
            avg_wait_d: 0,
            work_start: None,
            temperature_c: 0.0,
            nonces_claimed: 0,
            polling: false,
            flash_led_pending: false,
        }
    }
}

/// One instance per discovered BFL device. Cheap to clone-share via `Arc`
/// -- the host's worker thread and any stats/temperature/identify/reinit
/// callers all hold a reference to the same session.
pub struct DeviceSession<T: Transport = SerialTransport> {
    pub(crate) device_path: String,
    pub(crate) state: Mutex<State<T>>,
    /// How to open a fresh handle to this device, recorded the first time
    /// `prepare_with` is called so comms-error recovery can reopen in place
    /// without the host having to `prepare`/`reinit` again.
    opener: Mutex<Option<Box<dyn Fn() -> crate::error::Result<T> + Send>>>,
    /// Per-device hardware error count. Deliberately outside the mutex --
    /// like the original driver's API stats, reading it is not worth
    /// contending with hashing for.
    hw_errors: AtomicU64,
    /// Process-wide counter shared across every session, injected by the
    /// host rather than modeled as ambient global state.
    process_hw_errors: Arc<AtomicU64>,
    pub(crate) logger: slog::Logger,
}

impl<T: Transport> DeviceSession<T> {
    pub(crate) fn new(
        device_path: String,
        name: String,
        identity: String,
        nonce_range_supported: bool,
        process_hw_errors: Arc<AtomicU64>,
        logger: slog::Logger,
    ) -> Self {
        let logger = logger.new(o!("device" => device_path.clone()));
        Self {
            state: Mutex::new(State::new(name, identity, nonce_range_supported)),
            device_path,
            opener: Mutex::new(None),
            hw_errors: AtomicU64::new(0),
            process_hw_errors,
            logger,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn sleep_ms(&self) -> u64 {
        self.state.lock().unwrap().sleep_ms
    }

    pub fn avg_wait(&self) -> u32 {
        self.state.lock().unwrap().avg_wait_d
    }

    pub fn temperature_c(&self) -> f32 {
        self.state.lock().unwrap().temperature_c
    }

    pub fn nonce_range_supported(&self) -> bool {
        self.state.lock().unwrap().nonce_range_supported
    }

    pub fn hw_errors(&self) -> u64 {
        self.hw_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn count_hw_error(&self) {
        self.hw_errors.fetch_add(1, Ordering::Relaxed);
        self.process_hw_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Demotes range-mode support. Sticky: once demoted, a session never
    /// re-enables it for its lifetime (§8 property 3) because nothing ever
    /// flips `nonce_range_supported` back to `true` after construction.
    pub(crate) fn demote_range_support(&self, guard: &mut MutexGuard<State<T>>) {
        if guard.nonce_range_supported {
            warn!(self.logger, "disabling nonce range support");
            guard.nonce_range_supported = false;
            guard.sleep_ms = (guard.sleep_ms * 5).min(crate::config::LONG_TIMEOUT_MS);
        }
    }

    /// Opens the handle for the first time after discovery. Per §4.4,
    /// reopens with the normal read timeout and records the open
    /// timestamp implicitly via the session's lifecycle (the original
    /// driver's `status = LIFE_INIT2` bookkeeping belongs to the host
    /// scheduler, not this crate). `open` is also retained so a later
    /// comms-error recovery can reopen the same way without the host
    /// calling `prepare`/`reinit` again.
    pub(crate) fn prepare_with(
        &self,
        open: impl Fn() -> crate::error::Result<T> + Send + 'static,
    ) -> crate::error::Result<()> {
        let handle = open()?;
        self.state.lock().unwrap().handle = Some(handle);
        *self.opener.lock().unwrap() = Some(Box::new(open));
        Ok(())
    }

    /// Re-opens the handle using the opener recorded by `prepare_with`,
    /// without touching any other session state. Used by the Scan Engine's
    /// comms-failure recovery path (§4.5/§7: close, reopen, flush, return 0
    /// -- only a failed reopen itself surfaces as `-1`).
    pub(crate) fn reopen(&self) -> crate::error::Result<()> {
        let opener_guard = self.opener.lock().unwrap();
        let opener = opener_guard.as_ref().ok_or_else(|| {
            crate::error::Error::from(crate::error::ErrorKind::Io(
                "no opener recorded for this session".to_string(),
            ))
        })?;
        let handle = opener()?;
        drop(opener_guard);
        self.state.lock().unwrap().handle = Some(handle);
        Ok(())
    }

    /// Closes the handle and clears it. Idempotent.
    pub fn shutdown(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.handle = None;
    }

    /// Reads up to `CLEAR_BUFFER_MAX_READS` lines, discarding them, until a
    /// timeout (empty line) is observed. Used after a garbled response to
    /// resynchronize with the device. Must be called with the mutex held.
    pub(crate) fn clear_buffer_locked(&self, guard: &mut MutexGuard<State<T>>) {
        let handle = match guard.handle.as_mut() {
            Some(handle) => handle,
            None => return,
        };
        for _ in 0..crate::config::CLEAR_BUFFER_MAX_READS {
            match handle.read_line() {
                Ok(line) if line.is_empty() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    pub fn clear_buffer(&self) {
        let mut guard = self.state.lock().unwrap();
        self.clear_buffer_locked(&mut guard);
    }

    /// Acquires the mutex if it isn't contended, for the advisory aux-op
    /// path. Returns `None` on contention rather than blocking -- hashing
    /// never waits on stats (§5).
    pub(crate) fn try_lock_state(&self) -> Option<MutexGuard<State<T>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<State<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl DeviceSession<SerialTransport> {
    /// Re-initializes a real serial session: closes any existing handle,
    /// quiesces for 5s (not cancellable -- the device needs this window
    /// regardless of staleness), reopens, and retries the `ZGX` handshake
    /// while the device reports `BUSY`, bounded by `TIMEOUT_MS`. On
    /// success, refreshes the name and resets `sleep_ms` to `BASE_SLEEP_MS`.
    pub fn reinit(&self) -> crate::error::Result<()> {
        use crate::error::{Error, ErrorKind};

        {
            let mut guard = self.state.lock().unwrap();
            if guard.handle.is_some() {
                guard.handle = None;
                std::thread::sleep(crate::config::REINIT_QUIESCE);
            }
        }

        let mut handle = SerialTransport::open(&self.device_path)?;

        let mut retries: u64 = 0;
        let budget_ms = crate::config::TIMEOUT_S * 1000;
        let identity = loop {
            handle.write_all(opcode::IDENTIFY)?;
            let line = handle.read_line()?;
            if line.is_empty() {
                return Err(Error::from(ErrorKind::Protocol(
                    "empty reply to ZGX during reinit".to_string(),
                )));
            }
            if !line.to_ascii_uppercase().contains("BUSY") {
                break line;
            }
            retries += 1;
            if retries * crate::config::REINIT_RETRY_INTERVAL_MS >= budget_ms {
                break line;
            }
            std::thread::sleep(std::time::Duration::from_millis(
                crate::config::REINIT_RETRY_INTERVAL_MS,
            ));
        };

        let name = protocol::parse_identity(&identity).ok_or_else(|| {
            Error::from(ErrorKind::NotFound(format!(
                "didn't recognise BitForce on {} returned: {}",
                self.device_path, identity
            )))
        })?;

        let mut guard = self.state.lock().unwrap();
        guard.name = name;
        guard.identity = identity;
        guard.sleep_ms = BASE_SLEEP_MS;
        guard.handle = Some(handle);
        drop(guard);

        let path = self.device_path.clone();
        *self.opener.lock().unwrap() = Some(Box::new(move || SerialTransport::open(&path)));
        Ok(())
    }

    pub fn prepare(&self) -> crate::error::Result<()> {
        let path = self.device_path.clone();
        self.prepare_with(move || SerialTransport::open(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTransport;

    fn new_session(range: bool) -> DeviceSession<FakeTransport> {
        DeviceSession::new(
            "/dev/fake0".to_string(),
            "BitFORCE SHA256 1.0".to_string(),
            ">>>ID: BitFORCE SHA256 1.0 >>>".to_string(),
            range,
            Arc::new(AtomicU64::new(0)),
            crate::logging::root_logger(),
        )
    }

    #[test]
    fn initial_sleep_ms_depends_on_range_mode() {
        assert_eq!(new_session(true).sleep_ms(), BASE_SLEEP_MS);
        assert_eq!(new_session(false).sleep_ms(), BASE_SLEEP_MS * 5);
    }

    #[test]
    fn range_demotion_is_sticky() {
        let session = new_session(true);
        {
            let mut guard = session.lock_state();
            session.demote_range_support(&mut guard);
        }
        assert!(!session.nonce_range_supported());
        // Nothing in this crate ever flips it back on.
        assert!(!session.nonce_range_supported());
    }

    #[test]
    fn clear_buffer_reads_at_most_ten_lines() {
        let session = new_session(true);
        let fake = FakeTransport::new();
        for _ in 0..20 {
            fake.push_reply("junk");
        }
        let opener = fake.clone();
        session.prepare_with(move || Ok(opener.clone())).unwrap();
        session.clear_buffer();
        let reads = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, crate::test_utils::Call::Read(_)))
            .count();
        assert!(reads <= crate::config::CLEAR_BUFFER_MAX_READS);
    }

    #[test]
    fn try_lock_state_returns_none_when_contended() {
        let session = new_session(true);
        let _held = session.state.lock().unwrap();
        assert!(session.try_lock_state().is_none());
    }
}
