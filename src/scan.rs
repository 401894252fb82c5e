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

//! The per-job cycle: submit work, sleep the tuned interval, poll until a
//! terminal reply, parse nonces, adapt the sleep interval.

use std::time::{Duration, Instant};

use slog::{debug, error, warn};

use crate::config::{
    CHECK_INTERVAL_MS, FULL_RANGE_NONCES, LONG_TIMEOUT_S, TIMEOUT_S, TIME_AVG_CONSTANT,
    WORK_CHECK_INTERVAL_MS,
};
use crate::host::{EventReporter, NonceSink};
use crate::protocol::{opcode, PollReply, RangeWorkFrame, SubmitReply, WorkFrame};
use crate::session::DeviceSession;
use crate::transport::Transport;
use crate::work::{StaleCheck, Work};

/// Sleeps for `total_ms`, honoring the stale-work predicate every
/// `SLICE_MS` -- cooperative cancellation for every suspension point in
/// this module except the documented non-cancellable ones in
/// `session`/`aux`. Returns `true` if the sleep was cut short by staleness.
fn cancellable_sleep(total_ms: u64, stale: &dyn StaleCheck) -> bool {
    const SLICE_MS: u64 = 10;
    let mut remaining = total_ms;
    loop {
        if stale.is_stale() {
            return true;
        }
        if remaining == 0 {
            return false;
        }
        let step = remaining.min(SLICE_MS);
        std::thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
}

enum Submitted {
    Ok { range: Option<(u32, u32)> },
    Stale,
    CommsError,
}

enum PollOutcome {
    Terminal {
        reply: PollReply,
        elapsed: Duration,
        wait_ms: u64,
    },
    Abandoned,
    CommsError,
    Stale,
}

impl<T: Transport> DeviceSession<T> {
    /// Runs one full scan cycle for `work` and returns the nonce count to
    /// bill to statistics (`0` on any abandonment or comms failure, `-1` if
    /// the session has no open handle at all -- the host must `prepare`/
    /// `reinit` before calling `scan` again).
    pub fn scan(
        &self,
        work: &mut Work,
        stale: &dyn StaleCheck,
        sink: &dyn NonceSink,
        events: &dyn EventReporter,
    ) -> i64 {
        if self.lock_state().handle.is_none() {
            return -1;
        }

        let range = match self.submit(work, stale) {
            Submitted::Stale => return 0,
            Submitted::CommsError => return self.recover_from_comms_error(events),
            Submitted::Ok { range } => range,
        };

        let work_start = Instant::now();
        let initial_sleep_ms = self.sleep_ms();
        if cancellable_sleep(initial_sleep_ms, stale) {
            return 0;
        }

        self.lock_state().polling = true;
        let outcome = self.poll(work_start, initial_sleep_ms, stale);
        self.lock_state().polling = false;

        match outcome {
            PollOutcome::Abandoned | PollOutcome::Stale => 0,
            PollOutcome::CommsError => self.recover_from_comms_error(events),
            PollOutcome::Terminal {
                reply,
                elapsed,
                wait_ms,
            } => self.finish(reply, elapsed, wait_ms, range, sink, events),
        }
    }

    /// Step 1-3: send the start opcode and, on `OK`, the binary work frame.
    /// Retries on `BUSY`/timeout, demotes range mode on rejection.
    fn submit(&self, work: &mut Work, stale: &dyn StaleCheck) -> Submitted {
        loop {
            let mut guard = self.lock_state();
            let range_mode = guard.nonce_range_supported;
            let op = crate::protocol::submit_opcode(range_mode);

            let handle = match guard.handle.as_mut() {
                Some(handle) => handle,
                None => return Submitted::CommsError,
            };
            if handle.write_all(op).is_err() {
                return Submitted::CommsError;
            }
            let reply = match handle.read_line() {
                Ok(line) => line,
                Err(_) => return Submitted::CommsError,
            };

            match SubmitReply::classify(&reply) {
                SubmitReply::Timeout | SubmitReply::Busy => {
                    drop(guard);
                    if cancellable_sleep(WORK_CHECK_INTERVAL_MS, stale) {
                        return Submitted::Stale;
                    }
                    continue;
                }
                SubmitReply::Rejected(text) => {
                    if range_mode {
                        warn!(self.logger, "does not support nonce range, disabling"; "reply" => text);
                        self.demote_range_support(&mut guard);
                        drop(guard);
                        continue;
                    }
                    error!(self.logger, "send work reports"; "reply" => text);
                    return Submitted::CommsError;
                }
                SubmitReply::Ok => {
                    let midstate = work.midstate;
                    let tail = work.block_tail();

                    let (bytes, nonces_claimed, range): (Vec<u8>, u32, Option<(u32, u32)>) =
                        if range_mode {
                            let start = work.starting_nonce();
                            let frame = RangeWorkFrame::new(&midstate, &tail, start);
                            let end = frame.end_nonce();
                            work.set_starting_nonce(end.wrapping_add(1));
                            (
                                frame.into_bytes().to_vec(),
                                crate::config::NONCE_RANGE_SIZE,
                                Some((start, end)),
                            )
                        } else {
                            let frame = WorkFrame::new(&midstate, &tail);
                            (frame.into_bytes().to_vec(), FULL_RANGE_NONCES, None)
                        };

                    let handle = match guard.handle.as_mut() {
                        Some(handle) => handle,
                        None => return Submitted::CommsError,
                    };
                    if handle.write_all(&bytes).is_err() {
                        return Submitted::CommsError;
                    }
                    let reply2 = match handle.read_line() {
                        Ok(line) => line,
                        Err(_) => return Submitted::CommsError,
                    };
                    if !matches!(SubmitReply::classify(&reply2), SubmitReply::Ok) {
                        error!(self.logger, "send block data reports"; "reply" => reply2);
                        return Submitted::CommsError;
                    }

                    guard.nonces_claimed = nonces_claimed;
                    guard.work_start = Some(Instant::now());
                    return Submitted::Ok { range };
                }
            }
        }
    }

    /// Step 4: poll `ZFX` until a non-busy reply or a hard timeout.
    fn poll(&self, work_start: Instant, initial_sleep_ms: u64, stale: &dyn StaleCheck) -> PollOutcome {
        let mut wait_ms = initial_sleep_ms;
        loop {
            let mut guard = self.lock_state();
            let handle = match guard.handle.as_mut() {
                Some(handle) => handle,
                None => return PollOutcome::CommsError,
            };
            if handle.write_all(opcode::POLL).is_err() {
                return PollOutcome::CommsError;
            }
            let line = match handle.read_line() {
                Ok(line) => line,
                Err(_) => return PollOutcome::CommsError,
            };
            drop(guard);

            let elapsed = work_start.elapsed();
            if elapsed.as_secs() >= LONG_TIMEOUT_S {
                warn!(self.logger, "took longer than long timeout"; "elapsed_ms" => elapsed.as_millis() as u64);
                return PollOutcome::Abandoned;
            }

            let reply = match PollReply::classify(&line) {
                Ok(reply) => reply,
                Err(_) => PollReply::Garbled(line.clone()),
            };

            if !reply.is_busy() {
                return PollOutcome::Terminal {
                    reply,
                    elapsed,
                    wait_ms,
                };
            }

            let delay_ms = if line.is_empty() {
                2 * WORK_CHECK_INTERVAL_MS
            } else {
                CHECK_INTERVAL_MS
            };
            if cancellable_sleep(delay_ms, stale) {
                return PollOutcome::Stale;
            }
            wait_ms += delay_ms;
        }
    }

    /// Steps 5-7: overtime accounting, adaptive tuning, and result parsing.
    fn finish(
        &self,
        reply: PollReply,
        elapsed: Duration,
        wait_ms: u64,
        range: Option<(u32, u32)>,
        sink: &dyn NonceSink,
        events: &dyn EventReporter,
    ) -> i64 {
        let nonce_found = matches!(reply, PollReply::NonceFound(_));

        if elapsed.as_secs() > TIMEOUT_S {
            events.overheat(self.device_path());
            self.count_hw_error();
            if !nonce_found {
                return 0;
            }
            // NONCE-FOUND despite overtime: the device still gets credited
            // and its nonces submitted, but the hw-error/overheat event
            // above still fires -- see SPEC_FULL.md's open question (a).
        } else if matches!(reply, PollReply::NoNonce) || nonce_found {
            self.tune_sleep(wait_ms, elapsed);
        }

        debug!(self.logger, "result"; "wait_ms" => wait_ms, "reply" => format!("{:?}", reply));

        match reply {
            PollReply::NoNonce => self.lock_state().nonces_claimed as i64,
            PollReply::Idle => 0,
            PollReply::NonceFound(nonces) => {
                let claimed = self.lock_state().nonces_claimed;
                for nonce in nonces {
                    if let Some((start, end)) = range {
                        if nonce < start || nonce > end {
                            warn!(self.logger, "nonce out of requested range, disabling range support");
                            let mut guard = self.lock_state();
                            self.demote_range_support(&mut guard);
                        }
                    }
                    sink.submit_nonce(nonce);
                }
                claimed as i64
            }
            PollReply::Garbled(text) => {
                warn!(self.logger, "get result reports"; "reply" => text);
                self.count_hw_error();
                self.clear_buffer();
                0
            }
            PollReply::Busy { .. } => unreachable!("poll loop never breaks on a busy reply"),
        }
    }

    fn tune_sleep(&self, wait_ms: u64, elapsed: Duration) {
        let mut guard = self.lock_state();
        let sleep_ms = guard.sleep_ms;

        if wait_ms > sleep_ms + 2 * WORK_CHECK_INTERVAL_MS {
            guard.sleep_ms = (sleep_ms + (wait_ms - sleep_ms) / 2).min(crate::config::LONG_TIMEOUT_MS);
        } else if wait_ms == sleep_ms {
            if sleep_ms > WORK_CHECK_INTERVAL_MS {
                guard.sleep_ms -= WORK_CHECK_INTERVAL_MS;
            } else if sleep_ms > CHECK_INTERVAL_MS {
                guard.sleep_ms -= CHECK_INTERVAL_MS;
            }
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        guard.avg_wait_f += (elapsed_ms - guard.avg_wait_f) / TIME_AVG_CONSTANT;
        guard.avg_wait_d = (guard.avg_wait_f + 0.5) as u32;
    }

    /// Comms-loss recovery: close the handle, count and report the error,
    /// then reopen and flush the buffer in place, per §4.5/§7 and the
    /// original driver's `commerr:` path. Returns `0` so the host can
    /// reschedule the job; `-1` is reserved for a reopen that itself fails,
    /// at which point the host does need to `prepare`/`reinit`.
    fn recover_from_comms_error(&self, events: &dyn EventReporter) -> i64 {
        error!(self.logger, "comms error");
        events.comms_error(self.device_path());
        self.count_hw_error();
        self.shutdown();
        match self.reopen() {
            Ok(()) => {
                self.clear_buffer();
                0
            }
            Err(e) => {
                error!(self.logger, "failed to reopen after comms error"; "error" => e.to_string());
                -1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{EventReporter, NonceSink};
    use crate::session::DeviceSession;
    use crate::test_utils::{fake_session, FakeTransport};
    use crate::work::NeverStale;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    struct RecordingHost {
        nonces: Mutex<Vec<u32>>,
        comms: AtomicU64,
        throttle: AtomicU64,
        overheat: AtomicU64,
    }

    impl RecordingHost {
        fn new() -> Self {
            Self {
                nonces: Mutex::new(Vec::new()),
                comms: AtomicU64::new(0),
                throttle: AtomicU64::new(0),
                overheat: AtomicU64::new(0),
            }
        }
    }

    impl NonceSink for RecordingHost {
        fn submit_nonce(&self, nonce: u32) {
            self.nonces.lock().unwrap().push(nonce);
        }
    }

    impl EventReporter for RecordingHost {
        fn comms_error(&self, _device_path: &str) {
            self.comms.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        fn throttle(&self, _device_path: &str) {
            self.throttle.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        fn overheat(&self, _device_path: &str) {
            self.overheat.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn new_session(range: bool) -> (DeviceSession<FakeTransport>, FakeTransport) {
        fake_session(range)
    }

    fn sample_work() -> Work {
        Work::new([0x11u8; 32], [0x22u8; 128])
    }

    #[test]
    fn full_range_no_nonce_decreases_sleep_when_exact() {
        let (session, fake) = new_session(false);
        fake.push_reply("OK"); // ZDX
        fake.push_reply("OK"); // frame
        fake.push_reply("NO-NONCE");
        let host = RecordingHost::new();
        let before = session.sleep_ms();
        let result = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result, FULL_RANGE_NONCES as i64);
        assert!(host.nonces.lock().unwrap().is_empty());
        // wait_ms ends up equal to sleep_ms (the fake's first poll reply is
        // visible immediately), so sleep_ms tightens by one notch.
        assert!(session.sleep_ms() <= before);
    }

    #[test]
    fn nonce_found_with_two_nonces_decodes_big_endian() {
        let (session, fake) = new_session(false);
        fake.push_reply("OK");
        fake.push_reply("OK");
        fake.push_reply("NONCE-FOUND:12345678,9ABCDEF0");
        let host = RecordingHost::new();
        let result = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result, FULL_RANGE_NONCES as i64);
        assert_eq!(*host.nonces.lock().unwrap(), vec![0x1234_5678, 0x9ABC_DEF0]);
    }

    #[test]
    fn range_unsupported_demotes_and_retries_as_full_range() {
        let (session, fake) = new_session(true);
        fake.push_reply("ERR:UNKNOWN"); // ZPX rejected
        fake.push_reply("OK"); // retried ZDX
        fake.push_reply("OK"); // frame
        fake.push_reply("NO-NONCE");
        let host = RecordingHost::new();
        let result = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result, FULL_RANGE_NONCES as i64);
        assert!(!session.nonce_range_supported());

        // A subsequent scan must not re-request range mode.
        fake.push_reply("OK");
        fake.push_reply("OK");
        fake.push_reply("NO-NONCE");
        session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert!(!session.nonce_range_supported());
    }

    #[test]
    fn comms_failure_on_submit_reopens_handle_and_counts_error() {
        let (session, fake) = new_session(false);
        fake.push_reply("OK");
        fake.push_reply("ERR:SOMETHING");
        let host = RecordingHost::new();
        let result = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result, 0);
        assert_eq!(session.hw_errors(), 1);
        assert_eq!(host.comms.load(std::sync::atomic::Ordering::Relaxed), 1);

        // The handle was reopened in place (and its buffer flushed), so the
        // next scan call proceeds normally instead of reporting -1.
        fake.push_reply("OK");
        fake.push_reply("OK");
        fake.push_reply("NO-NONCE");
        let result2 = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result2, FULL_RANGE_NONCES as i64);
    }

    #[test]
    fn stale_work_short_circuits_with_no_further_writes() {
        let (session, fake) = new_session(false);
        struct AlwaysStale;
        impl StaleCheck for AlwaysStale {
            fn is_stale(&self) -> bool {
                true
            }
        }
        let host = RecordingHost::new();
        let result = session.scan(&mut sample_work(), &AlwaysStale, &host, &host);
        assert_eq!(result, 0);
        // Only the initial ZDX write/read pair should have happened before
        // the stale check aborted the retry loop (the device never replied,
        // so SubmitReply::Timeout sent it through the cancellable sleep).
        let writes = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, crate::test_utils::Call::Write(_)))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    #[ignore = "exercises the real ~7s overtime threshold"]
    fn throttling_overshoot_counts_one_hw_error_and_reports_overheat() {
        let (session, fake) = new_session(false);
        fake.push_reply("OK");
        fake.push_reply("OK");
        fake.push_reply_after("NO-NONCE", Duration::from_millis(7100));
        let host = RecordingHost::new();
        let result = session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert_eq!(result, 0);
        assert_eq!(session.hw_errors(), 1);
        assert_eq!(host.overheat.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
