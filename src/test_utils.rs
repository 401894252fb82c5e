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

//! A scripted, call-recording fake transport shared by this crate's unit
//! tests and its `tests/` integration suite. It never touches real I/O and
//! lets tests assert on both the sequence of writes and the serialization
//! of access to a session.
//!
//! Replies can be scripted with a minimum wall-clock delay before they
//! become visible, so timing-sensitive behaviour (the adaptive-sleep
//! convergence and hard-timeout properties) can be exercised without real
//! hardware: a `read_line` issued before its scripted reply is due observes
//! a timeout (empty line), exactly like a real device that hasn't finished
//! yet.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Write(Vec<u8>),
    Read(String),
}

struct Scripted {
    text: String,
    ready_at: Instant,
}

struct Inner {
    replies: VecDeque<Scripted>,
    calls: Vec<Call>,
}

/// Cloneable handle onto a fake transport's script and call log, so a test
/// can feed replies/inspect calls from outside the thread driving the
/// device session.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<Mutex<Inner>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                replies: VecDeque::new(),
                calls: Vec::new(),
            })),
        }
    }

    /// Queues a reply visible to the next `read_line` as soon as it is
    /// attempted.
    pub fn push_reply(&self, reply: &str) {
        self.push_reply_after(reply, Duration::from_millis(0));
    }

    /// Queues a reply that only becomes visible once `delay` has elapsed
    /// since this call. `read_line` attempts before then observe a timeout
    /// without consuming the scripted reply.
    pub fn push_reply_after(&self, reply: &str, delay: Duration) {
        self.inner.lock().unwrap().replies.push_back(Scripted {
            text: reply.to_string(),
            ready_at: Instant::now() + delay,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for FakeTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().calls.push(Call::Write(bytes.to_vec()));
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let line = match inner.replies.front() {
            Some(scripted) if scripted.ready_at <= Instant::now() => {
                inner.replies.pop_front().unwrap().text
            }
            _ => String::new(),
        };
        inner.calls.push(Call::Read(line.clone()));
        Ok(line)
    }
}

/// Builds a `DeviceSession` already wired to a fresh `FakeTransport`, as if
/// discovery had just probed and admitted a device. Shared by this crate's
/// unit tests and its `tests/` integration suite so neither has to repeat
/// the discovery handshake to get a ready-to-scan session.
pub fn fake_session(
    nonce_range_opt_in: bool,
) -> (crate::session::DeviceSession<FakeTransport>, FakeTransport) {
    let fake = FakeTransport::new();
    let session = crate::session::DeviceSession::new(
        "/dev/fake-bfl0".to_string(),
        "BitFORCE SHA256 SC 1.0".to_string(),
        ">>>ID: BitFORCE SHA256 SC 1.0 >>>".to_string(),
        nonce_range_opt_in,
        Arc::new(AtomicU64::new(0)),
        crate::logging::root_logger(),
    );
    let opener = fake.clone();
    session
        .prepare_with(move || Ok(opener.clone()))
        .expect("a fake transport always opens");
    (session, fake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_transport_records_calls_in_order() {
        let mut t = FakeTransport::new();
        t.push_reply("OK");
        t.write_all(b"ZDX").unwrap();
        let reply = t.read_line().unwrap();
        assert_eq!(reply, "OK");
        assert_eq!(
            t.calls(),
            vec![Call::Write(b"ZDX".to_vec()), Call::Read("OK".to_string())]
        );
    }

    #[test]
    fn delayed_reply_times_out_until_due() {
        let mut t = FakeTransport::new();
        t.push_reply_after("NO-NONCE", Duration::from_millis(30));
        assert_eq!(t.read_line().unwrap(), "");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(t.read_line().unwrap(), "NO-NONCE");
    }
}
