//! Black-box exercises of the Host Adapter surface against a scripted
//! transport, standing in for the end-to-end properties a real BFL device
//! would need hardware to observe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bosminer_bitforce::session::DeviceSession;
use bosminer_bitforce::test_utils::{fake_session, FakeTransport};
use bosminer_bitforce::{EventReporter, NeverStale, NonceSink, Work};

struct RecordingHost {
    nonces: Mutex<Vec<u32>>,
    comms_errors: AtomicU64,
    throttles: AtomicU64,
    overheats: AtomicU64,
}

impl RecordingHost {
    fn new() -> Self {
        Self {
            nonces: Mutex::new(Vec::new()),
            comms_errors: AtomicU64::new(0),
            throttles: AtomicU64::new(0),
            overheats: AtomicU64::new(0),
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
        self.comms_errors.fetch_add(1, Ordering::Relaxed);
    }
    fn throttle(&self, _device_path: &str) {
        self.throttles.fetch_add(1, Ordering::Relaxed);
    }
    fn overheat(&self, _device_path: &str) {
        self.overheats.fetch_add(1, Ordering::Relaxed);
    }
}

fn new_session(range_opt_in: bool) -> (DeviceSession<FakeTransport>, FakeTransport) {
    fake_session(range_opt_in)
}

fn sample_work() -> Work {
    Work::new([0xAAu8; 32], [0xBBu8; 128])
}

/// S1: a full-range job that finds no nonce still bills the full-range
/// sentinel to the work counter and never touches the nonce sink.
#[test]
fn full_range_job_with_no_nonce() {
    let (session, fake) = new_session(false);
    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    let host = RecordingHost::new();

    let claimed = session.scan(&mut sample_work(), &NeverStale, &host, &host);

    assert_eq!(claimed, bosminer_bitforce::config::FULL_RANGE_NONCES as i64);
    assert!(host.nonces.lock().unwrap().is_empty());
}

/// S2: a nonce-range job claims the range-sized sentinel and advances the
/// work item's starting nonce so the next job claims a disjoint slice.
#[test]
fn range_job_advances_starting_nonce_between_calls() {
    let (session, fake) = new_session(true);
    let mut work = sample_work();

    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    let host = RecordingHost::new();
    let claimed = session.scan(&mut work, &NeverStale, &host, &host);
    assert_eq!(claimed, bosminer_bitforce::config::NONCE_RANGE_SIZE as i64);
    let first_slice_end = work.starting_nonce();
    assert_eq!(first_slice_end, bosminer_bitforce::config::NONCE_RANGE_SIZE + 1);

    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    session.scan(&mut work, &NeverStale, &host, &host);
    assert!(work.starting_nonce() > first_slice_end);
}

/// S3: once the device rejects nonce-range work, the session falls back to
/// full-range submissions for the rest of its lifetime (§8 property 3).
#[test]
fn range_rejection_is_permanent_for_the_session() {
    let (session, fake) = new_session(true);
    fake.push_reply("ERR:UNSUPPORTED");
    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    let host = RecordingHost::new();

    session.scan(&mut sample_work(), &NeverStale, &host, &host);
    assert!(!session.nonce_range_supported());

    for _ in 0..3 {
        fake.push_reply("OK");
        fake.push_reply("OK");
        fake.push_reply("NO-NONCE");
        session.scan(&mut sample_work(), &NeverStale, &host, &host);
        assert!(!session.nonce_range_supported());
    }
}

/// S4: nonces reported by NONCE-FOUND reach the sink decoded as big-endian
/// 32-bit integers, in the order the device listed them.
#[test]
fn found_nonces_are_submitted_in_order() {
    let (session, fake) = new_session(false);
    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NONCE-FOUND:00000001,FFFFFFFE");
    let host = RecordingHost::new();

    session.scan(&mut sample_work(), &NeverStale, &host, &host);

    assert_eq!(*host.nonces.lock().unwrap(), vec![1, 0xFFFF_FFFE]);
}

/// S5: a device that stops answering entirely mid-submit is treated as a
/// comms failure -- the session closes, reopens, and flushes its handle in
/// place and reports the event, so a subsequent scan call proceeds normally
/// instead of needing a host-driven `prepare`/`reinit`.
#[test]
fn rejected_block_data_reopens_the_session() {
    let (session, fake) = new_session(false);
    fake.push_reply("OK");
    fake.push_reply("ERR:BAD-FRAME");
    let host = RecordingHost::new();

    let claimed = session.scan(&mut sample_work(), &NeverStale, &host, &host);

    assert_eq!(claimed, 0);
    assert_eq!(session.hw_errors(), 1);
    assert_eq!(host.comms_errors.load(Ordering::Relaxed), 1);

    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    let claimed2 = session.scan(&mut sample_work(), &NeverStale, &host, &host);
    assert_eq!(claimed2, bosminer_bitforce::config::FULL_RANGE_NONCES as i64);
}

/// S6: a caller that marks work stale before the device ever answers gets
/// a prompt, zero-nonce return instead of blocking through the retry loop.
#[test]
fn stale_predicate_short_circuits_the_submit_retry() {
    let (session, _fake) = new_session(false);
    struct AlwaysStale;
    impl bosminer_bitforce::StaleCheck for AlwaysStale {
        fn is_stale(&self) -> bool {
            true
        }
    }
    let host = RecordingHost::new();

    let claimed = session.scan(&mut sample_work(), &AlwaysStale, &host, &host);

    assert_eq!(claimed, 0);
}

/// Invariant: a garbled poll reply counts as a hardware error and triggers
/// a resynchronizing buffer flush rather than crashing the scan.
#[test]
fn garbled_poll_reply_flushes_and_counts_error() {
    let (session, fake) = new_session(false);
    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("@#$%");
    for _ in 0..3 {
        fake.push_reply("stray");
    }
    let host = RecordingHost::new();

    let claimed = session.scan(&mut sample_work(), &NeverStale, &host, &host);

    assert_eq!(claimed, 0);
    assert_eq!(session.hw_errors(), 1);
}

/// Stats surfaced through the Host Adapter reflect the session's current
/// tuning state, not raw device replies.
#[test]
fn stats_reflect_current_sleep_and_average() {
    let (session, fake) = new_session(false);
    fake.push_reply("OK");
    fake.push_reply("OK");
    fake.push_reply("NO-NONCE");
    let host = RecordingHost::new();

    session.scan(&mut sample_work(), &NeverStale, &host, &host);
    let stats = session.get_stats();

    assert!(stats.sleep_time_ms > 0);
}
