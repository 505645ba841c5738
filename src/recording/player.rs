//! Replay engine: re-sends a capture pair with its recorded timing.

use log::{debug, error, info, trace};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dispr_core::index::{record_count, record_position};
use dispr_core::pdu::MAX_DATAGRAM_SIZE;
use dispr_core::{FormatError, IndexRecord, PlaybackMode, RECORD_SIZE};

use crate::error::{Error, Result};
use crate::listener::{Listeners, SentListener, StoppedListener};
use crate::network::{self, MulticastTarget};

use super::files::CaptureFiles;

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub destination: MulticastTarget,
    /// Outgoing interface for multicast, `0.0.0.0` for the default
    pub interface: Ipv4Addr,
    /// Delay before every send in fast mode
    pub fast_interval: Duration,
    pub ttl: u32,
}

/// How the next run traverses the capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackOptions {
    pub reverse: bool,
    pub fast: bool,
    /// Wrap around at either end instead of stopping
    pub looping: bool,
    /// Stop after this many sends
    pub count: Option<u64>,
}

impl PlaybackOptions {
    pub fn new(mode: PlaybackMode, looping: bool) -> Self {
        Self {
            reverse: mode.reverse,
            fast: mode.fast,
            looping,
            count: None,
        }
    }

    /// A single send in the given direction, used for stepping
    pub fn single_step(reverse: bool) -> Self {
        Self {
            reverse,
            count: Some(1),
            ..Self::default()
        }
    }
}

/// Why a replay run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfFile,
    BeginningOfFile,
    CountCompleted,
    /// `stop()` was called
    Requested,
    /// File or socket I/O failed mid-run
    Failed(String),
}

impl StopReason {
    /// The run ended without anyone asking it to
    pub fn is_natural(&self) -> bool {
        !matches!(self, StopReason::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndOfFile => write!(f, "End of File"),
            StopReason::BeginningOfFile => write!(f, "Beginning of File"),
            StopReason::CountCompleted => write!(f, "Requested count completed"),
            StopReason::Requested => write!(f, "Stopped"),
            StopReason::Failed(e) => write!(f, "Exception: {}", e),
        }
    }
}

#[derive(Default)]
struct GateState {
    paused: bool,
    stopped: bool,
}

/// Pause and stop signalling between the controlling thread and the worker
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn resume(&self) {
        self.lock().paused = false;
        self.changed.notify_all();
    }

    fn stop(&self) {
        self.lock().stopped = true;
        self.changed.notify_all();
    }

    fn is_paused(&self) -> bool {
        self.lock().paused
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Sleep for `delay`, returning early (and false) when stopped
    fn sleep(&self, delay: Duration) -> bool {
        let (state, _) = self
            .changed
            .wait_timeout_while(self.lock(), delay, |s| !s.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        !state.stopped
    }

    /// Block while paused. Returns false when stopped.
    fn wait_while_paused(&self) -> bool {
        let state = self
            .changed
            .wait_while(self.lock(), |s| s.paused && !s.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        !state.stopped
    }
}

struct Worker {
    gate: Arc<Gate>,
    /// Second handle on the worker's socket, closed by `stop`
    socket: UdpSocket,
    thread: JoinHandle<StopReason>,
}

/// Replay engine for one capture pair.
pub struct Player {
    files: CaptureFiles,
    data: File,
    index: File,
    config: PlayerConfig,
    options: PlaybackOptions,
    sent: Listeners<dyn SentListener>,
    stopped: Listeners<dyn StoppedListener>,
    worker: Option<Worker>,
}

impl Player {
    /// Open both files of `files` for reading
    pub fn open(files: &CaptureFiles, config: PlayerConfig) -> Result<Self> {
        let data = File::open(&files.data)?;
        let index = File::open(&files.index)?;

        Ok(Self {
            files: files.clone(),
            data,
            index,
            config,
            options: PlaybackOptions::default(),
            sent: Listeners::new(),
            stopped: Listeners::new(),
            worker: None,
        })
    }

    pub fn with_listeners(
        mut self,
        sent: Listeners<dyn SentListener>,
        stopped: Listeners<dyn StoppedListener>,
    ) -> Self {
        self.sent = sent;
        self.stopped = stopped;
        self
    }

    pub fn add_sent_listener(&self, listener: Arc<dyn SentListener>) {
        self.sent.add(listener);
    }

    pub fn add_stopped_listener(&self, listener: Arc<dyn StoppedListener>) {
        self.stopped.add(listener);
    }

    pub fn files(&self) -> &CaptureFiles {
        &self.files
    }

    pub fn options(&self) -> PlaybackOptions {
        self.options
    }

    /// Options for the next run; a running one keeps its own
    pub fn set_options(&mut self, options: PlaybackOptions) {
        self.options = options;
    }

    pub fn record_count(&self) -> Result<u64> {
        Ok(record_count(self.index.metadata()?.len()))
    }

    /// Start a run at record `start`, clamped to the index.
    ///
    /// Without a start, forward runs begin at the first record and reverse
    /// runs at the last. A run still in progress is stopped first.
    pub fn start(&mut self, start: Option<u64>) -> Result<()> {
        self.stop();

        let last = self.record_count()?.saturating_sub(1);
        let cursor = match start {
            Some(at) => at.min(last),
            None if self.options.reverse => last,
            None => 0,
        };

        let destination = self.config.destination.socket_addr();
        let socket = network::create_udp_send(&destination, &self.config.interface, self.config.ttl)
            .map_err(|source| Error::Bind {
                addr: destination,
                source,
            })?;
        let interrupt = socket.try_clone()?;
        let gate = Arc::new(Gate::default());

        let ctx = PlaybackContext {
            socket,
            destination,
            data: self.data.try_clone()?,
            index: self.index.try_clone()?,
            gate: gate.clone(),
            options: self.options,
            fast_interval: self.config.fast_interval,
            cursor: cursor as i64,
            sent: self.sent.clone(),
        };
        let stopped = self.stopped.clone();

        let thread = thread::Builder::new()
            .name("dis-player".to_string())
            .spawn(move || {
                let reason = ctx.run();
                info!("Replay stopped: {}", reason);
                stopped.notify(|l| l.sender_stopped(&reason));
                reason
            })?;

        info!(
            "Replaying {} to {} from record {} ({:?})",
            self.files.data.display(),
            destination,
            cursor,
            self.options
        );

        self.worker = Some(Worker {
            gate,
            socket: interrupt,
            thread,
        });
        Ok(())
    }

    /// Hold the next send until [`Player::resume`]
    pub fn pause(&self) {
        if let Some(worker) = self.worker.as_ref().filter(|_| self.is_running()) {
            worker.gate.pause();
            debug!("Replay paused");
        }
    }

    pub fn resume(&self) {
        if let Some(worker) = &self.worker {
            worker.gate.resume();
            debug!("Replay resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.gate.is_paused())
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.thread.is_finished())
    }

    /// Interrupt the run and wait for the worker. `None` if nothing was started.
    pub fn stop(&mut self) -> Option<StopReason> {
        let worker = self.worker.take()?;
        worker.gate.stop();
        network::shutdown(&worker.socket);
        Some(Self::join(worker))
    }

    /// Wait for the run to end by itself
    pub fn wait(&mut self) -> Option<StopReason> {
        let worker = self.worker.take()?;
        Some(Self::join(worker))
    }

    fn join(worker: Worker) -> StopReason {
        worker.thread.join().unwrap_or_else(|_| {
            error!("Replay thread panicked");
            StopReason::Failed("replay thread panicked".to_string())
        })
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PlaybackContext {
    socket: UdpSocket,
    destination: SocketAddrV4,
    data: File,
    index: File,
    gate: Arc<Gate>,
    options: PlaybackOptions,
    fast_interval: Duration,
    /// Next record to read; goes below zero when a reverse run passes the start
    cursor: i64,
    sent: Listeners<dyn SentListener>,
}

impl PlaybackContext {
    fn run(mut self) -> StopReason {
        match self.play() {
            Ok(reason) => reason,
            // A closed socket is how stop() interrupts a send
            Err(_) if self.gate.is_stopped() => StopReason::Requested,
            Err(e) => {
                error!("Replay failed: {}", e);
                StopReason::Failed(e.to_string())
            }
        }
    }

    fn exhausted(&self) -> StopReason {
        if self.options.reverse {
            StopReason::BeginningOfFile
        } else {
            StopReason::EndOfFile
        }
    }

    fn read_record(&mut self, at: i64) -> Result<Option<IndexRecord>> {
        if at < 0 {
            return Ok(None);
        }
        self.index.seek(SeekFrom::Start(record_position(at as u64)))?;

        let mut buf = [0u8; RECORD_SIZE];
        match self.index.read_exact(&mut buf) {
            Ok(()) => Ok(Some(IndexRecord::decode(&buf)?)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_payload(&mut self, record: &IndexRecord, payload: &mut Vec<u8>) -> Result<()> {
        let length = record.length as usize;
        if length > MAX_DATAGRAM_SIZE {
            return Err(FormatError::MalformedRecord {
                detail: format!("payload length {} exceeds a datagram", length),
            }
            .into());
        }
        payload.resize(length, 0);
        self.data.seek(SeekFrom::Start(record.offset as u64))?;
        self.data.read_exact(payload)?;
        Ok(())
    }

    fn play(&mut self) -> Result<StopReason> {
        let reverse = self.options.reverse;
        let step: i64 = if reverse { -1 } else { 1 };
        let mut last_timestamp: Option<i64> = None;
        let mut total_sent: u64 = 0;
        let mut remaining = self.options.count;
        let mut payload = Vec::new();

        loop {
            if self.gate.is_stopped() {
                return Ok(StopReason::Requested);
            }

            let mut position = self.cursor;
            let record = match self.read_record(position)? {
                Some(record) => record,
                None if !self.options.looping => return Ok(self.exhausted()),
                None => {
                    position = if reverse {
                        record_count(self.index.metadata()?.len()) as i64 - 1
                    } else {
                        0
                    };
                    last_timestamp = None;
                    debug!("Replay wrapped to record {}", position);
                    match self.read_record(position)? {
                        Some(record) => record,
                        None => return Ok(self.exhausted()),
                    }
                }
            };
            self.cursor = position + step;

            let delay = if self.options.fast {
                self.fast_interval
            } else {
                // abs_diff: timestamps decrease in reverse
                last_timestamp.map_or(Duration::ZERO, |last| {
                    Duration::from_nanos(record.timestamp_ns.abs_diff(last))
                })
            };
            last_timestamp = Some(record.timestamp_ns);
            if !self.gate.sleep(delay) {
                return Ok(StopReason::Requested);
            }

            self.read_payload(&record, &mut payload)?;

            if !self.gate.wait_while_paused() {
                return Ok(StopReason::Requested);
            }
            self.socket.send_to(&payload, self.destination)?;
            total_sent += 1;
            trace!("Sent #{} len {} ({} total)", position, payload.len(), total_sent);
            self.sent
                .notify(|l| l.packet_sent(position as u64, total_sent, reverse));

            if let Some(n) = remaining.as_mut() {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    return Ok(StopReason::CountCompleted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tempfile::TempDir;

    const MS: i64 = 1_000_000;

    /// Write a capture pair with one payload per `(length, timestamp)`
    fn write_capture(dir: &TempDir, records: &[(usize, i64)]) -> CaptureFiles {
        let files = CaptureFiles::for_data(dir.path().join("test.disbin"));
        let mut data = Vec::new();
        let mut index = Vec::new();
        for (i, &(length, timestamp)) in records.iter().enumerate() {
            let payload = vec![i as u8 + 1; length];
            let record = IndexRecord::new([7, 1, i as u8], data.len() as i64, timestamp, length as i32);
            index.extend_from_slice(&record.encode());
            data.extend_from_slice(&payload);
        }
        fs::write(&files.data, data).unwrap();
        fs::write(&files.index, index).unwrap();
        files
    }

    fn receiver() -> (UdpSocket, PlayerConfig) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let config = PlayerConfig {
            destination: MulticastTarget::from(addr),
            interface: Ipv4Addr::UNSPECIFIED,
            fast_interval: Duration::from_millis(10),
            ttl: 1,
        };
        (socket, config)
    }

    /// Receive `n` datagrams, returning their lengths and arrival times
    fn receive(socket: &UdpSocket, n: usize) -> Vec<(usize, Instant)> {
        let mut buf = [0u8; 2048];
        (0..n)
            .map(|_| {
                let len = socket.recv(&mut buf).unwrap();
                (len, Instant::now())
            })
            .collect()
    }

    fn lengths(received: &[(usize, Instant)]) -> Vec<usize> {
        received.iter().map(|(len, _)| *len).collect()
    }

    fn gaps(received: &[(usize, Instant)]) -> Vec<Duration> {
        received.windows(2).map(|w| w[1].1 - w[0].1).collect()
    }

    fn scenario(dir: &TempDir) -> CaptureFiles {
        write_capture(dir, &[(20, 0), (140, 50 * MS), (64, 170 * MS)])
    }

    #[test]
    fn test_forward_replay_timing() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let mut player = Player::open(&scenario(&dir), config).unwrap();

        player.start(None).unwrap();
        let received = receive(&rx, 3);
        assert_eq!(player.wait(), Some(StopReason::EndOfFile));

        assert_eq!(lengths(&received), vec![20, 140, 64]);
        let gaps = gaps(&received);
        assert!(gaps[0] >= Duration::from_millis(45) && gaps[0] < Duration::from_millis(150), "{gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(110) && gaps[1] < Duration::from_millis(250), "{gaps:?}");
    }

    #[test]
    fn test_reverse_replay_timing() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let mut player = Player::open(&scenario(&dir), config).unwrap();

        let indexes = Arc::new(Mutex::new(Vec::new()));
        let seen = indexes.clone();
        player.add_sent_listener(Arc::new(move |record: u64, total: u64, reverse: bool| {
            assert!(reverse);
            seen.lock().unwrap().push((record, total));
        }));

        player.set_options(PlaybackOptions::new(PlaybackMode::REVERSE, false));
        player.start(None).unwrap();
        let received = receive(&rx, 3);
        assert_eq!(player.wait(), Some(StopReason::BeginningOfFile));

        assert_eq!(lengths(&received), vec![64, 140, 20]);
        let gaps = gaps(&received);
        assert!(gaps[0] >= Duration::from_millis(110) && gaps[0] < Duration::from_millis(250), "{gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(45) && gaps[1] < Duration::from_millis(150), "{gaps:?}");
        assert_eq!(*indexes.lock().unwrap(), vec![(2, 1), (1, 2), (0, 3)]);
    }

    #[test]
    fn test_fast_replay_ignores_recorded_spacing() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let files = write_capture(&dir, &[(20, 0), (30, 2_000 * MS), (40, 4_000 * MS)]);
        let mut player = Player::open(&files, config).unwrap();

        player.set_options(PlaybackOptions::new(PlaybackMode::FAST, false));
        let started = Instant::now();
        player.start(None).unwrap();
        let received = receive(&rx, 3);
        assert_eq!(player.wait(), Some(StopReason::EndOfFile));

        assert_eq!(lengths(&received), vec![20, 30, 40]);
        assert!(received[0].1 - started >= Duration::from_millis(8));
        for gap in gaps(&received) {
            assert!(gap >= Duration::from_millis(5) && gap < Duration::from_millis(500), "{gap:?}");
        }
    }

    #[test]
    fn test_looping_with_count() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let mut player = Player::open(&scenario(&dir), config).unwrap();

        player.set_options(PlaybackOptions {
            count: Some(5),
            ..PlaybackOptions::new(PlaybackMode::FAST, true)
        });
        player.start(None).unwrap();
        let received = receive(&rx, 5);
        assert_eq!(player.wait(), Some(StopReason::CountCompleted));
        assert_eq!(lengths(&received), vec![20, 140, 64, 20, 140]);

        player.set_options(PlaybackOptions {
            count: Some(4),
            ..PlaybackOptions::new(PlaybackMode::FAST_REVERSE, true)
        });
        player.start(None).unwrap();
        let received = receive(&rx, 4);
        assert_eq!(player.wait(), Some(StopReason::CountCompleted));
        assert_eq!(lengths(&received), vec![64, 140, 20, 64]);
    }

    #[test]
    fn test_start_is_clamped() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let mut player = Player::open(&scenario(&dir), config).unwrap();

        player.start(Some(10)).unwrap();
        assert_eq!(lengths(&receive(&rx, 1)), vec![64]);
        assert_eq!(player.wait(), Some(StopReason::EndOfFile));

        player.set_options(PlaybackOptions::single_step(true));
        player.start(Some(1)).unwrap();
        assert_eq!(lengths(&receive(&rx, 1)), vec![140]);
        assert_eq!(player.wait(), Some(StopReason::CountCompleted));
    }

    #[test]
    fn test_pause_holds_next_send() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let files = write_capture(&dir, &[(20, 0), (30, 100 * MS)]);
        let mut player = Player::open(&files, config).unwrap();

        player.start(None).unwrap();
        receive(&rx, 1);
        player.pause();
        assert!(player.is_paused());

        rx.set_read_timeout(Some(Duration::from_millis(400))).unwrap();
        let mut buf = [0u8; 64];
        assert!(rx.recv(&mut buf).is_err());

        rx.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let resumed = Instant::now();
        player.resume();
        assert_eq!(lengths(&receive(&rx, 1)), vec![30]);
        assert!(resumed.elapsed() < Duration::from_millis(100));
        assert_eq!(player.wait(), Some(StopReason::EndOfFile));
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let dir = TempDir::new().unwrap();
        let (rx, config) = receiver();
        let files = write_capture(&dir, &[(20, 0), (30, 60_000 * MS)]);
        let mut player = Player::open(&files, config).unwrap();

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let seen = reasons.clone();
        player.add_stopped_listener(Arc::new(move |reason: &StopReason| {
            seen.lock().unwrap().push(reason.clone());
        }));

        player.start(None).unwrap();
        receive(&rx, 1);
        assert!(player.is_running());

        let stopping = Instant::now();
        assert_eq!(player.stop(), Some(StopReason::Requested));
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert!(!player.is_running());
        assert_eq!(*reasons.lock().unwrap(), vec![StopReason::Requested]);
        assert_eq!(player.stop(), None);
    }

    #[test]
    fn test_empty_capture_ends_immediately() {
        let dir = TempDir::new().unwrap();
        let (_rx, config) = receiver();
        let files = write_capture(&dir, &[]);
        let mut player = Player::open(&files, config).unwrap();

        player.set_options(PlaybackOptions::new(PlaybackMode::REVERSE, true));
        player.start(None).unwrap();
        assert_eq!(player.wait(), Some(StopReason::BeginningOfFile));
    }

    #[test]
    fn test_open_requires_both_files() {
        let dir = TempDir::new().unwrap();
        let (_rx, config) = receiver();
        let files = CaptureFiles::for_data(dir.path().join("missing.disbin"));
        fs::write(&files.data, [0u8; 12]).unwrap();

        assert!(matches!(Player::open(&files, config), Err(Error::Io(_))));
    }

    #[test]
    fn test_stop_reason_text() {
        assert_eq!(StopReason::EndOfFile.to_string(), "End of File");
        assert_eq!(StopReason::CountCompleted.to_string(), "Requested count completed");
        assert_eq!(StopReason::Failed("boom".into()).to_string(), "Exception: boom");
        assert!(!StopReason::Requested.is_natural());
        assert!(StopReason::BeginningOfFile.is_natural());
    }
}
