//! Capture engine: receives datagrams and appends them to a capture pair.

use log::{debug, error, info, trace, warn};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use dispr_core::pdu::{header_fragment, MAX_DATAGRAM_SIZE};
use dispr_core::IndexRecord;

use crate::error::{Error, Result};
use crate::listener::{CaptureEndedListener, Listeners, ReceivedListener};
use crate::network::{self, MulticastTarget};

use super::files::CaptureFiles;

/// Wake-up interval of the receive loop where a socket shutdown does not
/// interrupt a blocked receive. On Linux the receive blocks without a timeout.
#[cfg(not(target_os = "linux"))]
const RECV_BACKSTOP: std::time::Duration = std::time::Duration::from_millis(250);

/// Records captured so far, shared with whoever displays them
pub type SharedRecords = Arc<RwLock<Vec<IndexRecord>>>;

/// Handle on one capture session: its files and the records written so far.
///
/// Cheap to clone; all clones see the same record list.
#[derive(Debug, Clone)]
pub struct Capture {
    files: CaptureFiles,
    records: SharedRecords,
}

impl Capture {
    pub fn new(files: CaptureFiles, records: Vec<IndexRecord>) -> Self {
        Self {
            files,
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub fn files(&self) -> &CaptureFiles {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, index: usize) -> Option<IndexRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .copied()
    }

    /// Copy of all records
    pub fn records(&self) -> Vec<IndexRecord> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn shared_records(&self) -> SharedRecords {
        self.records.clone()
    }

    /// Point at a new file pair, e.g. after a save
    pub fn with_files(&self, files: CaptureFiles) -> Self {
        Self {
            files,
            records: self.records.clone(),
        }
    }

    fn push(&self, record: IndexRecord) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.push(record);
        records.len()
    }
}

/// Why a capture worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEnd {
    /// The data file grew past the size ceiling
    SizeLimit { size: u64 },
    Requested,
    Failed(String),
}

impl fmt::Display for CaptureEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureEnd::SizeLimit { size } => write!(f, "Size limit reached at {} bytes", size),
            CaptureEnd::Requested => write!(f, "Stopped"),
            CaptureEnd::Failed(e) => write!(f, "Exception: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Group (or unicast address) and port to receive on
    pub target: MulticastTarget,
    /// Interface address the group is joined on, `0.0.0.0` for the default
    pub interface: Ipv4Addr,
    /// Capture stops once the data file exceeds this many bytes
    pub size_limit: u64,
    /// Where the temporary capture pair is created
    pub directory: PathBuf,
}

#[derive(Default)]
struct Flags {
    stop: AtomicBool,
    paused: AtomicBool,
}

struct Worker {
    /// Second handle on the worker's socket, used to interrupt it
    socket: UdpSocket,
    local_addr: SocketAddr,
    flags: Arc<Flags>,
    capture: Capture,
    thread: JoinHandle<Result<CaptureEnd>>,
}

/// Capture engine. One instance runs at most one capture at a time.
pub struct Grabber {
    config: CaptureConfig,
    received: Listeners<dyn ReceivedListener>,
    ended: Listeners<dyn CaptureEndedListener>,
    worker: Option<Worker>,
}

impl Grabber {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            received: Listeners::new(),
            ended: Listeners::new(),
            worker: None,
        }
    }

    /// Use an existing registration list for packet notifications
    pub fn with_listeners(
        mut self,
        received: Listeners<dyn ReceivedListener>,
        ended: Listeners<dyn CaptureEndedListener>,
    ) -> Self {
        self.received = received;
        self.ended = ended;
        self
    }

    pub fn add_received_listener(&self, listener: Arc<dyn ReceivedListener>) {
        self.received.add(listener);
    }

    pub fn add_ended_listener(&self, listener: Arc<dyn CaptureEndedListener>) {
        self.ended.add(listener);
    }

    /// Bind the socket, create a fresh capture pair and start receiving.
    ///
    /// A capture that is still running is stopped first.
    pub fn start(&mut self) -> Result<Capture> {
        self.stop()?;

        let addr = self.config.target.socket_addr();
        let socket = network::create_udp_listen(&addr, &self.config.interface)
            .map_err(|source| Error::Bind { addr, source })?;
        #[cfg(not(target_os = "linux"))]
        socket.set_read_timeout(Some(RECV_BACKSTOP))?;
        let local_addr = socket.local_addr()?;
        let interrupt = socket.try_clone()?;

        let (files, data_file, index_file) = CaptureFiles::create_temp(&self.config.directory)?;
        let capture = Capture::new(files, Vec::new());
        let flags = Arc::new(Flags::default());

        let ctx = CaptureContext {
            socket,
            data: BufWriter::new(data_file),
            index: BufWriter::new(index_file),
            capture: capture.clone(),
            flags: flags.clone(),
            size_limit: self.config.size_limit,
            received: self.received.clone(),
        };
        let ended = self.ended.clone();

        let thread = thread::Builder::new()
            .name("dis-grabber".to_string())
            .spawn(move || {
                let capture = ctx.capture.clone();
                let result = ctx.run();
                let end = match &result {
                    Ok(end) => end.clone(),
                    Err(e) => {
                        error!("Capture failed: {}", e);
                        CaptureEnd::Failed(e.to_string())
                    }
                };
                ended.notify(|l| l.capture_ended(&capture, &end));
                result
            })?;

        info!(
            "Capturing {} on {} into {}",
            self.config.target,
            local_addr,
            capture.files().data.display()
        );

        self.worker = Some(Worker {
            socket: interrupt,
            local_addr,
            flags,
            capture: capture.clone(),
            thread,
        });

        Ok(capture)
    }

    /// Keep draining the socket but discard what arrives
    pub fn pause(&self) {
        if let Some(worker) = &self.worker {
            worker.flags.paused.store(true, Ordering::SeqCst);
            debug!("Capture paused");
        }
    }

    pub fn resume(&self) {
        if let Some(worker) = &self.worker {
            worker.flags.paused.store(false, Ordering::SeqCst);
            debug!("Capture resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.flags.paused.load(Ordering::SeqCst))
    }

    /// Check if the capture worker is still receiving
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.thread.is_finished())
    }

    /// Capture of the running worker
    pub fn capture(&self) -> Option<&Capture> {
        self.worker.as_ref().map(|w| &w.capture)
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }

    /// Close the socket and wait for the worker to flush and close the files.
    ///
    /// Returns the I/O error that ended the capture, if any.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        worker.flags.stop.store(true, Ordering::SeqCst);
        network::shutdown(&worker.socket);

        match worker.thread.join() {
            Ok(Ok(end)) => {
                info!("Capture ended: {}, {} records", end, worker.capture.len());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::other("capture thread panicked").into()),
        }
    }
}

impl Drop for Grabber {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Capture stopped with error: {}", e);
        }
    }
}

struct CaptureContext {
    socket: UdpSocket,
    data: BufWriter<File>,
    index: BufWriter<File>,
    capture: Capture,
    flags: Arc<Flags>,
    size_limit: u64,
    received: Listeners<dyn ReceivedListener>,
}

impl CaptureContext {
    fn run(mut self) -> Result<CaptureEnd> {
        let result = self.receive_loop();
        self.data.flush()?;
        self.index.flush()?;
        result
    }

    fn receive_loop(&mut self) -> Result<CaptureEnd> {
        // One byte spare so an oversized datagram is not silently clipped to the limit
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut offset: u64 = 0;
        let mut time_base: Option<Instant> = None;

        loop {
            if self.flags.stop.load(Ordering::SeqCst) {
                return Ok(CaptureEnd::Requested);
            }

            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    if self.flags.stop.load(Ordering::SeqCst) {
                        return Ok(CaptureEnd::Requested);
                    }
                    return Err(e.into());
                }
            };
            let now = Instant::now();

            // A shutdown socket reports an empty read
            if self.flags.stop.load(Ordering::SeqCst) {
                return Ok(CaptureEnd::Requested);
            }
            if self.flags.paused.load(Ordering::SeqCst) {
                trace!("Discarding {} bytes while paused", len);
                continue;
            }
            if len == 0 {
                debug!("Ignoring zero-length datagram");
                continue;
            }

            let base = *time_base.get_or_insert(now);
            let timestamp_ns = i64::try_from(now.duration_since(base).as_nanos()).unwrap_or(i64::MAX);
            let payload = &buf[..len];

            self.data.write_all(payload)?;
            let record = IndexRecord::new(header_fragment(payload), offset as i64, timestamp_ns, len as i32);
            self.index.write_all(&record.encode())?;
            // Keep the pair on disk consistent with the shared record list
            self.data.flush()?;
            self.index.flush()?;
            offset += len as u64;

            let total = self.capture.push(record);
            trace!("Captured #{} len {} at {} ns", total - 1, len, timestamp_ns);
            self.received.notify(|l| l.packet_received(&self.capture, total));

            if offset > self.size_limit {
                info!("Capture size limit {} exceeded ({} bytes)", self.size_limit, offset);
                return Ok(CaptureEnd::SizeLimit { size: offset });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::SocketAddrV4;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn loopback_config(dir: &TempDir, size_limit: u64) -> CaptureConfig {
        CaptureConfig {
            target: MulticastTarget::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            interface: Ipv4Addr::UNSPECIFIED,
            size_limit,
            directory: dir.path().to_path_buf(),
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn sender() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    #[test]
    fn test_capture_writes_pair() {
        let dir = TempDir::new().unwrap();
        let mut grabber = Grabber::new(loopback_config(&dir, u64::MAX));

        let counts = Arc::new(Mutex::new(Vec::new()));
        let seen = counts.clone();
        grabber.add_received_listener(Arc::new(move |_: &Capture, total: usize| {
            seen.lock().unwrap().push(total);
        }));

        let capture = grabber.start().unwrap();
        let dest = grabber.local_addr().unwrap();
        let tx = sender();
        let payloads: [&[u8]; 3] = [&[1, 2, 3, 4], &[5; 140], &[9; 64]];
        for p in payloads {
            tx.send_to(p, dest).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        wait_for(|| capture.len() == 3);
        grabber.stop().unwrap();

        assert_eq!(*counts.lock().unwrap(), vec![1, 2, 3]);

        let records = capture.files().read_records().unwrap();
        assert_eq!(records, capture.records());
        assert_eq!(records[0].timestamp_ns, 0);
        assert!(records[1].timestamp_ns > 0);
        assert!(records[2].timestamp_ns > records[1].timestamp_ns);
        assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 4, 144]);
        assert_eq!(records[0].header, [1, 2, 3]);

        let data = fs::read(&capture.files().data).unwrap();
        assert_eq!(data.len(), 4 + 140 + 64);
        assert_eq!(&data[4..144], &[5; 140][..]);
        assert_eq!(fs::metadata(&capture.files().index).unwrap().len(), 69);
    }

    #[test]
    fn test_paused_datagrams_are_dropped() {
        let dir = TempDir::new().unwrap();
        let mut grabber = Grabber::new(loopback_config(&dir, u64::MAX));
        let capture = grabber.start().unwrap();
        let dest = grabber.local_addr().unwrap();
        let tx = sender();

        tx.send_to(&[1; 10], dest).unwrap();
        wait_for(|| capture.len() == 1);

        grabber.pause();
        assert!(grabber.is_paused());
        tx.send_to(&[2; 10], dest).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(capture.len(), 1);

        grabber.resume();
        tx.send_to(&[3; 10], dest).unwrap();
        wait_for(|| capture.len() == 2);
        grabber.stop().unwrap();

        let data = fs::read(&capture.files().data).unwrap();
        assert_eq!(data, [[1u8; 10], [3u8; 10]].concat());
    }

    #[test]
    fn test_size_limit_ends_capture() {
        let dir = TempDir::new().unwrap();
        let mut grabber = Grabber::new(loopback_config(&dir, 250));

        let ended = Arc::new(Mutex::new(None));
        let end = ended.clone();
        grabber.add_ended_listener(Arc::new(move |_: &Capture, e: &CaptureEnd| {
            *end.lock().unwrap() = Some(e.clone());
        }));

        let capture = grabber.start().unwrap();
        let dest = grabber.local_addr().unwrap();
        let tx = sender();
        for _ in 0..10 {
            tx.send_to(&[7; 100], dest).unwrap();
            thread::sleep(Duration::from_millis(5));
        }

        wait_for(|| !grabber.is_running());
        grabber.stop().unwrap();

        assert_eq!(capture.len(), 3);
        let size = fs::metadata(&capture.files().data).unwrap().len();
        assert_eq!(size, 300);
        assert!(size <= 250 + MAX_DATAGRAM_SIZE as u64);
        assert_eq!(*ended.lock().unwrap(), Some(CaptureEnd::SizeLimit { size: 300 }));
    }

    #[test]
    fn test_stop_unblocks_idle_capture() {
        let dir = TempDir::new().unwrap();
        let mut grabber = Grabber::new(loopback_config(&dir, u64::MAX));
        let capture = grabber.start().unwrap();
        assert!(grabber.is_running());

        let started = Instant::now();
        grabber.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!grabber.is_running());
        assert!(capture.is_empty());
        assert!(capture.files().has_index());
    }

    #[test]
    fn test_bind_error() {
        let dir = TempDir::new().unwrap();

        // 192.0.2.0/24 is reserved for documentation and never assigned locally
        let mut config = loopback_config(&dir, u64::MAX);
        config.target = MulticastTarget::from(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 0));
        let mut grabber = Grabber::new(config);

        assert!(matches!(grabber.start(), Err(Error::Bind { .. })));
        assert!(!grabber.is_running());
    }
}
