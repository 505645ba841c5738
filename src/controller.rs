//! Session controller.
//!
//! Feeds events through the session state machine and carries out the
//! resulting effects on the capture and replay engines. It is the only
//! place that starts, pauses or stops an engine, so the running engine is
//! always the one the current state implies.
//!
//! Engine workers never touch the controller. They post [`Notice`]s on a
//! channel, which [`Controller::pump`] turns into state machine events on
//! the controlling thread.

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dispr_core::{Controls, Effect, PlaybackMode, SessionEvent, SessionMachine, SessionState};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::listener::{CaptureEndedListener, Listeners, ReceivedListener, SentListener, StoppedListener};
use crate::recording::{
    build_index_file, Capture, CaptureConfig, CaptureEnd, CaptureFiles, Grabber, PlaybackOptions, Player,
    PlayerConfig, StopReason,
};

/// Something an engine worker reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Sent { record: u64, reverse: bool },
    ReplayStopped(StopReason),
    CaptureEnded(CaptureEnd),
}

pub struct Controller {
    capture_config: CaptureConfig,
    player_config: PlayerConfig,
    machine: SessionMachine,
    grabber: Option<Grabber>,
    player: Option<Player>,
    /// Loaded or most recent capture
    capture: Option<Capture>,
    /// Record the next run starts at; `None` until one is selected or sent
    cursor: Option<u64>,
    looping: bool,
    count: Option<u64>,
    notices: Receiver<Notice>,
    received: Listeners<dyn ReceivedListener>,
    ended: Listeners<dyn CaptureEndedListener>,
    sent: Listeners<dyn SentListener>,
    stopped: Listeners<dyn StoppedListener>,
}

impl Controller {
    pub fn new(capture_config: CaptureConfig, player_config: PlayerConfig) -> Self {
        let (tx, notices) = channel::unbounded();
        let controller = Self {
            capture_config,
            player_config,
            machine: SessionMachine::new(),
            grabber: None,
            player: None,
            capture: None,
            cursor: None,
            looping: false,
            count: None,
            notices,
            received: Listeners::new(),
            ended: Listeners::new(),
            sent: Listeners::new(),
            stopped: Listeners::new(),
        };
        controller.forward_notices(tx);
        controller
    }

    /// Build a controller that captures from and replays to the configured group
    pub fn from_config(config: &Config) -> Result<Self> {
        let target = config.target()?;
        let interface = config.interface_addr()?;

        Ok(Self::new(
            CaptureConfig {
                target,
                interface,
                size_limit: config.size_limit,
                directory: config.capture_dir(),
            },
            PlayerConfig {
                destination: target,
                interface,
                fast_interval: config.fast_interval(),
                ttl: config.ttl,
            },
        ))
    }

    fn forward_notices(&self, tx: Sender<Notice>) {
        let sent_tx = tx.clone();
        self.sent.add(Arc::new(move |record: u64, _total: u64, reverse: bool| {
            let _ = sent_tx.send(Notice::Sent { record, reverse });
        }));
        let stopped_tx = tx.clone();
        self.stopped.add(Arc::new(move |reason: &StopReason| {
            let _ = stopped_tx.send(Notice::ReplayStopped(reason.clone()));
        }));
        self.ended.add(Arc::new(move |_: &Capture, end: &CaptureEnd| {
            let _ = tx.send(Notice::CaptureEnded(end.clone()));
        }));
    }

    pub fn add_received_listener(&self, listener: Arc<dyn ReceivedListener>) {
        self.received.add(listener);
    }

    pub fn add_sent_listener(&self, listener: Arc<dyn SentListener>) {
        self.sent.add(listener);
    }

    pub fn add_stopped_listener(&self, listener: Arc<dyn StoppedListener>) {
        self.stopped.add(listener);
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn controls(&self) -> Controls {
        self.machine.controls()
    }

    pub fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    /// Address the running capture receives on
    pub fn capture_addr(&self) -> Option<std::net::SocketAddr> {
        self.grabber.as_ref().and_then(Grabber::local_addr)
    }

    /// Record that the next replay or step starts at.
    ///
    /// `None` after a load or a recording: forward runs then start at the
    /// first record and reverse runs at the last.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Move the cursor to `record`, clamped to the capture
    pub fn select(&mut self, record: u64) {
        self.cursor = Some(record.min(self.last_record()));
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Applies from the next replay run on
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Limit replay runs to `count` sends
    pub fn set_count(&mut self, count: Option<u64>) {
        self.count = count;
    }

    fn last_record(&self) -> u64 {
        self.capture
            .as_ref()
            .map_or(0, |c| c.len().saturating_sub(1) as u64)
    }

    fn refresh_loaded(&mut self) {
        let loaded = self.capture.as_ref().is_some_and(|c| !c.is_empty());
        self.machine.set_loaded(loaded);
    }

    /// Apply `event`.
    ///
    /// Events the current state does not accept fail with
    /// [`Error::InvalidTransition`] and change nothing. If carrying out the
    /// transition fails, the engines are stopped and the session returns to
    /// `Stopped` before the error is returned.
    pub fn handle(&mut self, event: SessionEvent) -> Result<()> {
        let from = self.machine.state();
        let effects = self.machine.handle(event)?;
        debug!("{}: {} -> {}", event, from, self.machine.state());

        for effect in effects {
            if let Err(e) = self.apply(effect) {
                error!("{} failed: {}", event, e);
                if let Err(stop_error) = self.stop_engines() {
                    warn!("Stopping engines: {}", stop_error);
                }
                self.machine.force_stopped();
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::StopEngines => self.stop_engines(),
            Effect::StartCapture => self.start_capture(),
            Effect::PauseCapture => {
                if let Some(grabber) = &self.grabber {
                    grabber.pause();
                }
                Ok(())
            }
            Effect::ResumeCapture => {
                if let Some(grabber) = &self.grabber {
                    grabber.resume();
                }
                Ok(())
            }
            Effect::StartPlayback(mode) => self.start_playback(mode),
            Effect::SeekFirst => {
                self.cursor = Some(0);
                Ok(())
            }
            Effect::SeekLast => {
                self.cursor = Some(self.last_record());
                Ok(())
            }
            Effect::Step { reverse } => self.step(reverse),
        }
    }

    fn stop_engines(&mut self) -> Result<()> {
        let mut result = Ok(());

        if let Some(mut grabber) = self.grabber.take() {
            result = grabber.stop();
            if let Some(capture) = &self.capture {
                info!("Captured {} records", capture.len());
            }
            self.cursor = None;
        }
        if let Some(player) = self.player.as_mut() {
            if let Some(reason) = player.stop() {
                debug!("Replay stop: {}", reason);
            }
        }

        self.drain_notices();
        self.refresh_loaded();
        result
    }

    fn start_capture(&mut self) -> Result<()> {
        self.discard_capture();

        let mut grabber =
            Grabber::new(self.capture_config.clone()).with_listeners(self.received.clone(), self.ended.clone());
        let capture = grabber.start()?;

        self.capture = Some(capture);
        self.grabber = Some(grabber);
        self.cursor = None;
        Ok(())
    }

    /// Player for the current capture, opened on first use
    fn player(&mut self) -> Result<&mut Player> {
        let capture = self.capture.as_ref().filter(|c| !c.is_empty()).ok_or(Error::NoCapture)?;

        let reopen = self.player.as_ref().map_or(true, |p| p.files() != capture.files());
        if reopen {
            let player = Player::open(capture.files(), self.player_config.clone())?
                .with_listeners(self.sent.clone(), self.stopped.clone());
            self.player = Some(player);
        }
        self.player.as_mut().ok_or(Error::NoCapture)
    }

    fn start_playback(&mut self, mode: PlaybackMode) -> Result<()> {
        let cursor = self.cursor;
        let options = PlaybackOptions {
            count: self.count,
            ..PlaybackOptions::new(mode, self.looping)
        };

        let player = self.player()?;
        player.set_options(options);
        player.start(cursor)
    }

    fn step(&mut self, reverse: bool) -> Result<()> {
        let cursor = self.cursor;
        let player = self.player()?;
        player.set_options(PlaybackOptions::single_step(reverse));
        player.start(cursor)?;
        let reason = player.wait();
        self.drain_notices();

        match reason {
            Some(StopReason::Failed(e)) => Err(io::Error::other(e).into()),
            _ => Ok(()),
        }
    }

    /// Move the cursor past a record that was just sent
    fn follow(&mut self, record: u64, reverse: bool) {
        self.cursor = Some(if reverse {
            record.saturating_sub(1)
        } else {
            (record + 1).min(self.last_record())
        });
    }

    /// Handle queued notices, keeping cursor updates and dropping end-of-run
    /// notices of a stop the caller asked for
    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                Notice::Sent { record, reverse } => self.follow(record, reverse),
                other => debug!("Discarding {:?}", other),
            }
        }
    }

    fn apply_notice(&mut self, notice: Notice) -> Result<bool> {
        let state = self.machine.state();
        match notice {
            Notice::Sent { record, reverse } => {
                self.follow(record, reverse);
                Ok(false)
            }
            Notice::ReplayStopped(reason) if reason.is_natural() && state.is_playing() => {
                info!("Replay ended: {}", reason);
                self.handle(SessionEvent::RecordStop)?;
                Ok(true)
            }
            Notice::CaptureEnded(end) if end != CaptureEnd::Requested && state.is_recording() => {
                info!("Capture ended: {}", end);
                self.handle(SessionEvent::RecordStop)?;
                Ok(true)
            }
            other => {
                debug!("Ignoring {:?} in {}", other, state);
                Ok(false)
            }
        }
    }

    /// Handle notices that engines have posted so far.
    ///
    /// Returns true when an engine ended by itself and the session went back
    /// to `Stopped`.
    pub fn pump(&mut self) -> Result<bool> {
        let mut ended = false;
        while let Ok(notice) = self.notices.try_recv() {
            ended |= self.apply_notice(notice)?;
        }
        Ok(ended)
    }

    /// Like [`Controller::pump`], but wait up to `timeout` for the first notice
    pub fn pump_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let ended = match self.notices.recv_timeout(timeout) {
            Ok(notice) => self.apply_notice(notice)?,
            Err(_) => false,
        };
        Ok(self.pump()? || ended)
    }

    /// Make `data` (and its index, rebuilt if missing) the current capture
    pub fn load(&mut self, data: &Path) -> Result<&Capture> {
        self.require_stopped()?;

        let files = CaptureFiles::for_data(data);
        if !files.has_index() {
            info!("No index for {}, rebuilding", files.data.display());
            build_index_file(&files)?;
        }
        let records = files.read_records()?;
        info!("Loaded {} with {} records", files.data.display(), records.len());

        self.discard_capture();
        self.cursor = None;
        let capture = self.capture.insert(Capture::new(files, records));
        self.machine.set_loaded(!capture.is_empty());
        Ok(&*capture)
    }

    /// Copy the current capture to `data` and switch to the copy
    pub fn save(&mut self, data: &Path) -> Result<CaptureFiles> {
        self.require_stopped()?;
        let capture = self.capture.as_ref().ok_or(Error::NoCapture)?;

        let saved = capture.files().copy_to(data)?;
        let switched = capture.with_files(saved.clone());

        self.player = None;
        if let Some(previous) = self.capture.replace(switched) {
            // A pair saved in place is now the saved capture itself
            if previous.files().is_temporary() && !previous.files().same_files(&saved) {
                previous.files().remove();
            }
        }
        self.refresh_loaded();
        Ok(saved)
    }

    fn require_stopped(&self) -> Result<()> {
        match self.machine.state() {
            SessionState::Stopped => Ok(()),
            state => Err(Error::Busy(state)),
        }
    }

    /// Forget the current capture, deleting it if it was never saved
    fn discard_capture(&mut self) {
        self.player = None;
        if let Some(capture) = self.capture.take() {
            if capture.files().is_temporary() {
                capture.files().remove();
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.stop_engines() {
            warn!("Stopping engines: {}", e);
        }
        self.discard_capture();
    }
}
