//! Player/recorder session state machine.
//!
//! This is a pure state machine: [`transition`] maps a state and an event
//! to the next state plus the engine actions ([`Effect`]s) that entering
//! that state requires. Nothing here touches a socket or a file, so the
//! caller stays responsible for carrying out the effects in order.
//!
//! ```text
//!            record                 record-pause
//!  Stopped ─────────► Recording ─────────────────► RecordingPaused
//!    ▲  │ ▲               │  ▲        record (resume)      │
//!    │  │ │  record-stop  │  └───────────────────────────┘
//!    │  │ └───────────────┴──────────── record-stop ───────┘
//!    │  │ play / reverse-play / fast-forward / fast-reverse
//!    │  └──────────────────► Playing{,Fast,Reverse,FastReverse}
//!    └─────── pause / record-stop (natural end) ──────┘
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::error::InvalidTransition;

// =============================================================================
// States and events
// =============================================================================

/// Session state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
pub enum SessionState {
    Stopped,
    Recording,
    RecordingPaused,
    Playing,
    PlayingFast,
    PlayingFastReverse,
    PlayingReverse,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Stopped
    }
}

/// Discrete user (or engine) triggered events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SessionEvent {
    Begin,
    FastReverse,
    ReverseStep,
    ReversePlay,
    Pause,
    Play,
    Step,
    FastForward,
    End,
    Record,
    RecordPause,
    /// Also delivered when a replay run reaches its natural end
    RecordStop,
}

/// Direction and speed of a replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybackMode {
    pub reverse: bool,
    pub fast: bool,
}

impl PlaybackMode {
    pub const FORWARD: Self = Self {
        reverse: false,
        fast: false,
    };
    pub const FAST: Self = Self {
        reverse: false,
        fast: true,
    };
    pub const REVERSE: Self = Self {
        reverse: true,
        fast: false,
    };
    pub const FAST_REVERSE: Self = Self {
        reverse: true,
        fast: true,
    };
}

/// The engine a state implies is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Grabber,
    Player,
}

bitflags! {
    /// Controls of the player/recorder surface
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Controls: u16 {
        const LOAD = 1 << 0;
        const BEGIN = 1 << 1;
        const FAST_REVERSE = 1 << 2;
        const REVERSE_STEP = 1 << 3;
        const REVERSE_PLAY = 1 << 4;
        const PAUSE = 1 << 5;
        const PLAY = 1 << 6;
        const STEP = 1 << 7;
        const FAST_FORWARD = 1 << 8;
        const END = 1 << 9;
        const LOOP = 1 << 10;
        const RECORD = 1 << 11;
        const RECORD_STOP = 1 << 12;
        const RECORD_PAUSE = 1 << 13;
        const SAVE = 1 << 14;

        /// Everything that moves through a loaded capture while stopped
        const TRANSPORT = Self::BEGIN.bits()
            | Self::FAST_REVERSE.bits()
            | Self::REVERSE_STEP.bits()
            | Self::REVERSE_PLAY.bits()
            | Self::PLAY.bits()
            | Self::STEP.bits()
            | Self::FAST_FORWARD.bits()
            | Self::END.bits();
    }
}

impl Controls {
    /// The control that raises `event`
    pub fn for_event(event: SessionEvent) -> Controls {
        match event {
            SessionEvent::Begin => Controls::BEGIN,
            SessionEvent::FastReverse => Controls::FAST_REVERSE,
            SessionEvent::ReverseStep => Controls::REVERSE_STEP,
            SessionEvent::ReversePlay => Controls::REVERSE_PLAY,
            SessionEvent::Pause => Controls::PAUSE,
            SessionEvent::Play => Controls::PLAY,
            SessionEvent::Step => Controls::STEP,
            SessionEvent::FastForward => Controls::FAST_FORWARD,
            SessionEvent::End => Controls::END,
            SessionEvent::Record => Controls::RECORD,
            SessionEvent::RecordPause => Controls::RECORD_PAUSE,
            SessionEvent::RecordStop => Controls::RECORD_STOP,
        }
    }
}

impl SessionState {
    /// Check if a replay run is active
    pub fn is_playing(&self) -> bool {
        matches!(
            self,
            SessionState::Playing
                | SessionState::PlayingFast
                | SessionState::PlayingFastReverse
                | SessionState::PlayingReverse
        )
    }

    /// Check if a capture is open (running or paused)
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionState::Recording | SessionState::RecordingPaused)
    }

    /// Replay direction and speed, for playing states
    pub fn playback_mode(&self) -> Option<PlaybackMode> {
        match self {
            SessionState::Playing => Some(PlaybackMode::FORWARD),
            SessionState::PlayingFast => Some(PlaybackMode::FAST),
            SessionState::PlayingFastReverse => Some(PlaybackMode::FAST_REVERSE),
            SessionState::PlayingReverse => Some(PlaybackMode::REVERSE),
            _ => None,
        }
    }

    /// The one engine this state implies is active
    pub fn active_engine(&self) -> Option<Engine> {
        if self.is_recording() {
            Some(Engine::Grabber)
        } else if self.is_playing() {
            Some(Engine::Player)
        } else {
            None
        }
    }

    /// Enabled controls. `loaded` is whether a non-empty capture is loaded.
    pub fn controls(&self, loaded: bool) -> Controls {
        match self {
            SessionState::Stopped => {
                let mut controls = Controls::LOAD | Controls::RECORD;
                if loaded {
                    controls |= Controls::TRANSPORT | Controls::LOOP | Controls::SAVE;
                }
                controls
            }
            SessionState::Recording => Controls::RECORD_PAUSE | Controls::RECORD_STOP,
            SessionState::RecordingPaused => Controls::RECORD | Controls::RECORD_STOP,
            _ => Controls::PAUSE | Controls::LOOP,
        }
    }

    /// Short status text for a display
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Stopped => "idle",
            SessionState::Recording => "recording",
            SessionState::RecordingPaused => "paused",
            SessionState::Playing => "playback",
            SessionState::PlayingFast => "fast play",
            SessionState::PlayingFastReverse => "rev fast play",
            SessionState::PlayingReverse => "reverse play",
        }
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// Engine action requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Stop whichever engine is running
    StopEngines,
    /// Open a fresh capture session and start receiving
    StartCapture,
    ResumeCapture,
    PauseCapture,
    /// Start a replay run at the playback cursor
    StartPlayback(PlaybackMode),
    /// Move the playback cursor to the first record
    SeekFirst,
    /// Move the playback cursor to the last record
    SeekLast,
    /// Send the record under the cursor and move on
    Step { reverse: bool },
}

/// Outcome of a valid event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    /// Stay in `state` and only run `effect`
    fn stay(state: SessionState, effect: Effect) -> Self {
        Self {
            state,
            effects: vec![effect],
        }
    }

    /// Enter `state`, running its entry action
    fn enter(state: SessionState) -> Self {
        let effect = match state {
            SessionState::Stopped => Effect::StopEngines,
            SessionState::Recording => Effect::StartCapture,
            SessionState::RecordingPaused => Effect::PauseCapture,
            playing => match playing.playback_mode() {
                Some(mode) => Effect::StartPlayback(mode),
                None => Effect::StopEngines,
            },
        };
        Self {
            state,
            effects: vec![effect],
        }
    }

    /// Re-enter `Recording` from `RecordingPaused`
    fn resume_recording() -> Self {
        Self {
            state: SessionState::Recording,
            effects: vec![Effect::ResumeCapture],
        }
    }
}

/// Apply `event` in `state`.
///
/// Events missing from the transition table return [`InvalidTransition`];
/// they are never silently ignored.
pub fn transition(state: SessionState, event: SessionEvent) -> Result<Transition, InvalidTransition> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        (S::Stopped, E::Begin) => Transition::stay(S::Stopped, Effect::SeekFirst),
        (S::Stopped, E::End) => Transition::stay(S::Stopped, Effect::SeekLast),
        (S::Stopped, E::Step) => Transition::stay(S::Stopped, Effect::Step { reverse: false }),
        (S::Stopped, E::ReverseStep) => Transition::stay(S::Stopped, Effect::Step { reverse: true }),
        (S::Stopped, E::Play) => Transition::enter(S::Playing),
        (S::Stopped, E::ReversePlay) => Transition::enter(S::PlayingReverse),
        (S::Stopped, E::FastForward) => Transition::enter(S::PlayingFast),
        (S::Stopped, E::FastReverse) => Transition::enter(S::PlayingFastReverse),
        (S::Stopped, E::Record) => Transition::enter(S::Recording),

        (S::Recording, E::RecordPause) => Transition::enter(S::RecordingPaused),
        (S::RecordingPaused, E::Record) => Transition::resume_recording(),

        // Stopped accepts record-stop too: it resets the controls after a load
        (_, E::RecordStop) => Transition::enter(S::Stopped),
        (playing, E::Pause) if playing.is_playing() => Transition::enter(S::Stopped),

        _ => return Err(InvalidTransition { state, event }),
    };

    Ok(next)
}

// =============================================================================
// Session Machine
// =============================================================================

/// Current session state plus whether a capture is loaded.
///
/// Like [`transition`], this performs no I/O; the caller applies the
/// returned effects to the capture and replay engines.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: SessionState,
    loaded: bool,
}

impl SessionMachine {
    /// Create a machine in `Stopped` with nothing loaded.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Record whether a non-empty capture is loaded.
    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Controls enabled right now.
    pub fn controls(&self) -> Controls {
        self.state.controls(self.loaded)
    }

    /// Check if `event` is in the transition table for the current state.
    pub fn accepts(&self, event: SessionEvent) -> bool {
        transition(self.state, event).is_ok()
    }

    /// Apply `event`, returning the effects the caller must perform.
    ///
    /// On error the state is left unchanged.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Vec<Effect>, InvalidTransition> {
        let next = transition(self.state, event)?;
        self.state = next.state;
        Ok(next.effects)
    }

    /// Return to `Stopped` without running entry effects.
    ///
    /// Used after an effect failed and the caller already stopped the engines.
    pub fn force_stopped(&mut self) {
        self.state = SessionState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use strum::IntoEnumIterator;

    use SessionEvent as E;
    use SessionState as S;

    #[test]
    fn test_stopped_row() {
        let cases = [
            (E::Begin, S::Stopped, Effect::SeekFirst),
            (E::Step, S::Stopped, Effect::Step { reverse: false }),
            (E::ReverseStep, S::Stopped, Effect::Step { reverse: true }),
            (E::Play, S::Playing, Effect::StartPlayback(PlaybackMode::FORWARD)),
            (E::ReversePlay, S::PlayingReverse, Effect::StartPlayback(PlaybackMode::REVERSE)),
            (E::FastForward, S::PlayingFast, Effect::StartPlayback(PlaybackMode::FAST)),
            (
                E::FastReverse,
                S::PlayingFastReverse,
                Effect::StartPlayback(PlaybackMode::FAST_REVERSE),
            ),
            (E::End, S::Stopped, Effect::SeekLast),
            (E::Record, S::Recording, Effect::StartCapture),
            (E::RecordStop, S::Stopped, Effect::StopEngines),
        ];

        for (event, state, effect) in cases {
            let t = transition(S::Stopped, event).unwrap();
            assert_eq!(t.state, state, "{event}");
            assert_eq!(t.effects, vec![effect], "{event}");
        }

        for event in [E::Pause, E::RecordPause] {
            assert_eq!(
                transition(S::Stopped, event),
                Err(InvalidTransition {
                    state: S::Stopped,
                    event
                })
            );
        }
    }

    #[test]
    fn test_recording_rows() {
        let t = transition(S::Recording, E::RecordPause).unwrap();
        assert_eq!(t.state, S::RecordingPaused);
        assert_eq!(t.effects, vec![Effect::PauseCapture]);

        let t = transition(S::RecordingPaused, E::Record).unwrap();
        assert_eq!(t.state, S::Recording);
        assert_eq!(t.effects, vec![Effect::ResumeCapture]);

        for state in [S::Recording, S::RecordingPaused] {
            let t = transition(state, E::RecordStop).unwrap();
            assert_eq!(t.state, S::Stopped);
            assert_eq!(t.effects, vec![Effect::StopEngines]);
        }

        let recording_ok = [E::RecordPause, E::RecordStop];
        let paused_ok = [E::Record, E::RecordStop];
        for event in SessionEvent::iter() {
            assert_eq!(transition(S::Recording, event).is_ok(), recording_ok.contains(&event));
            assert_eq!(transition(S::RecordingPaused, event).is_ok(), paused_ok.contains(&event));
        }
    }

    #[test]
    fn test_playing_rows() {
        for state in SessionState::iter().filter(SessionState::is_playing) {
            for event in SessionEvent::iter() {
                let result = transition(state, event);
                match event {
                    E::Pause | E::RecordStop => {
                        let t = result.unwrap();
                        assert_eq!(t.state, S::Stopped);
                        assert_eq!(t.effects, vec![Effect::StopEngines]);
                    }
                    _ => assert_eq!(result, Err(InvalidTransition { state, event })),
                }
            }
        }
    }

    #[test]
    fn test_invalid_event_leaves_state() {
        let mut machine = SessionMachine::new();
        machine.handle(E::Record).unwrap();

        let err = machine.handle(E::Play).unwrap_err();
        assert_eq!(err.state, S::Recording);
        assert_eq!(err.event, E::Play);
        assert_eq!(machine.state(), S::Recording);
        assert_eq!(
            err.to_string(),
            "Program error in session state machine: got play in Recording"
        );
    }

    #[test]
    fn test_controls() {
        assert_eq!(S::Stopped.controls(false), Controls::LOAD | Controls::RECORD);
        assert!(S::Stopped.controls(true).contains(Controls::TRANSPORT | Controls::SAVE));
        assert!(!S::Stopped.controls(true).contains(Controls::PAUSE));
        assert!(!S::Stopped.controls(true).intersects(Controls::RECORD_PAUSE | Controls::RECORD_STOP));
        assert_eq!(S::Recording.controls(true), Controls::RECORD_PAUSE | Controls::RECORD_STOP);
        assert_eq!(S::RecordingPaused.controls(true), Controls::RECORD | Controls::RECORD_STOP);
        assert_eq!(S::PlayingReverse.controls(true), Controls::PAUSE | Controls::LOOP);
    }

    #[test]
    fn test_enabled_controls_only_raise_valid_events() {
        for state in SessionState::iter() {
            for loaded in [false, true] {
                let controls = state.controls(loaded);
                for event in SessionEvent::iter() {
                    if controls.contains(Controls::for_event(event)) {
                        assert!(
                            transition(state, event).is_ok(),
                            "{event} enabled in {state} but rejected"
                        );
                    }
                }
            }
        }
    }

    /// Walk every reachable (state, running engines) pair and check that the
    /// effects never leave both engines running, and that the running engine
    /// is always the one the state implies.
    #[test]
    fn test_engine_exclusivity() {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        struct Node {
            state: SessionState,
            grabber: bool,
            player: bool,
        }

        let start = Node {
            state: S::Stopped,
            grabber: false,
            player: false,
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            for event in SessionEvent::iter() {
                let Ok(t) = transition(node.state, event) else {
                    continue;
                };
                let mut next = Node {
                    state: t.state,
                    ..node
                };
                for effect in &t.effects {
                    match effect {
                        Effect::StopEngines => {
                            next.grabber = false;
                            next.player = false;
                        }
                        Effect::StartCapture => {
                            assert!(!next.player, "capture started during playback");
                            next.grabber = true;
                        }
                        Effect::ResumeCapture | Effect::PauseCapture => assert!(next.grabber),
                        Effect::StartPlayback(_) => {
                            assert!(!next.grabber, "playback started during capture");
                            next.player = true;
                        }
                        Effect::Step { .. } => assert!(!next.grabber && !next.player),
                        Effect::SeekFirst | Effect::SeekLast => {}
                    }
                }

                assert!(!(next.grabber && next.player));
                let expected = next.state.active_engine();
                assert_eq!(next.grabber, expected == Some(Engine::Grabber));
                assert_eq!(next.player, expected == Some(Engine::Player));

                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let states: HashSet<_> = seen.iter().map(|n| n.state).collect();
        assert_eq!(states.len(), SessionState::iter().count());
    }

    #[test]
    fn test_force_stopped() {
        let mut machine = SessionMachine::new();
        machine.handle(E::FastForward).unwrap();
        assert_eq!(machine.state(), S::PlayingFast);

        machine.force_stopped();
        assert_eq!(machine.state(), S::Stopped);
        assert!(machine.accepts(E::Record));
    }

    #[test]
    fn test_labels() {
        assert_eq!(S::Stopped.label(), "idle");
        assert_eq!(S::PlayingFastReverse.label(), "rev fast play");
        assert_eq!(E::RecordStop.to_string(), "record-stop");
        assert_eq!(S::RecordingPaused.to_string(), "RecordingPaused");
    }
}
