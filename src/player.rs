use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{sleep, spawn, JoinHandle},
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::presets::PresetIndex;

/// Longest time the step loop sleeps before re-checking for pause/stop
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Floor for a single step, so a looping sequence of zero-length steps cannot spin
pub const MIN_STEP_DURATION: Duration = Duration::from_millis(10);
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

fn default_loop() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceStep {
    /// Scene coordinates `(x, y)` switched on for this step
    pub scenes: Vec<(u8, u8)>,
    /// Seconds
    pub duration: f64,
    #[serde(default)]
    pub name: String,
}

impl SequenceStep {
    pub fn new(scenes: Vec<(u8, u8)>, duration: f64, name: &str) -> Self {
        SequenceStep {
            scenes,
            duration,
            name: String::from(name),
        }
    }

    /// Saturates at `Duration::MAX` for values too large to represent
    pub fn duration(&self) -> Duration {
        if self.duration.is_finite() && self.duration > 0.0 {
            Duration::try_from_secs_f64(self.duration).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub steps: Vec<SequenceStep>,
    #[serde(default = "default_loop")]
    pub loop_playback: bool,
}

impl Sequence {
    pub fn new(steps: Vec<SequenceStep>) -> Self {
        Sequence {
            steps,
            loop_playback: true,
        }
    }

    /// Two or more steps make a sequence eligible for timed playback
    pub fn is_animated(&self) -> bool {
        self.steps.len() >= 2
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Outbound notifications; `run` identifies the `start()` call that produced them
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StepChanged {
        run: u64,
        preset: PresetIndex,
        step_index: usize,
        scenes: Vec<(u8, u8)>,
    },
    Completed {
        run: u64,
        preset: PresetIndex,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    pub preset: PresetIndex,
    pub step_index: usize,
    pub total_steps: usize,
    pub step_name: String,
    pub scenes: Vec<(u8, u8)>,
    pub duration: Duration,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub state: PlaybackState,
}

struct Playback {
    state: PlaybackState,
    run: u64,
    preset: Option<PresetIndex>,
    sequence: Option<Arc<Sequence>>,
    step_index: usize,
    step_started: Option<Instant>,
    paused_at: Option<Instant>,
    loop_enabled: bool,
}

impl Playback {
    fn reset(&mut self) {
        self.state = PlaybackState::Stopped;
        self.preset = None;
        self.sequence = None;
        self.step_index = 0;
        self.step_started = None;
        self.paused_at = None;
    }
}

struct Shared {
    playback: Mutex<Playback>,
    wake: Condvar,
    events: Mutex<Sender<PlayerEvent>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Playback>,
        timeout: Duration,
    ) -> MutexGuard<'a, Playback> {
        match self.wake.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let tx = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(event).is_err() {
            debug!("Player event dropped; nobody is listening");
        }
    }

    /// Announce the current step and start its clock. Called with the lock held so
    /// that step events are always emitted in index order.
    fn enter_step(&self, playback: &mut Playback, run: u64) -> bool {
        let (Some(preset), Some(sequence)) = (playback.preset, playback.sequence.clone()) else {
            return false;
        };
        let Some(step) = sequence.steps.get(playback.step_index) else {
            error!("Invalid step index {}", playback.step_index);
            return false;
        };
        debug!(
            "Playing step {}/{} of preset {} for {}s with {} scenes",
            playback.step_index + 1,
            sequence.steps.len(),
            preset,
            step.duration,
            step.scenes.len()
        );
        playback.step_started = Some(Instant::now());
        self.emit(PlayerEvent::StepChanged {
            run,
            preset,
            step_index: playback.step_index,
            scenes: step.scenes.clone(),
        });
        true
    }
}

/// Plays at most one multi-step preset at a time on its own thread.
///
/// Also keeps the library of sequences, keyed by preset index.
pub struct SequencePlayer {
    shared: Arc<Shared>,
    library: Mutex<IndexMap<PresetIndex, Arc<Sequence>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequencePlayer {
    pub fn new() -> (SequencePlayer, Receiver<PlayerEvent>) {
        let (tx, rx) = mpsc::channel();
        let player = SequencePlayer {
            shared: Arc::new(Shared {
                playback: Mutex::new(Playback {
                    state: PlaybackState::Stopped,
                    run: 0,
                    preset: None,
                    sequence: None,
                    step_index: 0,
                    step_started: None,
                    paused_at: None,
                    loop_enabled: true,
                }),
                wake: Condvar::new(),
                events: Mutex::new(tx),
            }),
            library: Mutex::new(IndexMap::new()),
            worker: Mutex::new(None),
        };
        (player, rx)
    }

    fn library(&self) -> MutexGuard<'_, IndexMap<PresetIndex, Arc<Sequence>>> {
        self.library.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_sequence(&self, preset: PresetIndex, sequence: Sequence) {
        debug!(
            "Added sequence for preset {} with {} steps",
            preset,
            sequence.steps.len()
        );
        self.library().insert(preset, Arc::new(sequence));
    }

    /// Stops playback first if this sequence is the one playing
    pub fn remove_sequence(&self, preset: PresetIndex) -> bool {
        if self.current_preset() == Some(preset) {
            self.stop();
        }
        let removed = self.library().shift_remove(&preset).is_some();
        if removed {
            debug!("Removed sequence for preset {}", preset);
        }
        removed
    }

    pub fn sequence(&self, preset: PresetIndex) -> Option<Arc<Sequence>> {
        self.library().get(&preset).cloned()
    }

    pub fn has_animation(&self, preset: PresetIndex) -> bool {
        self.library()
            .get(&preset)
            .map(|s| s.is_animated())
            .unwrap_or(false)
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.shared.lock().loop_enabled = enabled;
        debug!(
            "Sequence looping {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    pub fn current_preset(&self) -> Option<PresetIndex> {
        self.shared.lock().preset
    }

    /// Identifier of the most recent `start()`/`stop()`; events carrying any other
    /// run id are stale.
    pub fn current_run(&self) -> u64 {
        self.shared.lock().run
    }

    /// Begin playing from the first step. Any sequence already playing is fully
    /// stopped (and its thread joined) first.
    pub fn start(&self, preset: PresetIndex) -> bool {
        let Some(sequence) = self.sequence(preset) else {
            warn!("No sequence found for preset {}", preset);
            return false;
        };
        if sequence.steps.is_empty() {
            warn!("Sequence for preset {} has no steps", preset);
            return false;
        }

        self.stop();

        let run = {
            let mut playback = self.shared.lock();
            playback.run += 1;
            playback.state = PlaybackState::Playing;
            playback.preset = Some(preset);
            playback.sequence = Some(sequence);
            playback.step_index = 0;
            playback.step_started = None;
            playback.paused_at = None;
            playback.run
        };

        let shared = self.shared.clone();
        let handle = spawn(move || step_loop(shared, run));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!("Started sequence for preset {}", preset);
        true
    }

    /// Idempotent. Blocks for at most the join timeout; the state is `Stopped`
    /// afterwards even if the thread did not exit in time.
    pub fn stop(&self) {
        let was_active = {
            let mut playback = self.shared.lock();
            let was_active = playback.state != PlaybackState::Stopped;
            playback.run += 1;
            playback.reset();
            was_active
        };
        self.shared.wake.notify_all();

        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            join_with_timeout(handle, JOIN_TIMEOUT);
        }

        if was_active {
            info!("Sequence stopped");
        }
    }

    pub fn pause(&self) -> bool {
        let mut playback = self.shared.lock();
        if playback.state != PlaybackState::Playing {
            return false;
        }
        playback.state = PlaybackState::Paused;
        playback.paused_at = Some(Instant::now());
        drop(playback);
        self.shared.wake.notify_all();
        debug!("Sequence paused");
        true
    }

    pub fn resume(&self) -> bool {
        let mut playback = self.shared.lock();
        if playback.state != PlaybackState::Paused {
            return false;
        }
        // Shifting the start by the paused time pushes the step's end back by the same amount
        if let (Some(paused_at), Some(started)) = (playback.paused_at, playback.step_started) {
            playback.step_started = Some(started + paused_at.elapsed());
        }
        playback.paused_at = None;
        playback.state = PlaybackState::Playing;
        drop(playback);
        self.shared.wake.notify_all();
        debug!("Sequence resumed");
        true
    }

    /// Skip to the next step right away (wrapping), restarting its clock. The
    /// background loop picks up the new index on its next poll.
    pub fn advance_step(&self) -> bool {
        let mut playback = self.shared.lock();
        if playback.state == PlaybackState::Stopped {
            warn!("Cannot advance a stopped sequence");
            return false;
        }
        let Some(sequence) = playback.sequence.clone() else {
            warn!("No active sequence to advance");
            return false;
        };
        if sequence.steps.len() <= 1 {
            debug!("Sequence has only one step, cannot advance");
            return false;
        }

        playback.step_index = (playback.step_index + 1) % sequence.steps.len();
        let run = playback.run;
        self.shared.enter_step(&mut playback, run);
        if playback.state == PlaybackState::Paused {
            playback.paused_at = playback.step_started;
        }
        drop(playback);
        self.shared.wake.notify_all();
        true
    }

    pub fn current_step_info(&self) -> Option<StepInfo> {
        let playback = self.shared.lock();
        let preset = playback.preset?;
        let sequence = playback.sequence.as_ref()?;
        let step = sequence.steps.get(playback.step_index)?;

        let elapsed = match playback.step_started {
            Some(started) => playback
                .paused_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(started),
            None => Duration::ZERO,
        };
        let duration = step.duration();

        Some(StepInfo {
            preset,
            step_index: playback.step_index,
            total_steps: sequence.steps.len(),
            step_name: step.name.clone(),
            scenes: step.scenes.clone(),
            duration,
            elapsed,
            remaining: duration.saturating_sub(elapsed),
            state: playback.state,
        })
    }
}

impl Drop for SequencePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!(
                "Sequence thread did not stop within {:?}; detaching it",
                timeout
            );
            return;
        }
        sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        error!("Sequence thread panicked");
    }
}

fn step_loop(shared: Arc<Shared>, run: u64) {
    let mut playback = shared.lock();
    if playback.run == run && !shared.enter_step(&mut playback, run) {
        playback.reset();
    }

    loop {
        if playback.run != run || playback.state == PlaybackState::Stopped {
            break;
        }
        if playback.state == PlaybackState::Paused {
            playback = shared.wait(playback, POLL_INTERVAL);
            continue;
        }

        let Some(sequence) = playback.sequence.clone() else {
            break;
        };
        let Some(step) = sequence.steps.get(playback.step_index) else {
            error!("Invalid step index {}", playback.step_index);
            playback.reset();
            break;
        };

        let started = *playback.step_started.get_or_insert_with(Instant::now);
        // A deadline past what `Instant` can hold never arrives
        let Some(deadline) = started.checked_add(step.duration().max(MIN_STEP_DURATION)) else {
            playback = shared.wait(playback, POLL_INTERVAL);
            continue;
        };
        let now = Instant::now();
        if now < deadline {
            playback = shared.wait(playback, (deadline - now).min(POLL_INTERVAL));
            continue;
        }

        let next = playback.step_index + 1;
        if next < sequence.steps.len() {
            playback.step_index = next;
        } else if playback.loop_enabled && sequence.loop_playback {
            debug!("Looping sequence for preset {:?}", playback.preset);
            playback.step_index = 0;
        } else {
            let preset = playback.preset;
            playback.reset();
            if let Some(preset) = preset {
                info!("Sequence for preset {} completed (no loop)", preset);
                shared.emit(PlayerEvent::Completed { run, preset });
            }
            break;
        }
        shared.enter_step(&mut playback, run);
    }

    debug!("Sequence loop ended (run {})", run);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_steps(first: f64, second: f64) -> Sequence {
        Sequence::new(vec![
            SequenceStep::new(vec![(0, 0)], first, "A"),
            SequenceStep::new(vec![(1, 0), (2, 0)], second, "B"),
        ])
    }

    fn next_event(rx: &Receiver<PlayerEvent>) -> PlayerEvent {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("player event within timeout")
    }

    fn step_of(event: &PlayerEvent) -> Option<usize> {
        match event {
            PlayerEvent::StepChanged { step_index, .. } => Some(*step_index),
            PlayerEvent::Completed { .. } => None,
        }
    }

    #[test]
    fn start_without_sequence_fails() {
        let (player, _rx) = SequencePlayer::new();
        assert!(!player.start(3));
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(player.current_step_info().is_none());
    }

    #[test]
    fn pause_resume_only_from_matching_state() {
        let (player, _rx) = SequencePlayer::new();
        assert!(!player.pause());
        assert!(!player.resume());
        assert!(!player.advance_step());

        player.add_sequence(1, two_steps(5.0, 5.0));
        assert!(player.start(1));
        assert!(!player.resume());
        assert!(player.pause());
        assert!(!player.pause());
        assert_eq!(player.state(), PlaybackState::Paused);
        assert!(player.resume());
        assert_eq!(player.state(), PlaybackState::Playing);
        player.stop();
    }

    #[test]
    fn first_step_is_announced_with_scenes() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(4, two_steps(5.0, 5.0));
        player.start(4);
        let run = player.current_run();
        assert_eq!(
            next_event(&rx),
            PlayerEvent::StepChanged {
                run,
                preset: 4,
                step_index: 0,
                scenes: vec![(0, 0)],
            }
        );
        player.stop();
    }

    #[test]
    fn pause_preserves_step_duration() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(0.3, 0.3));
        let begin = Instant::now();
        player.start(0);
        assert_eq!(step_of(&next_event(&rx)), Some(0));

        sleep(Duration::from_millis(100));
        assert!(player.pause());
        sleep(Duration::from_millis(400));
        assert!(rx.try_recv().is_err(), "no step change while paused");
        assert!(player.resume());

        assert_eq!(step_of(&next_event(&rx)), Some(1));
        let wall = begin.elapsed();
        assert!(wall >= Duration::from_millis(690), "too early: {:?}", wall);
        assert!(wall <= Duration::from_millis(950), "too late: {:?}", wall);
        player.stop();
    }

    #[test]
    fn elapsed_is_frozen_while_paused() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(5.0, 5.0));
        player.start(0);
        next_event(&rx);
        sleep(Duration::from_millis(50));
        player.pause();
        let first = player.current_step_info().unwrap();
        sleep(Duration::from_millis(50));
        let second = player.current_step_info().unwrap();
        assert_eq!(first.elapsed, second.elapsed);
        assert_eq!(first.step_index, second.step_index);
        assert_eq!(second.state, PlaybackState::Paused);
        assert_eq!(second.total_steps, 2);
        assert_eq!(second.step_name, "A");
        assert!(second.remaining < Duration::from_secs(5));
        player.stop();
    }

    #[test]
    fn without_loop_completion_fires_once() {
        let (player, rx) = SequencePlayer::new();
        player.set_loop_enabled(false);
        player.add_sequence(2, two_steps(0.05, 0.05));
        player.start(2);
        let run = player.current_run();

        assert_eq!(step_of(&next_event(&rx)), Some(0));
        assert_eq!(step_of(&next_event(&rx)), Some(1));
        assert_eq!(
            next_event(&rx),
            PlayerEvent::Completed { run, preset: 2 }
        );
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(player.current_preset().is_none());

        sleep(Duration::from_millis(150));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn with_loop_steps_cycle_until_stopped() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(2, two_steps(0.03, 0.03));
        player.start(2);

        let steps: Vec<Option<usize>> = (0..5).map(|_| step_of(&next_event(&rx))).collect();
        assert_eq!(steps, vec![Some(0), Some(1), Some(0), Some(1), Some(0)]);

        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        while let Ok(event) = rx.try_recv() {
            assert!(step_of(&event).is_some(), "no completion when looping");
        }
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(30.0, 30.0));
        player.start(0);
        next_event(&rx);

        let begin = Instant::now();
        player.stop();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert_eq!(player.state(), PlaybackState::Stopped);
        player.stop();
        assert!(player.current_step_info().is_none());
    }

    #[test]
    fn starting_another_sequence_replaces_the_first() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(30.0, 30.0));
        player.add_sequence(1, two_steps(30.0, 30.0));
        player.start(0);
        let first_run = player.current_run();
        next_event(&rx);

        player.start(1);
        let second_run = player.current_run();
        assert_ne!(first_run, second_run);
        match next_event(&rx) {
            PlayerEvent::StepChanged { run, preset, .. } => {
                assert_eq!(run, second_run);
                assert_eq!(preset, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(player.current_preset(), Some(1));
        player.stop();
    }

    #[test]
    fn advance_step_fires_immediately_and_wraps() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(30.0, 30.0));
        player.start(0);
        next_event(&rx);

        assert!(player.advance_step());
        assert_eq!(step_of(&rx.try_recv().unwrap()), Some(1));
        let info = player.current_step_info().unwrap();
        assert_eq!(info.step_index, 1);
        assert!(info.remaining > Duration::from_secs(29));

        assert!(player.advance_step());
        assert_eq!(step_of(&rx.try_recv().unwrap()), Some(0));
        player.stop();
    }

    #[test]
    fn huge_step_durations_keep_the_player_alive() {
        let step = SequenceStep::new(vec![], 1e20, "");
        assert_eq!(step.duration(), Duration::MAX);

        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, two_steps(1e20, 1e20));
        player.start(0);
        next_event(&rx);
        sleep(Duration::from_millis(100));

        assert_eq!(player.state(), PlaybackState::Playing);
        let info = player.current_step_info().unwrap();
        assert_eq!(info.duration, Duration::MAX);

        assert!(player.advance_step());
        assert_eq!(step_of(&next_event(&rx)), Some(1));
        let begin = Instant::now();
        player.stop();
        assert!(begin.elapsed() < Duration::from_millis(500));
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn advance_needs_more_than_one_step() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(0, Sequence::new(vec![SequenceStep::new(vec![], 1.0, "")]));
        player.start(0);
        next_event(&rx);
        assert!(!player.advance_step());
        player.stop();
    }

    #[test]
    fn removing_the_playing_sequence_stops_it() {
        let (player, rx) = SequencePlayer::new();
        player.add_sequence(5, two_steps(30.0, 30.0));
        assert!(player.has_animation(5));
        player.start(5);
        next_event(&rx);
        assert!(player.remove_sequence(5));
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(!player.remove_sequence(5));
        assert!(!player.has_animation(5));
    }
}
