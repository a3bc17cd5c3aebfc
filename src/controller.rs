use std::{
    collections::{BTreeSet, HashMap},
    sync::{mpsc::Receiver, Arc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    command::{ButtonEvent, ButtonKind, CommandQueue, CommandSender, ControllerCommand},
    midi::ConnectionMonitor,
    output::{LampOutput, SceneTrigger},
    player::{PlaybackState, PlayerEvent, SequencePlayer, SequenceStep},
    presets::{PresetIndex, PresetRegistry, DEFAULT_STEP_SECONDS},
    project::Project,
    scenes::{SceneIndex, SceneRegistry},
    settings::Config,
};

/// What a press in the preset block does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Normal,
    /// Record the live scenes as a one-step preset
    Save,
    /// Append the live scenes as a new step
    SaveShift,
}

/// The single consumer of the command queue. Owns the registries and the player
/// and applies everything on the dispatch thread.
pub struct Controller {
    queue: CommandQueue,
    dispatcher: Dispatcher,
    tick: Duration,
}

struct Dispatcher {
    config: Config,
    scenes: Arc<SceneRegistry>,
    presets: Arc<PresetRegistry>,
    player: Arc<SequencePlayer>,
    player_events: Receiver<PlayerEvent>,
    lamp: Arc<dyn LampOutput>,
    trigger: Arc<dyn SceneTrigger>,
    monitor: Arc<ConnectionMonitor>,
    mode: AppMode,
    pilot_enabled: bool,
    project_path: Option<String>,
    control_lamps: HashMap<(u8, u8), u8>,
    last_ping: Option<Instant>,
    software_connected: Option<bool>,
}

impl Controller {
    pub fn new(
        config: Config,
        lamp: Arc<dyn LampOutput>,
        trigger: Arc<dyn SceneTrigger>,
        project_path: Option<String>,
        tick: Duration,
    ) -> anyhow::Result<Controller> {
        config.validate()?;

        let scenes = Arc::new(SceneRegistry::new(
            config.columns,
            config.scene_rows(),
            lamp.clone(),
            trigger.clone(),
        ));
        let (player, player_events) = SequencePlayer::new();
        let player = Arc::new(player);
        player.set_loop_enabled(config.loop_sequences);
        let presets = Arc::new(PresetRegistry::new(
            config.columns,
            config.preset_rows(),
            scenes.clone(),
            player.clone(),
            lamp.clone(),
        ));

        if let Some(path) = &project_path {
            presets.load_project(&Project::load(path));
        }

        Ok(Controller {
            queue: CommandQueue::new(),
            tick,
            dispatcher: Dispatcher {
                pilot_enabled: config.pilot_enabled,
                config,
                scenes,
                presets,
                player,
                player_events,
                lamp,
                trigger,
                monitor: Arc::new(ConnectionMonitor::default()),
                mode: AppMode::Normal,
                project_path,
                control_lamps: HashMap::new(),
                last_ping: None,
                software_connected: None,
            },
        })
    }

    pub fn sender(&self) -> CommandSender {
        self.queue.sender()
    }

    pub fn scenes(&self) -> Arc<SceneRegistry> {
        self.dispatcher.scenes.clone()
    }

    pub fn presets(&self) -> Arc<PresetRegistry> {
        self.dispatcher.presets.clone()
    }

    pub fn player(&self) -> Arc<SequencePlayer> {
        self.dispatcher.player.clone()
    }

    pub fn monitor(&self) -> Arc<ConnectionMonitor> {
        self.dispatcher.monitor.clone()
    }

    pub fn mode(&self) -> AppMode {
        self.dispatcher.mode
    }

    pub fn pilot_enabled(&self) -> bool {
        self.dispatcher.pilot_enabled
    }

    /// Push the full lamp state to the controller
    pub fn refresh(&mut self) {
        self.dispatcher.scenes.refresh_lamps();
        self.dispatcher.presets.refresh_lamps();
        self.dispatcher.control_lamps.clear();
        self.dispatcher.refresh_control_lamps();
    }

    /// One pass of the dispatch loop: queued commands first, then whatever the
    /// player has announced. Returns how much work was done.
    pub fn dispatch(&mut self) -> usize {
        let dispatcher = &mut self.dispatcher;
        let mut handled = self.queue.drain_all(|command| dispatcher.handle(command));
        handled += self.dispatcher.apply_player_events();
        if handled > 0 {
            self.dispatcher.refresh_control_lamps();
        }
        handled
    }

    pub fn update(&mut self) {
        let work_done = self.dispatch() > 0;
        self.dispatcher.check_connection(Instant::now());

        if !work_done {
            thread::sleep(self.tick);
        }
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down controller");
        self.dispatcher.player.stop();
        let bindings = self.dispatcher.config.key_bindings.all();
        let off = self.dispatcher.config.colours.off;
        for (_, at) in bindings {
            self.dispatcher.set_control_lamp(at, off);
        }
    }
}

impl Dispatcher {
    fn handle(&mut self, command: ControllerCommand) -> anyhow::Result<()> {
        match command {
            ControllerCommand::ToggleSetPlayback => self.toggle_playback(),
            ControllerCommand::NextStep => self.next_step(),
            ControllerCommand::Clear => self.clear(),
            ControllerCommand::ActivateSequence { index, pilot } => {
                if self.gated(pilot) {
                    return Ok(());
                }
                self.presets.activate_preset(index);
            }
            ControllerCommand::SaveSequence { index, sequence } => {
                if self.presets.save_sequence(index, sequence) {
                    self.persist()?;
                }
            }
            ControllerCommand::DeleteSequence { index } => {
                if self.presets.delete_sequence(index) {
                    self.persist()?;
                }
            }
            ControllerCommand::SwitchPilot { enabled } => {
                info!("Pilot {}", if enabled { "enabled" } else { "disabled" });
                self.pilot_enabled = enabled;
            }
            ControllerCommand::ActivateScenes { scenes, pilot } => {
                if self.gated(pilot) {
                    return Ok(());
                }
                self.show_scenes(&scenes);
            }
            ControllerCommand::ButtonEvent(event) => self.handle_button(event)?,
        }
        Ok(())
    }

    fn gated(&self, pilot: bool) -> bool {
        if pilot && !self.pilot_enabled {
            debug!("Pilot is off; ignoring automation command");
            return true;
        }
        false
    }

    fn handle_button(&mut self, event: ButtonEvent) -> anyhow::Result<()> {
        if !event.pressed {
            return Ok(());
        }
        match event.kind {
            ButtonKind::Scene => match self.scenes.scene_at(event.x, event.y) {
                Some(index) => {
                    self.scenes.toggle_scene(index);
                }
                None => warn!("No scene at ({},{})", event.x, event.y),
            },
            ButtonKind::Preset => match self.presets.preset_at(event.x, event.y) {
                Some(index) => self.handle_preset_button(index)?,
                None => warn!("No preset at ({},{})", event.x, event.y),
            },
            ButtonKind::Control => self.handle_control((event.x, event.y)),
        }
        Ok(())
    }

    fn handle_preset_button(&mut self, index: PresetIndex) -> anyhow::Result<()> {
        match self.mode {
            AppMode::Normal => {
                if !self.presets.is_programmed(index) {
                    debug!("Preset {} has no scenes yet", index + 1);
                }
                self.presets.activate_preset(index);
                return Ok(());
            }
            AppMode::Save => {
                let live: Vec<SceneIndex> = self.scenes.active_indices().into_iter().collect();
                self.presets.record_preset(index, &live);
            }
            AppMode::SaveShift => {
                let coordinates = self
                    .scenes
                    .active_indices()
                    .into_iter()
                    .filter_map(|s| self.scenes.coordinate_of(s))
                    .collect();
                self.presets.append_step(
                    index,
                    SequenceStep::new(coordinates, DEFAULT_STEP_SECONDS, ""),
                );
            }
        }

        self.mode = AppMode::Normal;
        if self.presets.active_preset() != Some(index) {
            self.presets.activate_preset(index);
        }
        self.persist()
    }

    fn handle_control(&mut self, at: (u8, u8)) {
        let keys = self.config.key_bindings.clone();
        if at == keys.save {
            self.toggle_mode(AppMode::Save);
        } else if at == keys.save_shift {
            self.toggle_mode(AppMode::SaveShift);
        } else if at == keys.playback_toggle {
            self.toggle_playback();
        } else if at == keys.next_step {
            self.next_step();
        } else if at == keys.clear {
            self.clear();
        } else if at == keys.pilot_toggle {
            self.pilot_enabled = !self.pilot_enabled;
            info!("Pilot toggled => {}", self.pilot_enabled);
        } else {
            debug!("Unbound control button ({},{})", at.0, at.1);
        }
    }

    fn toggle_mode(&mut self, mode: AppMode) {
        if self.mode == mode {
            self.mode = AppMode::Normal;
        } else {
            self.mode = mode;
            // Recording captures a still picture
            self.player.stop();
        }
        info!("Mode => {:?}", self.mode);
    }

    fn toggle_playback(&mut self) {
        match self.player.state() {
            PlaybackState::Playing => {
                self.player.pause();
            }
            PlaybackState::Paused => {
                self.player.resume();
            }
            PlaybackState::Stopped => match self.presets.active_preset() {
                Some(index) if self.presets.is_animated(index) => {
                    self.player.start(index);
                }
                _ => debug!("Nothing to play"),
            },
        }
    }

    fn next_step(&mut self) {
        if !self.player.advance_step() {
            return;
        }
        if let Some(step) = self.player.current_step_info() {
            info!(
                "Skipped to step {}/{} \"{}\" of preset {}",
                step.step_index + 1,
                step.total_steps,
                step.step_name,
                step.preset
            );
        }
    }

    fn clear(&mut self) {
        self.player.stop();
        self.presets.deactivate_current();
        self.scenes.deactivate_all();
        self.mode = AppMode::Normal;
        info!("Cleared all scenes");
    }

    /// Make the live scene set exactly `wanted`
    fn show_scenes(&mut self, wanted: &[SceneIndex]) {
        self.presets.deactivate_current();
        let wanted_set: BTreeSet<SceneIndex> = wanted.iter().copied().collect();
        let stale: Vec<SceneIndex> = self
            .scenes
            .active_indices()
            .difference(&wanted_set)
            .copied()
            .collect();
        self.scenes.deactivate_scenes(&stale);
        self.scenes.activate_scenes(wanted);
    }

    fn apply_player_events(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.player_events.try_recv() {
            count += 1;
            let current = self.player.current_run();
            match event {
                PlayerEvent::StepChanged {
                    run,
                    preset,
                    step_index,
                    scenes,
                } => {
                    if run != current {
                        debug!("Dropping stale step {} from run {}", step_index, run);
                        continue;
                    }
                    self.presets.apply_step(preset, &scenes);
                }
                PlayerEvent::Completed { run, preset } => {
                    if run == current {
                        info!("Sequence for preset {} finished", preset);
                    }
                }
            }
        }
        count
    }

    fn persist(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.project_path {
            Project::save(path, &self.presets.to_project())?;
        }
        Ok(())
    }

    fn set_control_lamp(&mut self, at: (u8, u8), velocity: u8) {
        if self.control_lamps.get(&at) != Some(&velocity) {
            self.lamp.set_control_lamp(at.0, at.1, velocity);
            self.control_lamps.insert(at, velocity);
        }
    }

    fn refresh_control_lamps(&mut self) {
        let keys = self.config.key_bindings.clone();
        let colours = self.config.colours.clone();
        let state = self.player.state();

        let save = if self.mode == AppMode::Save {
            colours.save_mode
        } else {
            colours.off
        };
        let save_shift = if self.mode == AppMode::SaveShift {
            colours.save_shift_mode
        } else {
            colours.off
        };
        let playback = match state {
            PlaybackState::Playing => colours.playback_playing,
            PlaybackState::Paused => colours.playback_paused,
            PlaybackState::Stopped => colours.off,
        };
        let next_step = if state == PlaybackState::Stopped {
            colours.off
        } else {
            colours.next_step
        };
        let clear = if self.scenes.has_active() {
            colours.scene_on
        } else {
            colours.off
        };
        let pilot = if self.pilot_enabled {
            colours.pilot_on
        } else {
            colours.pilot_off
        };

        self.set_control_lamp(keys.save, save);
        self.set_control_lamp(keys.save_shift, save_shift);
        self.set_control_lamp(keys.playback_toggle, playback);
        self.set_control_lamp(keys.next_step, next_step);
        self.set_control_lamp(keys.clear, clear);
        self.set_control_lamp(keys.pilot_toggle, pilot);
    }

    /// Ping the lighting software every `ping_interval` and report when it starts
    /// or stops answering
    fn check_connection(&mut self, now: Instant) -> Option<bool> {
        let interval =
            Duration::try_from_secs_f64(self.config.ping_interval).unwrap_or(Duration::MAX);
        if let Some(sent) = self.last_ping {
            if now.duration_since(sent) < interval {
                return self.software_connected;
            }
            let answered = self.monitor.answered_since(sent);
            if self.software_connected != Some(answered) {
                if answered {
                    info!("Lighting software is answering");
                } else {
                    warn!("Lighting software is not answering pings");
                }
                self.software_connected = Some(answered);
            }
        }
        self.trigger.ping();
        self.last_ping = Some(now);
        self.software_connected
    }
}
