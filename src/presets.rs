use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexSet;
use log::{debug, info, warn};

use crate::{
    mapping::Block,
    output::LampOutput,
    player::{Sequence, SequencePlayer, SequenceStep},
    project::Project,
    scenes::{SceneIndex, SceneRegistry},
};

pub type PresetIndex = usize;

/// Duration given to steps captured from the live scene state
pub const DEFAULT_STEP_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub index: PresetIndex,
    pub x: u8,
    pub y: u8,
    pub name: String,
    pub scene_indices: Vec<SceneIndex>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetActivation {
    Activated,
    Deactivated,
}

struct PresetTable {
    presets: Vec<Preset>,
    active: Option<PresetIndex>,
}

/// Preset definitions plus the "at most one active preset" rule. Scene state is
/// only ever changed through the [`SceneRegistry`].
pub struct PresetRegistry {
    columns: u8,
    table: Mutex<PresetTable>,
    scenes: Arc<SceneRegistry>,
    player: Arc<SequencePlayer>,
    lamp: Arc<dyn LampOutput>,
}

impl PresetRegistry {
    pub fn new(
        columns: u8,
        rows: u8,
        scenes: Arc<SceneRegistry>,
        player: Arc<SequencePlayer>,
        lamp: Arc<dyn LampOutput>,
    ) -> PresetRegistry {
        let count = columns as usize * rows as usize;
        let presets = (0..count)
            .map(|index| Preset {
                index,
                x: (index % columns as usize) as u8,
                y: (index / columns as usize) as u8,
                name: format!("Preset {}", index + 1),
                scene_indices: Vec::new(),
                active: false,
            })
            .collect::<Vec<_>>();

        info!("Initialised {} presets", presets.len());

        PresetRegistry {
            columns,
            table: Mutex::new(PresetTable {
                presets,
                active: None,
            }),
            scenes,
            player,
            lamp,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresetTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().presets.len()
    }

    pub fn preset(&self, index: PresetIndex) -> Option<Preset> {
        self.lock().presets.get(index).cloned()
    }

    pub fn preset_at(&self, x: u8, y: u8) -> Option<PresetIndex> {
        if x >= self.columns {
            return None;
        }
        let index = y as usize * self.columns as usize + x as usize;
        if index < self.len() {
            Some(index)
        } else {
            None
        }
    }

    pub fn refresh_lamps(&self) {
        for preset in self.lock().presets.iter() {
            self.lamp
                .set_lamp(Block::Preset, preset.x, preset.y, preset.active);
        }
    }

    pub fn active_preset(&self) -> Option<PresetIndex> {
        self.lock().active
    }

    pub fn is_animated(&self, index: PresetIndex) -> bool {
        self.player.has_animation(index)
    }

    /// Toggle semantics: activating the active preset deactivates it.
    /// Returns `None` for an unknown index.
    pub fn activate_preset(&self, index: PresetIndex) -> Option<PresetActivation> {
        let mut table = self.lock();
        if index >= table.presets.len() {
            warn!("Invalid preset index {}", index);
            return None;
        }

        if table.active == Some(index) {
            self.deactivate_locked(&mut table, &[]);
            return Some(PresetActivation::Deactivated);
        }
        // Scenes shared with the incoming preset stay on instead of flickering
        let incoming = self.owned_scenes(&table.presets[index]);
        self.deactivate_locked(&mut table, &incoming);

        table.active = Some(index);
        let preset = &mut table.presets[index];
        preset.active = true;
        info!("Activated preset: {}", preset.name);
        self.lamp.set_lamp(Block::Preset, preset.x, preset.y, true);

        if self.player.has_animation(index) {
            self.player.start(index);
        } else {
            self.scenes.claim_scenes(&preset.scene_indices);
        }

        Some(PresetActivation::Activated)
    }

    /// Idempotent
    pub fn deactivate_current(&self) {
        let mut table = self.lock();
        self.deactivate_locked(&mut table, &[]);
    }

    fn deactivate_locked(&self, table: &mut PresetTable, keep: &[SceneIndex]) {
        let Some(index) = table.active.take() else {
            return;
        };
        if self.player.current_preset() == Some(index) {
            self.player.stop();
        }

        let owned: Vec<SceneIndex> = self
            .owned_scenes(&table.presets[index])
            .into_iter()
            .filter(|s| !keep.contains(s))
            .collect();
        let preset = &mut table.presets[index];
        preset.active = false;
        info!("Deactivated preset: {}", preset.name);
        self.lamp.set_lamp(Block::Preset, preset.x, preset.y, false);
        self.scenes.release_scenes(&owned);
    }

    /// Every scene a preset can switch on: its static set, or the union of its steps
    fn owned_scenes(&self, preset: &Preset) -> Vec<SceneIndex> {
        match self.player.sequence(preset.index) {
            Some(sequence) if sequence.is_animated() => {
                self.scene_union(&sequence.steps).into_iter().collect()
            }
            _ => preset.scene_indices.clone(),
        }
    }

    fn scene_union(&self, steps: &[SequenceStep]) -> IndexSet<SceneIndex> {
        steps
            .iter()
            .flat_map(|step| step.scenes.iter())
            .filter_map(|(x, y)| {
                let index = self.scenes.scene_at(*x, *y);
                if index.is_none() {
                    warn!("Step references unknown scene ({},{})", x, y);
                }
                index
            })
            .collect()
    }

    /// Bring the scene state in line with one step of the active animated preset.
    /// Scenes the preset switched on that are absent from the step go off. The
    /// step's scenes go on.
    pub fn apply_step(&self, index: PresetIndex, step_scenes: &[(u8, u8)]) -> bool {
        let table = self.lock();
        if table.active != Some(index) {
            debug!("Ignoring step for inactive preset {}", index);
            return false;
        }
        let wanted: IndexSet<SceneIndex> = step_scenes
            .iter()
            .filter_map(|(x, y)| self.scenes.scene_at(*x, *y))
            .collect();
        let stale: Vec<SceneIndex> = self
            .owned_scenes(&table.presets[index])
            .into_iter()
            .filter(|s| !wanted.contains(s))
            .collect();

        self.scenes.release_scenes(&stale);
        self.scenes
            .claim_scenes(&wanted.into_iter().collect::<Vec<_>>());
        true
    }

    /// Overwrite (or create) a static preset. An empty list is stored but the
    /// preset then counts as unprogrammed.
    pub fn record_preset(&self, index: PresetIndex, scene_indices: &[SceneIndex]) -> bool {
        let mut table = self.lock();
        let Some(preset) = table.presets.get_mut(index) else {
            warn!("Invalid preset index {}", index);
            return false;
        };
        preset.scene_indices = scene_indices.to_vec();
        preset.name = if scene_indices.is_empty() {
            format!("Preset {} (Empty)", index + 1)
        } else {
            format!("Preset {} ({} scenes)", index + 1, scene_indices.len())
        };
        info!(
            "Recorded preset {}: {} scenes",
            index + 1,
            scene_indices.len()
        );
        drop(table);

        self.player.remove_sequence(index);
        true
    }

    pub fn is_programmed(&self, index: PresetIndex) -> bool {
        self.lock()
            .presets
            .get(index)
            .map(|p| !p.scene_indices.is_empty())
            .unwrap_or(false)
    }

    pub fn programmed_indices(&self) -> Vec<PresetIndex> {
        self.lock()
            .presets
            .iter()
            .filter(|p| !p.scene_indices.is_empty())
            .map(|p| p.index)
            .collect()
    }

    /// Store a full sequence. One step makes a static preset; two or more an
    /// animated one. An active preset picks up its new definition immediately.
    pub fn save_sequence(&self, index: PresetIndex, sequence: Sequence) -> bool {
        if index >= self.len() {
            warn!("Invalid preset index {}", index);
            return false;
        }
        let was_active = self.active_preset() == Some(index);
        if was_active {
            self.deactivate_current();
        }

        if sequence.is_animated() {
            let union: Vec<SceneIndex> = self.scene_union(&sequence.steps).into_iter().collect();
            {
                let mut table = self.lock();
                let preset = &mut table.presets[index];
                preset.scene_indices = union;
                preset.name = format!("Preset {} ({} steps)", index + 1, sequence.steps.len());
            }
            self.player.add_sequence(index, sequence);
        } else {
            let scenes: Vec<SceneIndex> = sequence
                .steps
                .first()
                .map(|step| self.scene_union(std::slice::from_ref(step)).into_iter().collect())
                .unwrap_or_default();
            self.record_preset(index, &scenes);
        }

        if was_active {
            self.activate_preset(index);
        }
        true
    }

    /// Append a step, turning a static preset into a sequence. An unnamed step is
    /// named after its position.
    pub fn append_step(&self, index: PresetIndex, mut step: SequenceStep) -> bool {
        let Some(mut sequence) = self.sequence_for(index) else {
            warn!("Invalid preset index {}", index);
            return false;
        };
        if step.name.is_empty() {
            step.name = format!("Step {}", sequence.steps.len() + 1);
        }
        sequence.steps.push(step);
        self.save_sequence(index, sequence)
    }

    pub fn delete_sequence(&self, index: PresetIndex) -> bool {
        if index >= self.len() {
            warn!("Invalid preset index {}", index);
            return false;
        }
        if self.active_preset() == Some(index) {
            self.deactivate_current();
        }
        self.record_preset(index, &[])
    }

    /// The preset as a sequence: its animation, or one step for a programmed static
    /// preset, or no steps at all when unprogrammed
    pub fn sequence_for(&self, index: PresetIndex) -> Option<Sequence> {
        if let Some(sequence) = self.player.sequence(index) {
            return Some((*sequence).clone());
        }
        let preset = self.preset(index)?;
        if preset.scene_indices.is_empty() {
            return Some(Sequence::new(Vec::new()));
        }
        let scenes = preset
            .scene_indices
            .iter()
            .filter_map(|s| self.scenes.coordinate_of(*s))
            .collect();
        Some(Sequence::new(vec![SequenceStep::new(
            scenes,
            DEFAULT_STEP_SECONDS,
            "Step 1",
        )]))
    }

    pub fn load_project(&self, project: &Project) {
        for (index, sequence) in project.presets.iter() {
            if !self.save_sequence(*index, sequence.clone()) {
                warn!("Skipping stored preset {} (out of range)", index);
            }
        }
        info!(
            "Loaded {} programmed presets",
            self.programmed_indices().len()
        );
    }

    pub fn to_project(&self) -> Project {
        let mut project = Project::default();
        for index in self.programmed_indices() {
            if let Some(sequence) = self.sequence_for(index) {
                project.presets.insert(index, sequence);
            }
        }
        project
    }
}
