use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, info, warn};

use crate::{
    mapping::Block,
    output::{LampOutput, SceneTrigger},
};

pub type SceneIndex = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scene {
    pub index: SceneIndex,
    pub x: u8,
    pub y: u8,
    pub active: bool,
    /// Switched on by a preset rather than by hand; only these are switched off
    /// again when the preset lets go
    pub controlled: bool,
}

/// Owns the on/off state of every scene. Safe to share between the dispatch loop,
/// the MIDI feedback callback and anything else via `Arc`.
pub struct SceneRegistry {
    columns: u8,
    scenes: Mutex<Vec<Scene>>,
    lamp: Arc<dyn LampOutput>,
    trigger: Arc<dyn SceneTrigger>,
}

impl SceneRegistry {
    pub fn new(
        columns: u8,
        rows: u8,
        lamp: Arc<dyn LampOutput>,
        trigger: Arc<dyn SceneTrigger>,
    ) -> SceneRegistry {
        let count = columns as usize * rows as usize;
        let scenes = (0..count)
            .map(|index| Scene {
                index,
                x: (index % columns as usize) as u8,
                y: (index / columns as usize) as u8,
                active: false,
                controlled: false,
            })
            .collect::<Vec<_>>();

        info!("Initialised {} scenes ({}x{})", scenes.len(), columns, rows);

        SceneRegistry {
            columns,
            scenes: Mutex::new(scenes),
            lamp,
            trigger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Scene>> {
        // A panic while holding the lock cannot leave a half-written bool behind
        self.scenes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Flip a scene locally: lamp follows, and the lighting software gets a trigger.
    /// Returns the new state, or `None` for an unknown index.
    pub fn toggle_scene(&self, index: SceneIndex) -> Option<bool> {
        let mut scenes = self.lock();
        self.flip(&mut scenes, index)
    }

    fn flip(&self, scenes: &mut [Scene], index: SceneIndex) -> Option<bool> {
        let scene = match scenes.get_mut(index) {
            Some(s) => s,
            None => {
                warn!("Invalid scene index {}", index);
                return None;
            }
        };
        scene.active = !scene.active;
        scene.controlled = false;
        debug!(
            "Scene #{} ({},{}) toggled => {}",
            index, scene.x, scene.y, scene.active
        );
        self.lamp.set_lamp(Block::Scene, scene.x, scene.y, scene.active);
        self.trigger.trigger(scene.x, scene.y);
        Some(scene.active)
    }

    fn set_scene(&self, index: SceneIndex, target: bool) -> Option<bool> {
        let mut scenes = self.lock();
        if scenes.get(index).map(|s| s.active) == Some(target) {
            return Some(target);
        }
        self.flip(&mut scenes, index)
    }

    pub fn activate_scene(&self, index: SceneIndex) -> Option<bool> {
        self.set_scene(index, true)
    }

    pub fn deactivate_scene(&self, index: SceneIndex) -> Option<bool> {
        self.set_scene(index, false)
    }

    /// Switch scenes on on behalf of a preset. Only scenes that were off become
    /// controlled; a scene that is already on keeps its current ownership.
    pub fn claim_scenes(&self, indices: &[SceneIndex]) {
        let mut scenes = self.lock();
        for index in indices {
            match scenes.get(*index).map(|s| s.active) {
                Some(false) => {
                    self.flip(&mut scenes, *index);
                    scenes[*index].controlled = true;
                }
                Some(true) => {}
                None => warn!("Invalid scene index {}", index),
            }
        }
    }

    /// Switch off those of `indices` a preset switched on. Anything turned on by
    /// hand, by feedback or before the preset took over is left alone.
    pub fn release_scenes(&self, indices: &[SceneIndex]) {
        let mut scenes = self.lock();
        for index in indices {
            let controlled = scenes.get(*index).is_some_and(|s| s.controlled && s.active);
            if controlled {
                self.flip(&mut scenes, *index);
            }
        }
    }

    /// Not transactional: an invalid index is skipped and everything before it stays applied
    pub fn activate_scenes(&self, indices: &[SceneIndex]) {
        for index in indices {
            self.activate_scene(*index);
        }
    }

    pub fn deactivate_scenes(&self, indices: &[SceneIndex]) {
        for index in indices {
            self.deactivate_scene(*index);
        }
    }

    pub fn deactivate_all(&self) {
        let active: Vec<SceneIndex> = self.active_indices().into_iter().collect();
        self.deactivate_scenes(&active);
    }

    /// Merge state reported by the lighting software. Matching state is ignored, so
    /// the software's echo of our own trigger never bounces back. A mismatch only
    /// updates the lamp; the software already knows. Returns whether anything
    /// changed, or `None` for an unknown index.
    pub fn reconcile_feedback(&self, index: SceneIndex, active: bool) -> Option<bool> {
        let mut scenes = self.lock();
        let scene = match scenes.get_mut(index) {
            Some(s) => s,
            None => {
                warn!("Feedback for unknown scene index {}", index);
                return None;
            }
        };
        if scene.active == active {
            return Some(false);
        }
        scene.active = active;
        scene.controlled = false;
        debug!(
            "Scene #{} ({},{}) => {} via feedback",
            index, scene.x, scene.y, active
        );
        self.lamp.set_lamp(Block::Scene, scene.x, scene.y, active);
        Some(true)
    }

    /// Re-send every lamp, e.g. after the controller (re)connects
    pub fn refresh_lamps(&self) {
        for scene in self.lock().iter() {
            self.lamp.set_lamp(Block::Scene, scene.x, scene.y, scene.active);
        }
    }

    pub fn is_active(&self, index: SceneIndex) -> bool {
        self.lock().get(index).map(|s| s.active).unwrap_or(false)
    }

    pub fn active_indices(&self) -> BTreeSet<SceneIndex> {
        self.lock()
            .iter()
            .filter(|s| s.active)
            .map(|s| s.index)
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.lock().iter().any(|s| s.active)
    }

    pub fn scene_at(&self, x: u8, y: u8) -> Option<SceneIndex> {
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

    pub fn coordinate_of(&self, index: SceneIndex) -> Option<(u8, u8)> {
        self.lock().get(index).map(|s| (s.x, s.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::testing::Recorder;

    fn registry() -> (SceneRegistry, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let scenes = SceneRegistry::new(8, 5, recorder.clone(), recorder.clone());
        (scenes, recorder)
    }

    #[test]
    fn scenes_are_row_major() {
        let (scenes, _) = registry();
        assert_eq!(scenes.len(), 40);
        assert_eq!(scenes.coordinate_of(0), Some((0, 0)));
        assert_eq!(scenes.coordinate_of(9), Some((1, 1)));
        assert_eq!(scenes.coordinate_of(39), Some((7, 4)));
        assert_eq!(scenes.scene_at(7, 4), Some(39));
        assert_eq!(scenes.scene_at(8, 0), None);
        assert_eq!(scenes.scene_at(0, 5), None);
    }

    #[test]
    fn toggle_notifies_lamp_and_trigger() {
        let (scenes, rec) = registry();
        assert_eq!(scenes.toggle_scene(10), Some(true));
        assert_eq!(scenes.toggle_scene(10), Some(false));
        assert_eq!(
            rec.lamp_calls(),
            vec![(Block::Scene, 2, 1, true), (Block::Scene, 2, 1, false)]
        );
        assert_eq!(rec.trigger_calls(), vec![(2, 1), (2, 1)]);
    }

    #[test]
    fn invalid_index_is_a_no_op() {
        let (scenes, rec) = registry();
        assert_eq!(scenes.toggle_scene(40), None);
        assert_eq!(scenes.activate_scene(99), None);
        assert_eq!(scenes.reconcile_feedback(40, true), None);
        assert!(rec.lamp_calls().is_empty());
    }

    #[test]
    fn activate_and_deactivate_are_idempotent() {
        let (scenes, rec) = registry();
        scenes.activate_scene(3);
        scenes.activate_scene(3);
        scenes.deactivate_scene(4);
        assert_eq!(rec.lamp_calls().len(), 1);
        scenes.deactivate_scene(3);
        scenes.deactivate_scene(3);
        assert_eq!(rec.lamp_calls().len(), 2);
        assert!(!scenes.is_active(3));
    }

    #[test]
    fn batch_activation_is_not_transactional() {
        let (scenes, _) = registry();
        scenes.activate_scenes(&[1, 2, 400, 5]);
        assert_eq!(scenes.active_indices(), BTreeSet::from([1, 2, 5]));
    }

    #[test]
    fn repeated_feedback_notifies_once() {
        let (scenes, rec) = registry();
        assert_eq!(scenes.reconcile_feedback(7, true), Some(true));
        assert_eq!(scenes.reconcile_feedback(7, true), Some(false));
        assert_eq!(rec.lamp_calls(), vec![(Block::Scene, 7, 0, true)]);
        assert!(rec.trigger_calls().is_empty());
        assert!(scenes.is_active(7));
    }

    #[test]
    fn echo_of_local_toggle_is_ignored() {
        let (scenes, rec) = registry();
        scenes.toggle_scene(12);
        scenes.reconcile_feedback(12, true);
        assert_eq!(rec.lamp_calls().len(), 1);
        assert_eq!(rec.trigger_calls().len(), 1);

        scenes.reconcile_feedback(12, false);
        assert!(!scenes.is_active(12));
        assert_eq!(rec.lamp_calls().len(), 2);
        assert_eq!(rec.trigger_calls().len(), 1);
    }

    #[test]
    fn active_indices_is_a_snapshot() {
        let (scenes, _) = registry();
        scenes.activate_scene(1);
        let snapshot = scenes.active_indices();
        scenes.activate_scene(2);
        assert_eq!(snapshot, BTreeSet::from([1]));
        scenes.deactivate_all();
        assert!(!scenes.has_active());
    }

    #[test]
    fn release_only_touches_claimed_scenes() {
        let (scenes, rec) = registry();
        scenes.activate_scene(1);
        scenes.claim_scenes(&[1, 5]);
        assert_eq!(rec.trigger_calls(), vec![(1, 0), (5, 0)]);

        scenes.release_scenes(&[1, 5]);
        assert_eq!(scenes.active_indices(), BTreeSet::from([1]));

        // Released scenes are no longer the preset's
        scenes.activate_scene(5);
        scenes.release_scenes(&[5]);
        assert!(scenes.is_active(5));
    }

    #[test]
    fn hand_or_feedback_changes_drop_control() {
        let (scenes, _) = registry();
        scenes.claim_scenes(&[2, 3]);

        // Off and back on by hand: now the user's
        scenes.toggle_scene(2);
        scenes.toggle_scene(2);
        // Off then on from the software
        scenes.reconcile_feedback(3, false);
        scenes.reconcile_feedback(3, true);

        scenes.release_scenes(&[2, 3]);
        assert_eq!(scenes.active_indices(), BTreeSet::from([2, 3]));
    }

    #[test]
    fn refresh_sends_every_lamp_without_triggering() {
        let (scenes, rec) = registry();
        scenes.activate_scene(0);
        rec.clear();
        scenes.refresh_lamps();
        let lamps = rec.lamp_calls();
        assert_eq!(lamps.len(), 40);
        assert_eq!(lamps[0], (Block::Scene, 0, 0, true));
        assert!(lamps[1..].iter().all(|(_, _, _, on)| !on));
        assert!(rec.trigger_calls().is_empty());
    }
}
