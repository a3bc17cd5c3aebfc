use log::debug;

use crate::mapping::Block;

/// Receives the intended light state of a controller button whenever it changes.
///
/// Implementations must tolerate repeated identical calls, and must not call back
/// into the registries (they are invoked while registry state is locked).
pub trait LampOutput: Send + Sync {
    fn set_lamp(&self, block: Block, x: u8, y: u8, on: bool);

    /// Control buttons outside the scene/preset blocks, addressed in absolute
    /// controller coordinates
    fn set_control_lamp(&self, x: u8, y: u8, velocity: u8);
}

/// Fires a scene trigger in the lighting software
pub trait SceneTrigger: Send + Sync {
    fn trigger(&self, x: u8, y: u8);

    /// Ask the software to answer on the ping note
    fn ping(&self) {}
}

/// Stand-in used when a MIDI port is not available; only logs
pub struct LogOutput {
    pub label: &'static str,
}

impl LampOutput for LogOutput {
    fn set_lamp(&self, block: Block, x: u8, y: u8, on: bool) {
        debug!("[{}] lamp {:?} ({},{}) => {}", self.label, block, x, y, on);
    }

    fn set_control_lamp(&self, x: u8, y: u8, velocity: u8) {
        debug!("[{}] control lamp ({},{}) => {}", self.label, x, y, velocity);
    }
}

impl SceneTrigger for LogOutput {
    fn trigger(&self, x: u8, y: u8) {
        debug!("[{}] trigger scene ({},{})", self.label, x, y);
    }
}
