use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::anyhow;
use log::{debug, info, trace, warn};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use midly::{live::LiveEvent, MidiMessage};

use crate::{
    input::{control_address, parse_feedback, ControlAddress, Feedback, PING_NOTE},
    mapping::{Block, CoordinateMapper},
    output::{LampOutput, SceneTrigger},
    scenes::SceneRegistry,
    settings::LampColours,
};

const CLIENT_NAME: &str = "Lightpad Bridge";
const TRIGGER_VELOCITY: u8 = 127;

fn encode(message: MidiMessage) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(3);
    let event = LiveEvent::Midi {
        channel: 0u8.into(),
        message,
    };
    // Writing into a Vec cannot fail
    let _ = event.write_std(&mut bytes);
    bytes
}

fn note_on(note: u8, velocity: u8) -> Vec<u8> {
    encode(MidiMessage::NoteOn {
        key: note.into(),
        vel: velocity.into(),
    })
}

fn control_change(controller: u8, value: u8) -> Vec<u8> {
    encode(MidiMessage::Controller {
        controller: controller.into(),
        value: value.into(),
    })
}

fn send(connection: &Mutex<MidiOutputConnection>, bytes: &[u8]) {
    let mut connection = connection.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = connection.send(bytes) {
        warn!("Failed to send MIDI {:?}: {}", bytes, e);
    }
}

pub fn connect_output(name_part: &str) -> anyhow::Result<MidiOutputConnection> {
    let midi_out = MidiOutput::new(CLIENT_NAME).map_err(|e| anyhow!("{}", e))?;

    let ports = midi_out.ports();
    let found = ports.iter().find_map(|p| {
        let port_name = midi_out.port_name(p).unwrap_or_default();
        if port_name.to_lowercase().contains(&name_part.to_lowercase()) {
            Some((p.clone(), port_name))
        } else {
            debug!("Available MIDI Out Port: {}", port_name);
            None
        }
    });

    let (port, name) = found.ok_or_else(|| anyhow!("no MIDI output matching \"{}\"", name_part))?;
    info!("Connecting to MIDI Output: {}", name);
    midi_out
        .connect(&port, "lightpad-out")
        .map_err(|e| anyhow!("failed to connect to {}: {}", name, e))
}

/// `callback` runs on the MIDI backend's thread for every incoming message
pub fn connect_input<F>(name_part: &str, mut callback: F) -> anyhow::Result<MidiInputConnection<()>>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let midi_in = MidiInput::new(CLIENT_NAME).map_err(|e| anyhow!("{}", e))?;

    let ports = midi_in.ports();
    let found = ports.iter().find_map(|p| {
        let port_name = midi_in.port_name(p).unwrap_or_default();
        if port_name.to_lowercase().contains(&name_part.to_lowercase()) {
            Some((p.clone(), port_name))
        } else {
            debug!("Available MIDI In Port: {}", port_name);
            None
        }
    });

    let (port, name) = found.ok_or_else(|| anyhow!("no MIDI input matching \"{}\"", name_part))?;
    info!("Connecting to MIDI Input: {}", name);
    midi_in
        .connect(
            &port,
            "lightpad-in",
            move |_timestamp, message, _| callback(message),
            (),
        )
        .map_err(|e| anyhow!("failed to connect to {}: {}", name, e))
}

/// Lamps on the grid controller, coloured from the palette in the config
pub struct LaunchpadOutput {
    connection: Mutex<MidiOutputConnection>,
    mapper: CoordinateMapper,
    colours: LampColours,
}

impl LaunchpadOutput {
    pub fn new(
        connection: MidiOutputConnection,
        mapper: CoordinateMapper,
        colours: LampColours,
    ) -> Self {
        LaunchpadOutput {
            connection: Mutex::new(connection),
            mapper,
            colours,
        }
    }
}

impl LampOutput for LaunchpadOutput {
    fn set_lamp(&self, block: Block, x: u8, y: u8, on: bool) {
        let Some(note) = self.mapper.note_for(block, x, y) else {
            return;
        };
        let velocity = match (block, on) {
            (_, false) => self.colours.off,
            (Block::Scene, true) => self.colours.scene_on,
            (Block::Preset, true) => self.colours.preset_on,
        };
        send(&self.connection, &note_on(note, velocity));
    }

    fn set_control_lamp(&self, x: u8, y: u8, velocity: u8) {
        match control_address(x, y) {
            Some(ControlAddress::Note(note)) => send(&self.connection, &note_on(note, velocity)),
            Some(ControlAddress::Controller(cc)) => {
                send(&self.connection, &control_change(cc, velocity))
            }
            None => warn!("No control button at ({},{})", x, y),
        }
    }
}

/// Scene triggers towards the lighting software; scene notes use the same layout
/// as the controller's scene block
pub struct SoftwareOutput {
    connection: Mutex<MidiOutputConnection>,
    mapper: CoordinateMapper,
}

impl SoftwareOutput {
    pub fn new(connection: MidiOutputConnection, mapper: CoordinateMapper) -> Self {
        SoftwareOutput {
            connection: Mutex::new(connection),
            mapper,
        }
    }
}

impl SceneTrigger for SoftwareOutput {
    fn trigger(&self, x: u8, y: u8) {
        match self.mapper.note_for(Block::Scene, x, y) {
            Some(note) => {
                debug!("Trigger scene ({},{}) => note {}", x, y, note);
                send(&self.connection, &note_on(note, TRIGGER_VELOCITY));
            }
            None => warn!("No MIDI note mapped for scene ({},{})", x, y),
        }
    }

    fn ping(&self) {
        trace!("Ping lighting software");
        send(&self.connection, &note_on(PING_NOTE, TRIGGER_VELOCITY));
    }
}

/// Last time the lighting software answered a ping
#[derive(Default)]
pub struct ConnectionMonitor {
    last_pong: Mutex<Option<Instant>>,
}

impl ConnectionMonitor {
    pub fn record_pong(&self) {
        *self.last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn answered_since(&self, since: Instant) -> bool {
        self.last_pong
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|t| t >= since)
    }
}

/// Apply one message from the lighting software's feedback port
pub fn handle_feedback(
    bytes: &[u8],
    mapper: &CoordinateMapper,
    scenes: &SceneRegistry,
    monitor: &ConnectionMonitor,
) {
    match parse_feedback(bytes) {
        Some(Feedback::Ping) => monitor.record_pong(),
        Some(Feedback::Note { note, on }) => {
            let index = mapper
                .coordinate_for(Block::Scene, note)
                .and_then(|(x, y)| scenes.scene_at(x, y));
            match index {
                Some(index) => {
                    if scenes.reconcile_feedback(index, on) == Some(false) {
                        trace!("Scene {} already {}", index, if on { "on" } else { "off" });
                    }
                }
                None => trace!("Feedback for unmapped note {}", note),
            }
        }
        None => {}
    }
}

/// Everything the feedback callback needs, bundled so it can move into the
/// MIDI backend's thread
pub fn feedback_handler(
    mapper: CoordinateMapper,
    scenes: Arc<SceneRegistry>,
    monitor: Arc<ConnectionMonitor>,
) -> impl FnMut(&[u8]) + Send + 'static {
    move |bytes| handle_feedback(bytes, &mapper, &scenes, &monitor)
}
