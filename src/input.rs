//! Decoding of raw MIDI from the grid controller and the lighting software.
//!
//! The controller is addressed in absolute coordinates on a 9x9 surface: `y = 0`
//! is the top row of round buttons (sent as CC 104..=111), rows `1..=8` are the
//! pad grid plus the right-hand column at `x = 8` (notes `(9 - y) * 10 + x + 1`).
//! Scene and preset blocks are carved out of the pad grid by the
//! [`CoordinateMapper`]; every other button is a control.

use log::trace;
use midly::{live::LiveEvent, MidiMessage};

use crate::{
    command::{ButtonEvent, ButtonKind},
    mapping::{CoordinateMapper, NoteId},
};

pub const TOP_ROW_CC_BASE: u8 = 104;
/// Reserved note used to check the lighting software is listening
pub const PING_NOTE: u8 = 127;

const SURFACE_SIZE: u8 = 9;

/// How a button at absolute coordinates is driven on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAddress {
    Note(u8),
    Controller(u8),
}

pub fn control_address(x: u8, y: u8) -> Option<ControlAddress> {
    if x >= SURFACE_SIZE || y >= SURFACE_SIZE {
        return None;
    }
    if y == 0 {
        if x == SURFACE_SIZE - 1 {
            // No button in the top-right corner
            return None;
        }
        return Some(ControlAddress::Controller(TOP_ROW_CC_BASE + x));
    }
    Some(ControlAddress::Note((SURFACE_SIZE - y) * 10 + x + 1))
}

fn absolute_for_note(note: u8) -> Option<(u8, u8)> {
    let row = note / 10;
    let column = note % 10;
    if !(1..=8).contains(&row) || !(1..=9).contains(&column) {
        return None;
    }
    Some((column - 1, SURFACE_SIZE - row))
}

/// Turn one controller message into a button event. Anything that isn't a
/// button press or release is dropped.
pub fn classify(mapper: &CoordinateMapper, bytes: &[u8]) -> Option<ButtonEvent> {
    let event = match LiveEvent::parse(bytes) {
        Ok(event) => event,
        Err(e) => {
            trace!("Ignoring unparseable controller message {:?}: {}", bytes, e);
            return None;
        }
    };
    let LiveEvent::Midi { message, .. } = event else {
        return None;
    };

    let (note, pressed) = match message {
        MidiMessage::NoteOn { key, vel } => (key.as_int(), vel.as_int() > 0),
        MidiMessage::NoteOff { key, .. } => (key.as_int(), false),
        MidiMessage::Controller { controller, value } => {
            let cc = controller.as_int();
            if (TOP_ROW_CC_BASE..TOP_ROW_CC_BASE + SURFACE_SIZE - 1).contains(&cc) {
                return Some(ButtonEvent::new(
                    ButtonKind::Control,
                    cc - TOP_ROW_CC_BASE,
                    0,
                    value.as_int() > 0,
                ));
            }
            return None;
        }
        _ => return None,
    };

    if let Some((block, x, y)) = mapper.locate(note) {
        return Some(ButtonEvent::new(block.into(), x, y, pressed));
    }
    absolute_for_note(note).map(|(x, y)| ButtonEvent::new(ButtonKind::Control, x, y, pressed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// The software answered a ping
    Ping,
    Note { note: NoteId, on: bool },
}

/// Scene state reported by the lighting software. A zero-velocity note-on and a
/// note-off both mean "off".
pub fn parse_feedback(bytes: &[u8]) -> Option<Feedback> {
    let LiveEvent::Midi { message, .. } = LiveEvent::parse(bytes).ok()? else {
        return None;
    };
    let (note, on) = match message {
        MidiMessage::NoteOn { key, vel } => (key.as_int(), vel.as_int() > 0),
        MidiMessage::NoteOff { key, .. } => (key.as_int(), false),
        _ => return None,
    };
    if note == PING_NOTE {
        return on.then_some(Feedback::Ping);
    }
    Some(Feedback::Note { note, on })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_and_preset_pads() {
        let mapper = CoordinateMapper::default();
        assert_eq!(
            classify(&mapper, &[0x90, 64, 127]),
            Some(ButtonEvent::new(ButtonKind::Scene, 3, 2, true))
        );
        assert_eq!(
            classify(&mapper, &[0x90, 64, 0]),
            Some(ButtonEvent::new(ButtonKind::Scene, 3, 2, false))
        );
        assert_eq!(
            classify(&mapper, &[0x80, 18, 0]),
            Some(ButtonEvent::new(ButtonKind::Preset, 7, 2, false))
        );
    }

    #[test]
    fn top_row_and_right_column_are_controls() {
        let mapper = CoordinateMapper::default();
        assert_eq!(
            classify(&mapper, &[0xB0, 105, 127]),
            Some(ButtonEvent::new(ButtonKind::Control, 1, 0, true))
        );
        // Right-hand column, second from the bottom
        assert_eq!(
            classify(&mapper, &[0x90, 29, 127]),
            Some(ButtonEvent::new(ButtonKind::Control, 8, 7, true))
        );
        assert_eq!(classify(&mapper, &[0xB0, 7, 100]), None);
        assert_eq!(classify(&mapper, &[0xF8]), None);
        assert_eq!(classify(&mapper, &[]), None);
    }

    #[test]
    fn control_addresses_match_classification() {
        let mapper = CoordinateMapper::default();
        for y in 0..9 {
            for x in 0..9 {
                let bytes = match control_address(x, y) {
                    Some(ControlAddress::Note(n)) => [0x90, n, 127],
                    Some(ControlAddress::Controller(c)) => [0xB0, c, 127],
                    None => continue,
                };
                let event = classify(&mapper, &bytes).unwrap();
                if event.kind == ButtonKind::Control {
                    assert_eq!((event.x, event.y), (x, y));
                }
            }
        }
        assert_eq!(control_address(8, 0), None);
        assert_eq!(control_address(9, 1), None);
    }

    #[test]
    fn feedback_velocity_decides_state() {
        assert_eq!(
            parse_feedback(&[0x90, 81, 127]),
            Some(Feedback::Note { note: 81, on: true })
        );
        assert_eq!(
            parse_feedback(&[0x90, 81, 0]),
            Some(Feedback::Note { note: 81, on: false })
        );
        assert_eq!(
            parse_feedback(&[0x80, 81, 64]),
            Some(Feedback::Note { note: 81, on: false })
        );
        assert_eq!(parse_feedback(&[0x90, 127, 127]), Some(Feedback::Ping));
        assert_eq!(parse_feedback(&[0x90, 127, 0]), None);
        assert_eq!(parse_feedback(&[0xB0, 1, 1]), None);
    }
}
