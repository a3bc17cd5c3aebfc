use std::{
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, Sender},
};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::{mapping::Block, player::Sequence, presets::PresetIndex, scenes::SceneIndex};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ButtonKind {
    Scene,
    Preset,
    /// Anything outside the two blocks; `x`/`y` are absolute controller coordinates
    Control,
}

impl From<Block> for ButtonKind {
    fn from(block: Block) -> Self {
        match block {
            Block::Scene => ButtonKind::Scene,
            Block::Preset => ButtonKind::Preset,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub kind: ButtonKind,
    pub x: u8,
    pub y: u8,
    pub pressed: bool,
}

impl ButtonEvent {
    pub fn new(kind: ButtonKind, x: u8, y: u8, pressed: bool) -> Self {
        ButtonEvent { kind, x, y, pressed }
    }
}

/// Everything the dispatch loop can be asked to do. Remote producers send these
/// as `{"type": "...", "payload": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ControllerCommand {
    ToggleSetPlayback,
    NextStep,
    Clear,
    ActivateSequence {
        index: PresetIndex,
        /// Sent by external automation; dropped while the pilot is switched off
        #[serde(default)]
        pilot: bool,
    },
    SaveSequence {
        index: PresetIndex,
        sequence: Sequence,
    },
    DeleteSequence {
        index: PresetIndex,
    },
    SwitchPilot {
        enabled: bool,
    },
    ActivateScenes {
        scenes: Vec<SceneIndex>,
        #[serde(default)]
        pilot: bool,
    },
    ButtonEvent(ButtonEvent),
}

impl ControllerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerCommand::ToggleSetPlayback => "ToggleSetPlayback",
            ControllerCommand::NextStep => "NextStep",
            ControllerCommand::Clear => "Clear",
            ControllerCommand::ActivateSequence { .. } => "ActivateSequence",
            ControllerCommand::SaveSequence { .. } => "SaveSequence",
            ControllerCommand::DeleteSequence { .. } => "DeleteSequence",
            ControllerCommand::SwitchPilot { .. } => "SwitchPilot",
            ControllerCommand::ActivateScenes { .. } => "ActivateScenes",
            ControllerCommand::ButtonEvent(_) => "ButtonEvent",
        }
    }
}

/// Cloneable producer handle; hand one to every thread that needs to post
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<ControllerCommand>,
}

impl CommandSender {
    /// Never blocks. Only fails once the queue itself has been dropped.
    pub fn post(&self, command: ControllerCommand) -> bool {
        match self.tx.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("Command queue closed; dropping {}", e.0.name());
                false
            }
        }
    }
}

/// Unbounded multi-producer, single-consumer mailbox
pub struct CommandQueue {
    sender: CommandSender,
    rx: Receiver<ControllerCommand>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        CommandQueue {
            sender: CommandSender { tx },
            rx,
        }
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn post(&self, command: ControllerCommand) -> bool {
        self.sender.post(command)
    }

    /// Hand every command pending right now to `handler`, oldest first. Commands
    /// posted while draining wait for the next call. A handler error or panic is
    /// logged and only costs that one command.
    pub fn drain_all<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(ControllerCommand) -> anyhow::Result<()>,
    {
        let pending: Vec<ControllerCommand> = self.rx.try_iter().collect();
        let count = pending.len();

        for command in pending {
            let name = command.name();
            debug!("Handling command {}", name);
            match panic::catch_unwind(AssertUnwindSafe(|| handler(command))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Command {} failed: {:#}", name, e),
                Err(_) => error!("Command {} panicked; continuing", name),
            }
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::bail;

    use super::*;

    #[test]
    fn posts_from_many_threads_drain_in_order() {
        let queue = CommandQueue::new();
        for index in 0..3 {
            let sender = queue.sender();
            thread::spawn(move || {
                sender.post(ControllerCommand::DeleteSequence { index });
            })
            .join()
            .unwrap();
        }

        let mut seen = Vec::new();
        let count = queue.drain_all(|command| {
            seen.push(command);
            Ok(())
        });

        assert_eq!(count, 3);
        assert_eq!(
            seen,
            vec![
                ControllerCommand::DeleteSequence { index: 0 },
                ControllerCommand::DeleteSequence { index: 1 },
                ControllerCommand::DeleteSequence { index: 2 },
            ]
        );
        assert_eq!(queue.drain_all(|_| Ok(())), 0);
    }

    #[test]
    fn posting_reports_a_closed_queue() {
        let queue = CommandQueue::new();
        let sender = queue.sender();
        assert!(queue.post(ControllerCommand::Clear));
        assert!(sender.post(ControllerCommand::NextStep));
        assert_eq!(queue.drain_all(|_| Ok(())), 2);

        drop(queue);
        assert!(!sender.post(ControllerCommand::Clear));
    }

    #[test]
    fn failing_handler_does_not_lose_later_commands() {
        let queue = CommandQueue::new();
        queue.post(ControllerCommand::NextStep);
        queue.post(ControllerCommand::Clear);
        queue.post(ControllerCommand::ToggleSetPlayback);
        queue.post(ControllerCommand::SwitchPilot { enabled: true });

        let mut handled = Vec::new();
        let count = queue.drain_all(|command| {
            handled.push(command.name());
            match command {
                ControllerCommand::Clear => bail!("boom"),
                ControllerCommand::ToggleSetPlayback => panic!("handler bug"),
                _ => Ok(()),
            }
        });

        assert_eq!(count, 4);
        assert_eq!(
            handled,
            vec!["NextStep", "Clear", "ToggleSetPlayback", "SwitchPilot"]
        );
    }

    #[test]
    fn commands_posted_during_drain_wait_for_next_drain() {
        let queue = CommandQueue::new();
        let sender = queue.sender();
        queue.post(ControllerCommand::NextStep);

        let first = queue.drain_all(|_| {
            sender.post(ControllerCommand::Clear);
            Ok(())
        });
        assert_eq!(first, 1);

        let mut later = Vec::new();
        queue.drain_all(|command| {
            later.push(command);
            Ok(())
        });
        assert_eq!(later, vec![ControllerCommand::Clear]);
    }

    #[test]
    fn remote_json_shape() {
        let command: ControllerCommand =
            serde_json::from_str(r#"{"type":"activateSequence","payload":{"index":3}}"#).unwrap();
        assert_eq!(
            command,
            ControllerCommand::ActivateSequence {
                index: 3,
                pilot: false
            }
        );

        let clear: ControllerCommand = serde_json::from_str(r#"{"type":"clear"}"#).unwrap();
        assert_eq!(clear, ControllerCommand::Clear);

        let button = serde_json::to_value(ControllerCommand::ButtonEvent(ButtonEvent::new(
            ButtonKind::Preset,
            1,
            2,
            true,
        )))
        .unwrap();
        assert_eq!(button["type"], "buttonEvent");
        assert_eq!(button["payload"]["kind"], "preset");
    }
}
