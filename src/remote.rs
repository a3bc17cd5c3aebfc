use std::{
    sync::{Arc, Mutex},
    thread::{sleep, spawn, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use tether_agent::{PlugOptionsBuilder, TetherAgentOptionsBuilder};

use crate::command::{CommandSender, ControllerCommand};

/// Mark a command as coming from external automation, so the pilot switch applies
pub fn as_pilot(command: ControllerCommand) -> ControllerCommand {
    match command {
        ControllerCommand::ActivateSequence { index, .. } => {
            ControllerCommand::ActivateSequence { index, pilot: true }
        }
        ControllerCommand::ActivateScenes { scenes, .. } => {
            ControllerCommand::ActivateScenes {
                scenes,
                pilot: true,
            }
        }
        other => other,
    }
}

fn decode(payload: &[u8]) -> Option<ControllerCommand> {
    match rmp_serde::from_slice::<ControllerCommand>(payload) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!("Ignoring undecodable remote command: {}", e);
            None
        }
    }
}

/// Connect to Tether and forward anything arriving on the "commands" and "pilot"
/// plugs into the command queue until `should_quit` is set.
pub fn start_remote_thread(
    sender: CommandSender,
    should_quit: Arc<Mutex<bool>>,
) -> anyhow::Result<JoinHandle<()>> {
    info!("Attempt to connect Tether Agent...");

    let mut tether_agent = TetherAgentOptionsBuilder::new("LightpadBridge").build()?;

    let input_commands = PlugOptionsBuilder::create_input("commands").build(&mut tether_agent)?;
    let input_pilot = PlugOptionsBuilder::create_input("pilot").build(&mut tether_agent)?;

    Ok(spawn(move || {
        while !*should_quit.lock().unwrap_or_else(|e| e.into_inner()) {
            while let Some((topic, message)) = tether_agent.check_messages() {
                if input_commands.matches(&topic) {
                    if let Some(command) = decode(&message) {
                        debug!("Remote command {}", command.name());
                        sender.post(command);
                    }
                }
                if input_pilot.matches(&topic) {
                    if let Some(command) = decode(&message) {
                        debug!("Pilot command {}", command.name());
                        sender.post(as_pilot(command));
                    }
                }
            }
            sleep(Duration::from_millis(1));
        }
        info!("Remote Interface: Thread loop end");
    }))
}
