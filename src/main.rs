use std::{
    sync::{Arc, Mutex},
    thread::sleep,
    time::Duration,
};

use env_logger::Env;
use log::{debug, error, info, warn};

use clap::Parser;

use crate::{
    command::ControllerCommand,
    controller::Controller,
    input::classify,
    midi::{connect_input, connect_output, feedback_handler, LaunchpadOutput, SoftwareOutput},
    output::{LampOutput, LogOutput, SceneTrigger},
    remote::start_remote_thread,
    settings::{Cli, Config},
};

mod command;
mod controller;
mod input;
mod mapping;
mod midi;
mod output;
mod player;
mod presets;
mod project;
mod remote;
mod scenes;
mod settings;

/// Time given to the lighting software to report its current scenes before
/// controller input is accepted
const INITIAL_SYNC: Duration = Duration::from_millis(250);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level))
        .filter_module("paho_mqtt", log::LevelFilter::Warn)
        .init();

    debug!("Started with settings: {:?}", cli);

    let config = Config::load(&cli.config_path)?;
    let mapper = config.mapper()?;

    let lamp: Arc<dyn LampOutput> = match connect_output(&cli.launchpad_port) {
        Ok(connection) => Arc::new(LaunchpadOutput::new(
            connection,
            mapper.clone(),
            config.colours.clone(),
        )),
        Err(e) => {
            warn!("Controller lamps unavailable ({}); logging only", e);
            Arc::new(LogOutput { label: "lamps" })
        }
    };
    let trigger: Arc<dyn SceneTrigger> = match connect_output(&cli.software_out_port) {
        Ok(connection) => Arc::new(SoftwareOutput::new(connection, mapper.clone())),
        Err(e) => {
            warn!("Lighting software output unavailable ({}); logging only", e);
            Arc::new(LogOutput { label: "software" })
        }
    };

    let mut controller = Controller::new(
        config,
        lamp,
        trigger,
        Some(cli.project_path.clone()),
        Duration::from_millis(cli.tick_ms),
    )?;

    // Feedback first, so the initial scene state is known before any button press
    let _feedback_connection = match connect_input(
        &cli.software_in_port,
        feedback_handler(mapper.clone(), controller.scenes(), controller.monitor()),
    ) {
        Ok(connection) => {
            sleep(INITIAL_SYNC);
            info!(
                "Initial sync: {} scenes active",
                controller.scenes().active_indices().len()
            );
            Some(connection)
        }
        Err(e) => {
            warn!("No feedback from lighting software ({})", e);
            None
        }
    };

    controller.refresh();

    let sender = controller.sender();
    let input_mapper = mapper.clone();
    let _launchpad_connection = match connect_input(&cli.launchpad_port, move |bytes| {
        if let Some(event) = classify(&input_mapper, bytes) {
            sender.post(ControllerCommand::ButtonEvent(event));
        }
    }) {
        Ok(connection) => Some(connection),
        Err(e) => {
            warn!("Controller input unavailable ({})", e);
            None
        }
    };

    let should_quit = Arc::new(Mutex::new(false));

    let remote_handle = if cli.tether_disable {
        info!("Tether disabled; remote commands off");
        None
    } else {
        match start_remote_thread(controller.sender(), should_quit.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start Tether remote control: {}", e);
                None
            }
        }
    };

    let quit_flag = should_quit.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received; quitting...");
        *quit_flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
    })?;

    info!(
        "Running in {:?} mode, pilot {}, {} presets programmed; Ctrl+C to quit",
        controller.mode(),
        if controller.pilot_enabled() { "on" } else { "off" },
        controller.presets().programmed_indices().len()
    );
    while !*should_quit.lock().unwrap_or_else(|e| e.into_inner()) {
        controller.update();
    }

    debug!("Player was {:?} at exit", controller.player().state());
    controller.shutdown();
    if let Some(handle) = remote_handle {
        if handle.join().is_err() {
            error!("Remote control thread panicked");
        }
    }

    info!("Bye");
    Ok(())
}
