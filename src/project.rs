use std::{fs, path::Path};

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{player::Sequence, presets::PresetIndex};

/// Everything persisted between runs: programmed presets keyed by preset index.
/// A static preset is stored as a one-step sequence.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    pub presets: IndexMap<PresetIndex, Sequence>,
}

impl Project {
    pub fn new() -> Project {
        Project::default()
    }

    pub fn try_load(path: &str) -> anyhow::Result<Project> {
        let text = fs::read_to_string(path)?;
        info!("Found project {}; parsing...", &path);
        let project = serde_json::from_str::<Project>(&text)?;
        info!(
            "... loaded project with {} presets OK",
            project.presets.len()
        );
        Ok(project)
    }

    /// Never fails: a missing or malformed file gives an empty project
    pub fn load(path: &str) -> Project {
        if !Path::new(path).exists() {
            info!("No project at \"{}\" yet; starting empty", path);
            return Project::new();
        }
        match Project::try_load(path) {
            Ok(project) => project,
            Err(e) => {
                warn!("Failed to load project from \"{}\": {}; starting empty", path, e);
                Project::new()
            }
        }
    }

    pub fn save(path: &str, project: &Project) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&project)?;
        debug!("{}", json);

        fs::write(path, json)?;

        info!("Saved Project JSON to \"{}\" OK", &path);

        Ok(())
    }
}
