use std::collections::HashMap;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

/// Protocol-level note number shared by the controller and the lighting software
pub type NoteId = u8;

/// Highest usable MIDI note; 127 is reserved for the software connection ping
pub const MAX_NOTE: u8 = 126;

pub const SCENE_ROW_BASES: [u8; 5] = [81, 71, 61, 51, 41];
pub const PRESET_ROW_BASES: [u8; 3] = [31, 21, 11];
pub const GRID_COLUMNS: u8 = 8;

/// The two independently addressed button areas
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Block {
    Scene,
    Preset,
}

/// Bijection between `(x, y)` and note ids for one block, where
/// `note = row_bases[y] + x`.
#[derive(Debug, Clone)]
pub struct NoteGrid {
    columns: u8,
    row_bases: Vec<u8>,
    reverse: HashMap<NoteId, (u8, u8)>,
}

impl NoteGrid {
    pub fn new(columns: u8, row_bases: &[u8]) -> anyhow::Result<NoteGrid> {
        if columns == 0 || row_bases.is_empty() {
            bail!("a note grid needs at least one row and one column");
        }

        let mut reverse = HashMap::new();
        for (y, base) in row_bases.iter().enumerate() {
            for x in 0..columns {
                let note = base
                    .checked_add(x)
                    .filter(|n| *n <= MAX_NOTE)
                    .ok_or_else(|| anyhow!("row base {} overflows the note range", base))?;
                if let Some(existing) = reverse.insert(note, (x, y as u8)) {
                    bail!(
                        "note {} is used by both {:?} and {:?}",
                        note,
                        existing,
                        (x, y)
                    );
                }
            }
        }

        Ok(NoteGrid {
            columns,
            row_bases: row_bases.to_vec(),
            reverse,
        })
    }

    pub fn columns(&self) -> u8 {
        self.columns
    }

    pub fn rows(&self) -> u8 {
        self.row_bases.len() as u8
    }

    pub fn note_for(&self, x: u8, y: u8) -> Option<NoteId> {
        if x >= self.columns {
            return None;
        }
        self.row_bases.get(y as usize).map(|base| base + x)
    }

    pub fn coordinate_for(&self, note: NoteId) -> Option<(u8, u8)> {
        self.reverse.get(&note).copied()
    }
}

/// Note layout for both blocks of the controller
#[derive(Debug, Clone)]
pub struct CoordinateMapper {
    scenes: NoteGrid,
    presets: NoteGrid,
}

impl CoordinateMapper {
    pub fn new(scenes: NoteGrid, presets: NoteGrid) -> anyhow::Result<CoordinateMapper> {
        if let Some(note) = scenes
            .reverse
            .keys()
            .find(|n| presets.reverse.contains_key(n))
        {
            bail!("note {} is assigned to both the scene and preset blocks", note);
        }
        Ok(CoordinateMapper { scenes, presets })
    }

    pub fn grid(&self, block: Block) -> &NoteGrid {
        match block {
            Block::Scene => &self.scenes,
            Block::Preset => &self.presets,
        }
    }

    pub fn note_for(&self, block: Block, x: u8, y: u8) -> Option<NoteId> {
        self.grid(block).note_for(x, y)
    }

    pub fn coordinate_for(&self, block: Block, note: NoteId) -> Option<(u8, u8)> {
        self.grid(block).coordinate_for(note)
    }

    /// Find which block (if any) a note belongs to
    pub fn locate(&self, note: NoteId) -> Option<(Block, u8, u8)> {
        if let Some((x, y)) = self.scenes.coordinate_for(note) {
            return Some((Block::Scene, x, y));
        }
        self.presets
            .coordinate_for(note)
            .map(|(x, y)| (Block::Preset, x, y))
    }
}

impl Default for CoordinateMapper {
    fn default() -> Self {
        CoordinateMapper {
            scenes: NoteGrid::new(GRID_COLUMNS, &SCENE_ROW_BASES)
                .expect("built-in scene layout is valid"),
            presets: NoteGrid::new(GRID_COLUMNS, &PRESET_ROW_BASES)
                .expect("built-in preset layout is valid"),
        }
    }
}
