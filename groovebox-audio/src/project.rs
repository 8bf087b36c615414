//! Project files: the sequencer state of a session as JSON.

use std::fs;
use std::io;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use groovebox_types::{EngineError, SequencerSnapshot, TransportState};

use crate::engine::SequencerEngine;
use crate::pad::legacy::{self, StoredSession, PAD_LEVEL};
use crate::sequencer::MachineSequencer;

pub const PROJECT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("project file is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("project rejected by the engine: {0}")]
    Engine(#[from] EngineError),
    #[error("unsupported project version {0}")]
    Version(u32),
}

fn current_pad_level() -> u32 {
    PAD_LEVEL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerProject {
    pub name: String,
    pub channel: u8,
    pub state: SequencerSnapshot,
    /// Format of `sessions`; older levels are upgraded on load.
    #[serde(default = "current_pad_level")]
    pub pad_level: u32,
    #[serde(default)]
    pub sessions: Vec<StoredSession>,
}

impl SequencerProject {
    pub fn capture(sequencer: &MachineSequencer) -> Self {
        Self {
            name: sequencer.name().to_string(),
            channel: sequencer.channel(),
            state: sequencer.snapshot(),
            pad_level: PAD_LEVEL,
            sessions: sequencer
                .pad()
                .sessions()
                .iter()
                .filter(|s| !s.is_marked())
                .map(legacy::store_session)
                .collect(),
        }
    }

    pub fn build(&self) -> Result<MachineSequencer, EngineError> {
        let mut sequencer = MachineSequencer::new(&self.name, self.channel);
        sequencer.restore(&self.state)?;
        let sessions = self
            .sessions
            .iter()
            .map(|s| legacy::upgrade_session(self.pad_level, s))
            .collect();
        sequencer.pad_mut().load_sessions(sessions);
        Ok(sequencer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub version: u32,
    pub transport: TransportState,
    pub sequencers: Vec<SequencerProject>,
}

impl Project {
    /// Capture every sequencer in `engine` along with the transport settings.
    pub fn capture(engine: &SequencerEngine, transport: TransportState) -> Self {
        Self {
            version: PROJECT_VERSION,
            transport,
            sequencers: engine.sequencers().map(SequencerProject::capture).collect(),
        }
    }

    /// Rebuild the sequencers, all or nothing.
    pub fn build(&self) -> Result<Vec<MachineSequencer>, ProjectError> {
        if self.version > PROJECT_VERSION {
            return Err(ProjectError::Version(self.version));
        }
        Ok(self
            .sequencers
            .iter()
            .map(SequencerProject::build)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

pub fn save(path: &Path, project: &Project) -> Result<(), ProjectError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(project)?;
    fs::write(path, json)?;
    info!(target: "audio::project", "saved {} sequencers to {}", project.sequencers.len(), path.display());
    Ok(())
}

pub fn load(path: &Path) -> Result<Project, ProjectError> {
    let text = fs::read_to_string(path)?;
    let project: Project = serde_json::from_str(&text)?;
    if project.version > PROJECT_VERSION {
        return Err(ProjectError::Version(project.version));
    }
    info!(target: "audio::project", "loaded {} sequencers from {}", project.sequencers.len(), path.display());
    Ok(project)
}
