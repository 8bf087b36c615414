use std::path::{Path, PathBuf};

use serde::Deserialize;

use groovebox_types::{KnobDescriptor, KnobValue, MachineDescriptor, MachineKind, TransportLimits, TransportState};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    engine: EngineConfig,
    machines: Option<Vec<MachineConfig>>,
    sample_banks: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct ServerConfig {
    bind: Option<String>,
    udp: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TransportConfig {
    bpm: Option<u32>,
    lpb: Option<u32>,
    min_bpm: Option<u32>,
    max_bpm: Option<u32>,
    shuffle: Option<u32>,
}

#[derive(Deserialize, Default)]
struct EngineConfig {
    sample_rate: Option<u32>,
    buffer_frames: Option<u32>,
}

#[derive(Deserialize, Clone)]
struct MachineConfig {
    name: String,
    kind: String,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
    /// MIDI channel, sequencers only.
    channel: Option<u8>,
    #[serde(default)]
    knobs: Vec<KnobConfig>,
}

#[derive(Deserialize, Clone)]
struct KnobConfig {
    name: String,
    value: f64,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
}

/// A machine from the initial graph, ready for the patch bay.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSetup {
    pub descriptor: MachineDescriptor,
    pub channel: u8,
}

pub struct Config {
    file: ConfigFile,
}

impl Config {
    /// Embedded defaults, overlaid with `path` when given, otherwise with the
    /// user file under the config directory.
    pub fn load(path: Option<&Path>) -> Self {
        let mut base: ConfigFile = match toml::from_str(DEFAULT_CONFIG) {
            Ok(base) => base,
            Err(e) => {
                log::error!(target: "config", "embedded config.toml is malformed: {}", e);
                ConfigFile::default()
            }
        };

        let user_path = path.map(Path::to_path_buf).or_else(user_config_path);
        if let Some(path) = user_path {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                        Ok(user) => {
                            merge(&mut base, user);
                            log::info!(target: "config", "loaded {}", path.display());
                        }
                        Err(e) => {
                            log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                        }
                    },
                    Err(e) => {
                        log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                    }
                }
            }
        }

        Config { file: base }
    }

    pub fn bind(&self) -> String {
        self.file
            .server
            .bind
            .clone()
            .unwrap_or_else(|| "127.0.0.1:9400".to_string())
    }

    pub fn udp(&self) -> bool {
        self.file.server.udp.unwrap_or(true)
    }

    pub fn transport_limits(&self) -> TransportLimits {
        let fallback = TransportLimits::default();
        let min_bpm = self.file.transport.min_bpm.unwrap_or(fallback.min_bpm).max(1);
        let max_bpm = self.file.transport.max_bpm.unwrap_or(fallback.max_bpm).max(min_bpm);
        TransportLimits {
            min_bpm,
            max_bpm,
            ..fallback
        }
    }

    /// Initial transport settings. The limits are applied by the clock.
    pub fn transport_state(&self) -> TransportState {
        let fallback = TransportState::default();
        TransportState {
            bpm: self.file.transport.bpm.unwrap_or(fallback.bpm),
            lpb: self.file.transport.lpb.unwrap_or(fallback.lpb),
            shuffle: self.file.transport.shuffle.unwrap_or(fallback.shuffle),
            ..fallback
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.file.engine.sample_rate.unwrap_or(48_000).clamp(8_000, 192_000)
    }

    pub fn buffer_frames(&self) -> u32 {
        self.file.engine.buffer_frames.unwrap_or(256).clamp(16, 8_192)
    }

    pub fn sample_banks(&self) -> Vec<String> {
        self.file.sample_banks.clone().unwrap_or_default()
    }

    /// Machines of the initial graph. Entries with an unknown kind are skipped.
    pub fn machines(&self) -> Vec<MachineSetup> {
        self.file
            .machines
            .iter()
            .flatten()
            .filter_map(|m| {
                let Some(kind) = MachineKind::from_name(&m.kind) else {
                    log::warn!(target: "config", "machine {} has unknown kind {:?}, skipped", m.name, m.kind);
                    return None;
                };
                let inputs: Vec<&str> = m.inputs.iter().map(String::as_str).collect();
                let outputs: Vec<&str> = m.outputs.iter().map(String::as_str).collect();
                let descriptor = m.knobs.iter().fold(
                    MachineDescriptor::new(&m.name, kind)
                        .with_inputs(&inputs)
                        .with_outputs(&outputs)
                        .at(m.x, m.y),
                    |d, k| d.with_knob(knob_descriptor(k)),
                );
                Some(MachineSetup {
                    descriptor,
                    channel: m.channel.unwrap_or(0).min(15),
                })
            })
            .collect()
    }
}

fn knob_descriptor(k: &KnobConfig) -> KnobDescriptor {
    KnobDescriptor::new(&k.name, KnobValue::Double(k.value)).with_range(
        k.min.unwrap_or(0.0),
        k.max.unwrap_or(0.0),
        k.step.unwrap_or(0.0),
    )
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("groovebox").join("config.toml"))
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    if user.server.bind.is_some() {
        base.server.bind = user.server.bind;
    }
    if user.server.udp.is_some() {
        base.server.udp = user.server.udp;
    }
    if user.transport.bpm.is_some() {
        base.transport.bpm = user.transport.bpm;
    }
    if user.transport.lpb.is_some() {
        base.transport.lpb = user.transport.lpb;
    }
    if user.transport.min_bpm.is_some() {
        base.transport.min_bpm = user.transport.min_bpm;
    }
    if user.transport.max_bpm.is_some() {
        base.transport.max_bpm = user.transport.max_bpm;
    }
    if user.transport.shuffle.is_some() {
        base.transport.shuffle = user.transport.shuffle;
    }
    if user.engine.sample_rate.is_some() {
        base.engine.sample_rate = user.engine.sample_rate;
    }
    if user.engine.buffer_frames.is_some() {
        base.engine.buffer_frames = user.engine.buffer_frames;
    }
    // Lists replace rather than extend.
    if user.machines.is_some() {
        base.machines = user.machines;
    }
    if user.sample_banks.is_some() {
        base.sample_banks = user.sample_banks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_user(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_embedded_config() {
        let (_dir, path) = write_user("");
        let config = Config::load(Some(&path));
        assert_eq!(config.bind(), "127.0.0.1:9400");
        assert!(config.udp());
        assert_eq!(config.transport_state().bpm, 120);
        assert_eq!(config.transport_limits().max_bpm, 200);
        assert_eq!(config.sample_rate(), 48_000);
        assert_eq!(config.buffer_frames(), 256);
        assert_eq!(config.sample_banks(), vec!["Drums".to_string()]);

        let machines = config.machines();
        let names: Vec<&str> = machines.iter().map(|m| m.descriptor.name.as_str()).collect();
        assert_eq!(names, vec!["Seq", "Synth", "Output"]);
        assert_eq!(machines[0].descriptor.kind, MachineKind::Sequencer);
        assert_eq!(machines[1].descriptor.knobs.len(), 2);
        assert_eq!(machines[1].descriptor.knobs[1].step, 0.01);
    }

    #[test]
    fn user_file_overrides_fields() {
        let (_dir, path) = write_user(
            r#"
            [server]
            udp = false

            [transport]
            bpm = 90
            max_bpm = 160
            "#,
        );
        let config = Config::load(Some(&path));
        assert!(!config.udp());
        assert_eq!(config.bind(), "127.0.0.1:9400");
        assert_eq!(config.transport_state().bpm, 90);
        assert_eq!(config.transport_state().lpb, 4);
        assert_eq!(config.transport_limits().min_bpm, 20);
        assert_eq!(config.transport_limits().max_bpm, 160);
        assert_eq!(config.machines().len(), 3);
    }

    #[test]
    fn user_machines_replace_defaults() {
        let (_dir, path) = write_user(
            r#"
            [[machines]]
            name = "Lead"
            kind = "sequencer"
            channel = 20

            [[machines]]
            name = "Mystery"
            kind = "theremin"
            "#,
        );
        let machines = Config::load(Some(&path)).machines();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].descriptor.name, "Lead");
        assert_eq!(machines[0].channel, 15);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let (_dir, path) = write_user("[transport\nbpm = ");
        let config = Config::load(Some(&path));
        assert_eq!(config.transport_state().bpm, 120);
        assert_eq!(config.machines().len(), 3);
    }

    #[test]
    fn engine_settings_are_clamped() {
        let (_dir, path) = write_user("[engine]\nsample_rate = 1\nbuffer_frames = 1000000\n");
        let config = Config::load(Some(&path));
        assert_eq!(config.sample_rate(), 8_000);
        assert_eq!(config.buffer_frames(), 8_192);
    }
}
