//! Pad coordinates to notes, velocities and controller values.

use groovebox_types::{ChordMode, PadConfiguration, Scale, MAX_PAD_CHORD, PAD_AXIS_MAX};

use super::motion::Voicing;
use crate::midi::{split_14bit, MidiEventBuilder};

/// Index of the scale key under `x`.
pub fn key_index(config: &PadConfiguration, x: u16) -> usize {
    let keys = Scale::key_count(config.range);
    let x = x.min(PAD_AXIS_MAX) as usize;
    (x * keys / (PAD_AXIS_MAX as usize + 1)).min(keys - 1)
}

/// Notes sounded for a press at `x`: the key alone, or a chord on top of it.
pub fn voicing(config: &PadConfiguration, x: u16) -> Voicing {
    let scale = Scale::get(config.scale);
    let index = key_index(config, x);
    let base = 12 * config.octave as u16;
    let mut offsets = [0u8; MAX_PAD_CHORD];
    let count = match config.chord_mode {
        ChordMode::Off => {
            offsets[0] = scale.key(index);
            1
        }
        ChordMode::Triad | ChordMode::Quad => {
            offsets[0] = scale.key(index);
            offsets[1] = scale.degree_above(index, 2);
            offsets[2] = scale.degree_above(index, 4);
            if config.chord_mode == ChordMode::Quad {
                offsets[3] = scale.key(index) + 12;
                4
            } else {
                3
            }
        }
    };
    let mut v = Voicing::default();
    for offset in &offsets[..count] {
        let note = base + *offset as u16;
        if note <= 127 {
            v.notes[v.count] = note as u8;
            v.count += 1;
        }
    }
    v
}

/// Note velocity from the coarse part of `z`. Never zero.
pub fn velocity(z: u16) -> u8 {
    split_14bit(z).0.max(1)
}

/// Send the y and z axis controllers bound in `config`.
pub fn send_axes(config: &PadConfiguration, channel: u8, y: u16, z: u16, out: &mut MidiEventBuilder) {
    if let Some(c) = config.y_axis {
        out.controller_14bit(channel, c.coarse, c.fine, y);
    }
    if let Some(c) = config.z_axis {
        out.controller_14bit(channel, c.coarse, c.fine, z);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groovebox_types::MidiController;

    fn config(range: u8, chord_mode: ChordMode) -> PadConfiguration {
        PadConfiguration {
            range,
            chord_mode,
            octave: 4,
            ..Default::default()
        }
    }

    #[test]
    fn x_spans_the_key_array() {
        let c = config(2, ChordMode::Off);
        assert_eq!(key_index(&c, 0), 0);
        assert_eq!(key_index(&c, PAD_AXIS_MAX), 13);
        assert_eq!(key_index(&c, 0x2000), 7);
        assert_eq!(voicing(&c, 0x2000).as_slice(), &[60]);
        assert_eq!(voicing(&c, 0).as_slice(), &[48]);
    }

    #[test]
    fn chords_stack_scale_degrees() {
        let triad = voicing(&config(1, ChordMode::Triad), 0);
        assert_eq!(triad.as_slice(), &[48, 52, 55]);
        let quad = voicing(&config(1, ChordMode::Quad), 0);
        assert_eq!(quad.as_slice(), &[48, 52, 55, 60]);
    }

    #[test]
    fn notes_above_the_midi_range_are_dropped() {
        let mut c = config(3, ChordMode::Quad);
        c.octave = 8;
        let v = voicing(&c, PAD_AXIS_MAX);
        assert!(v.as_slice().iter().all(|n| *n <= 127));
        assert!(v.count < 4);
    }

    #[test]
    fn axes_and_velocity() {
        assert_eq!(velocity(0), 1);
        assert_eq!(velocity(PAD_AXIS_MAX), 127);
        let mut c = config(1, ChordMode::Off);
        c.y_axis = Some(MidiController { coarse: 1, fine: Some(33) });
        let mut out = MidiEventBuilder::default();
        send_axes(&c, 0, 0x3fff, 0, &mut out);
        assert_eq!(out.events().len(), 2);
    }
}
