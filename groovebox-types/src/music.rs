use serde::{Deserialize, Serialize};

/// A seven-degree musical scale, as semitone offsets from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub name: &'static str,
    pub offsets: [u8; 7],
}

/// Built-in scales selectable on the pad. Index 0 is the default.
pub const SCALES: [Scale; 9] = [
    Scale { name: "Major", offsets: [0, 2, 4, 5, 7, 9, 11] },
    Scale { name: "Natural Minor", offsets: [0, 2, 3, 5, 7, 8, 10] },
    Scale { name: "Harmonic Minor", offsets: [0, 2, 3, 5, 7, 8, 11] },
    Scale { name: "Melodic Minor", offsets: [0, 2, 3, 5, 7, 9, 11] },
    Scale { name: "Dorian", offsets: [0, 2, 3, 5, 7, 9, 10] },
    Scale { name: "Phrygian", offsets: [0, 1, 3, 5, 7, 8, 10] },
    Scale { name: "Lydian", offsets: [0, 2, 4, 6, 7, 9, 11] },
    Scale { name: "Mixolydian", offsets: [0, 2, 4, 5, 7, 9, 10] },
    Scale { name: "Locrian", offsets: [0, 1, 3, 5, 6, 8, 10] },
];

impl Scale {
    /// Look up a scale by index, falling back to the first one.
    pub fn get(index: usize) -> &'static Scale {
        SCALES.get(index).unwrap_or(&SCALES[0])
    }

    /// Number of keys across `octaves` repetitions (7, 14 or 21).
    pub fn key_count(octaves: u8) -> usize {
        7 * octaves.clamp(1, 3) as usize
    }

    /// Semitone offset of key `index` in the octave-repeated key array.
    pub fn key(&self, index: usize) -> u8 {
        self.offsets[index % 7] + 12 * (index / 7) as u8
    }

    /// Semitone offset `degrees` scale steps above key `index`.
    pub fn degree_above(&self, index: usize, degrees: usize) -> u8 {
        self.key(index + degrees)
    }
}

/// Chord built from each pad note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChordMode {
    #[default]
    Off,
    /// Scale degrees 0, 2, 4.
    Triad,
    /// Scale degrees 0, 2, 4 plus the root an octave up.
    Quad,
}

impl ChordMode {
    pub fn name(&self) -> &'static str {
        match self {
            ChordMode::Off => "off",
            ChordMode::Triad => "triad",
            ChordMode::Quad => "quad",
        }
    }

    pub fn from_name(name: &str) -> Option<ChordMode> {
        match name {
            "off" => Some(ChordMode::Off),
            "triad" => Some(ChordMode::Triad),
            "quad" => Some(ChordMode::Quad),
            _ => None,
        }
    }
}

/// Arpeggiator key traversal. `Off` sends pad notes straight out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArpDirection {
    #[default]
    Off,
    Forward,
    Reverse,
    PingPong,
}

impl ArpDirection {
    pub fn name(&self) -> &'static str {
        match self {
            ArpDirection::Off => "off",
            ArpDirection::Forward => "forward",
            ArpDirection::Reverse => "reverse",
            ArpDirection::PingPong => "pingpong",
        }
    }

    pub fn from_name(name: &str) -> Option<ArpDirection> {
        match name {
            "off" => Some(ArpDirection::Off),
            "forward" => Some(ArpDirection::Forward),
            "reverse" => Some(ArpDirection::Reverse),
            "pingpong" => Some(ArpDirection::PingPong),
            _ => None,
        }
    }

    pub fn next(&self) -> ArpDirection {
        match self {
            ArpDirection::Off => ArpDirection::Forward,
            ArpDirection::Forward => ArpDirection::Reverse,
            ArpDirection::Reverse => ArpDirection::PingPong,
            ArpDirection::PingPong => ArpDirection::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_arrays_repeat_per_octave() {
        let major = Scale::get(0);
        assert_eq!(Scale::key_count(1), 7);
        assert_eq!(Scale::key_count(2), 14);
        assert_eq!(Scale::key_count(3), 21);
        assert_eq!(Scale::key_count(9), 21);
        assert_eq!(major.key(0), 0);
        assert_eq!(major.key(7), 12);
        assert_eq!(major.key(9), 16);
        assert_eq!(major.key(20), 35);
    }

    #[test]
    fn unknown_scale_falls_back() {
        assert_eq!(Scale::get(99).name, "Major");
    }

    #[test]
    fn direction_names_roundtrip() {
        for d in [
            ArpDirection::Off,
            ArpDirection::Forward,
            ArpDirection::Reverse,
            ArpDirection::PingPong,
        ] {
            assert_eq!(ArpDirection::from_name(d.name()), Some(d));
        }
    }
}
