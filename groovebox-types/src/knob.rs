use serde::{Deserialize, Serialize};

/// Type tag of a knob. Fixed at construction, never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnobType {
    Int,
    Float,
    Double,
    Bool,
    String,
    Enum,
    SampleBank,
}

impl KnobType {
    pub fn name(&self) -> &'static str {
        match self {
            KnobType::Int => "int",
            KnobType::Float => "float",
            KnobType::Double => "double",
            KnobType::Bool => "bool",
            KnobType::String => "string",
            KnobType::Enum => "enum",
            KnobType::SampleBank => "sample_bank",
        }
    }

    pub fn from_name(name: &str) -> Option<KnobType> {
        match name {
            "int" => Some(KnobType::Int),
            "float" => Some(KnobType::Float),
            "double" => Some(KnobType::Double),
            "bool" => Some(KnobType::Bool),
            "string" => Some(KnobType::String),
            "enum" => Some(KnobType::Enum),
            "sample_bank" => Some(KnobType::SampleBank),
            _ => None,
        }
    }

    /// Whether min/max/step are meaningful for this type.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            KnobType::Int | KnobType::Float | KnobType::Double | KnobType::Enum
        )
    }
}

/// Value held by a knob, tagged with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KnobValue {
    Int(i32),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Enum(i32),
    SampleBank(u32),
}

impl KnobValue {
    pub fn kind(&self) -> KnobType {
        match self {
            KnobValue::Int(_) => KnobType::Int,
            KnobValue::Float(_) => KnobType::Float,
            KnobValue::Double(_) => KnobType::Double,
            KnobValue::Bool(_) => KnobType::Bool,
            KnobValue::String(_) => KnobType::String,
            KnobValue::Enum(_) => KnobType::Enum,
            KnobValue::SampleBank(_) => KnobType::SampleBank,
        }
    }

    /// Parse a raw value into the given type. Returns None when the text
    /// does not fit the type.
    pub fn parse(kind: KnobType, raw: &str) -> Option<KnobValue> {
        let raw = raw.trim_matches(|c: char| c == ' ');
        match kind {
            KnobType::Int => raw
                .parse::<i32>()
                .ok()
                .or_else(|| raw.parse::<f64>().ok().map(|v| v.round() as i32))
                .map(KnobValue::Int),
            KnobType::Float => raw.parse::<f32>().ok().map(KnobValue::Float),
            KnobType::Double => raw.parse::<f64>().ok().map(KnobValue::Double),
            KnobType::Bool => match raw {
                "true" | "1" => Some(KnobValue::Bool(true)),
                "false" | "0" => Some(KnobValue::Bool(false)),
                _ => raw.parse::<f64>().ok().map(|v| KnobValue::Bool(v != 0.0)),
            },
            KnobType::String => Some(KnobValue::String(raw.to_string())),
            KnobType::Enum => raw.parse::<i32>().ok().map(KnobValue::Enum),
            KnobType::SampleBank => raw.parse::<u32>().ok().map(KnobValue::SampleBank),
        }
    }

    /// Convert a double into a value of the given type.
    pub fn from_f64(kind: KnobType, v: f64) -> Option<KnobValue> {
        match kind {
            KnobType::Int => Some(KnobValue::Int(v.round() as i32)),
            KnobType::Float => Some(KnobValue::Float(v as f32)),
            KnobType::Double => Some(KnobValue::Double(v)),
            KnobType::Bool => Some(KnobValue::Bool(v != 0.0)),
            KnobType::String => Some(KnobValue::String(format!("{}", v))),
            KnobType::Enum => Some(KnobValue::Enum(v.round() as i32)),
            KnobType::SampleBank if v >= 0.0 => Some(KnobValue::SampleBank(v.round() as u32)),
            KnobType::SampleBank => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            KnobValue::Int(v) | KnobValue::Enum(v) => *v as f64,
            KnobValue::Float(v) => *v as f64,
            KnobValue::Double(v) => *v,
            KnobValue::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            KnobValue::String(s) => s.parse().unwrap_or(0.0),
            KnobValue::SampleBank(v) => *v as f64,
        }
    }

    /// Text form used on the wire. `parse(kind, to_wire())` reproduces the value.
    pub fn to_wire(&self) -> String {
        match self {
            KnobValue::Int(v) | KnobValue::Enum(v) => v.to_string(),
            KnobValue::Float(v) => v.to_string(),
            KnobValue::Double(v) => v.to_string(),
            KnobValue::Bool(v) => v.to_string(),
            KnobValue::String(s) => s.clone(),
            KnobValue::SampleBank(v) => v.to_string(),
        }
    }
}

/// A coarse/fine pair of 7-bit MIDI continuous controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiController {
    pub coarse: u8,
    pub fine: Option<u8>,
}

/// Description and current state of a machine controller, as mirrored by a knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobDescriptor {
    pub name: String,
    pub title: String,
    pub group: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: KnobValue,
    /// Display names for enum knobs, indexed from `min`.
    #[serde(default)]
    pub enum_names: Vec<String>,
    #[serde(default)]
    pub midi: Option<MidiController>,
}

impl KnobDescriptor {
    /// Unbounded knob titled after its name.
    pub fn new(name: &str, value: KnobValue) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            group: String::new(),
            min: 0.0,
            max: 0.0,
            step: 0.0,
            value,
            enum_names: Vec::new(),
            midi: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }

    pub fn kind(&self) -> KnobType {
        self.value.kind()
    }

    /// Bring a candidate value into range and onto the step grid.
    /// Returns None when the value has the wrong type.
    pub fn constrain(&self, value: KnobValue) -> Option<KnobValue> {
        if value.kind() != self.kind() {
            return None;
        }
        let clamp = |v: f64| -> f64 {
            let mut v = v;
            if self.max > self.min {
                v = v.clamp(self.min, self.max);
                if self.step > 0.0 {
                    v = self.min + ((v - self.min) / self.step).round() * self.step;
                    v = v.min(self.max);
                }
            }
            v
        };
        Some(match value {
            KnobValue::Int(v) => KnobValue::Int(clamp(v as f64).round() as i32),
            KnobValue::Enum(v) => KnobValue::Enum(clamp(v as f64).round() as i32),
            KnobValue::Float(v) => KnobValue::Float(clamp(v as f64) as f32),
            KnobValue::Double(v) => KnobValue::Double(clamp(v)),
            other => other,
        })
    }

    /// Display name of the current enum entry, if any.
    pub fn enum_name(&self) -> Option<&str> {
        match self.value {
            KnobValue::Enum(v) => {
                let idx = (v as f64 - self.min).round();
                if idx < 0.0 {
                    return None;
                }
                self.enum_names.get(idx as usize).map(|s| s.as_str())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_knob() -> KnobDescriptor {
        KnobDescriptor {
            name: "cutoff".into(),
            title: "Cutoff".into(),
            group: "Filter".into(),
            min: 0.0,
            max: 1.0,
            step: 0.25,
            value: KnobValue::Float(0.5),
            enum_names: vec![],
            midi: None,
        }
    }

    #[test]
    fn parse_follows_type_tag() {
        assert_eq!(KnobValue::parse(KnobType::Int, "42"), Some(KnobValue::Int(42)));
        assert_eq!(KnobValue::parse(KnobType::Int, "41.6"), Some(KnobValue::Int(42)));
        assert_eq!(KnobValue::parse(KnobType::Bool, "1"), Some(KnobValue::Bool(true)));
        assert_eq!(KnobValue::parse(KnobType::Bool, "false"), Some(KnobValue::Bool(false)));
        assert_eq!(KnobValue::parse(KnobType::Enum, "x"), None);
        assert_eq!(
            KnobValue::parse(KnobType::String, "hello"),
            Some(KnobValue::String("hello".into()))
        );
    }

    #[test]
    fn wire_text_parses_back() {
        let values = [
            KnobValue::Int(-3),
            KnobValue::Float(0.125),
            KnobValue::Double(1.5e-3),
            KnobValue::Bool(true),
            KnobValue::Enum(2),
            KnobValue::SampleBank(7),
        ];
        for v in values {
            assert_eq!(KnobValue::parse(v.kind(), &v.to_wire()), Some(v));
        }
    }

    #[test]
    fn constrain_clamps_and_snaps() {
        let knob = float_knob();
        assert_eq!(knob.constrain(KnobValue::Float(3.0)), Some(KnobValue::Float(1.0)));
        assert_eq!(knob.constrain(KnobValue::Float(0.3)), Some(KnobValue::Float(0.25)));
        assert_eq!(knob.constrain(KnobValue::Int(1)), None);
    }

    #[test]
    fn enum_name_lookup() {
        let knob = KnobDescriptor {
            name: "wave".into(),
            title: "Wave".into(),
            group: String::new(),
            min: 0.0,
            max: 2.0,
            step: 1.0,
            value: KnobValue::Enum(1),
            enum_names: vec!["Sine".into(), "Saw".into(), "Square".into()],
            midi: None,
        };
        assert_eq!(knob.enum_name(), Some("Saw"));
    }
}
