//! Controller automation playback.

use std::ops::Bound;

use groovebox_types::EnvelopeSnapshot;

use crate::midi::MidiEventBuilder;

/// Playback window: the point at or before the current time and the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Window {
    previous: Option<(u32, u16)>,
    next: Option<(u32, u16)>,
}

impl Window {
    fn contains(&self, time: u32) -> bool {
        let after_previous = self.previous.is_some_and(|(t, _)| t <= time);
        let before_next = self.next.map_or(true, |(t, _)| time < t);
        after_previous && before_next
    }
}

/// One controller's automation, interpolated linearly between points.
#[derive(Debug, Clone)]
pub struct ControllerEnvelope {
    controller: u8,
    data: EnvelopeSnapshot,
    window: Option<Window>,
    last_sent: Option<u16>,
}

impl ControllerEnvelope {
    pub fn new(controller: u8) -> Self {
        Self::from_snapshot(controller, EnvelopeSnapshot::default())
    }

    pub fn from_snapshot(controller: u8, data: EnvelopeSnapshot) -> Self {
        Self {
            controller,
            data,
            window: None,
            last_sent: None,
        }
    }

    pub fn controller(&self) -> u8 {
        self.controller
    }

    pub fn snapshot(&self) -> &EnvelopeSnapshot {
        &self.data
    }

    /// Edit the points. Playback re-reads the neighbourhood on the next tick.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut EnvelopeSnapshot) -> R) -> R {
        self.window = None;
        f(&mut self.data)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.data.enabled = enabled;
        self.last_sent = None;
    }

    pub fn set_fine(&mut self, fine: Option<u8>) {
        self.data.fine = fine;
    }

    fn seek(&self, time: u32) -> Window {
        let points = &self.data.points;
        Window {
            previous: points.range(..=time).next_back().map(|(t, v)| (*t, *v)),
            next: points
                .range((Bound::Excluded(time), Bound::Unbounded))
                .next()
                .map(|(t, v)| (*t, *v)),
        }
    }

    /// Value at `time`, or None before the first point.
    pub fn value_at(&mut self, time: u32) -> Option<u16> {
        let window = match self.window {
            Some(w) if w.contains(time) => w,
            _ => {
                let w = self.seek(time);
                self.window = Some(w);
                w
            }
        };
        let (t0, v0) = window.previous?;
        let Some((t1, v1)) = window.next else {
            return Some(v0);
        };
        let span = (t1 - t0) as i64;
        let delta = v1 as i64 - v0 as i64;
        Some((v0 as i64 + delta * (time - t0) as i64 / span) as u16)
    }

    /// Emit the controller for `time` when its value changed since the last tick.
    pub fn process(&mut self, time: u32, channel: u8, out: &mut MidiEventBuilder) {
        if !self.data.enabled {
            return;
        }
        let Some(value) = self.value_at(time) else {
            return;
        };
        if self.last_sent == Some(value) {
            return;
        }
        self.last_sent = Some(value);
        out.controller_14bit(channel, self.controller, self.data.fine, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use proptest::prelude::*;

    fn envelope(points: &[(u32, u16)]) -> ControllerEnvelope {
        let mut env = ControllerEnvelope::new(7);
        env.edit(|data| {
            for (t, v) in points {
                data.set_point(*t, *v);
            }
        });
        env
    }

    #[test]
    fn interpolates_and_holds() {
        let mut env = envelope(&[(10, 0), (20, 1000)]);
        assert_eq!(env.value_at(5), None);
        assert_eq!(env.value_at(10), Some(0));
        assert_eq!(env.value_at(15), Some(500));
        assert_eq!(env.value_at(20), Some(1000));
        assert_eq!(env.value_at(400), Some(1000));
        assert_eq!(env.value_at(12), Some(200));
    }

    #[test]
    fn emits_only_on_change() {
        let mut env = envelope(&[(0, 0x2000), (4, 0x2000), (8, 0x3fff)]);
        env.set_fine(Some(39));
        let mut out = MidiEventBuilder::default();
        for t in 0..4 {
            env.process(t, 2, &mut out);
        }
        assert_eq!(
            out.events().iter().map(|e| e.message).collect::<Vec<_>>(),
            vec![
                MidiMessage::Controller { channel: 2, controller: 7, value: 64 },
                MidiMessage::Controller { channel: 2, controller: 39, value: 0 },
            ]
        );
        out.begin();
        env.set_enabled(false);
        env.process(8, 2, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn edits_invalidate_the_window() {
        let mut env = envelope(&[(0, 0), (100, 100)]);
        assert_eq!(env.value_at(50), Some(50));
        env.edit(|data| data.set_point(0, 50));
        assert_eq!(env.value_at(50), Some(75));
    }

    proptest! {
        #[test]
        fn value_stays_between_neighbours(
            points in proptest::collection::btree_map(0u32..512, 0u16..0x4000, 1..16),
            time in 0u32..600,
        ) {
            let list: Vec<(u32, u16)> = points.iter().map(|(t, v)| (*t, *v)).collect();
            let mut env = envelope(&list);
            let previous = points.range(..=time).next_back();
            let next = points.range(time + 1..).next();
            match (previous, next, env.value_at(time)) {
                (None, _, value) => prop_assert_eq!(value, None),
                (Some((_, v0)), None, value) => prop_assert_eq!(value, Some(*v0)),
                (Some((_, v0)), Some((_, v1)), Some(value)) => {
                    prop_assert!(value >= *v0.min(v1) && value <= *v0.max(v1));
                }
                (Some(_), Some(_), None) => prop_assert!(false, "missing value"),
            }
        }
    }
}
