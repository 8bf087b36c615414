//! Transport clock: turns audio frames into sequencer ticks.

use std::sync::Arc;

use parking_lot::Mutex;

use groovebox_types::{Transport, TransportLimits, TransportState, TICKS_PER_LINE};

/// Song position of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickPosition {
    pub line: u32,
    pub tick: u32,
}

impl TickPosition {
    pub fn is_line_start(&self) -> bool {
        self.tick == 0
    }
}

#[derive(Debug)]
pub struct TransportClock {
    limits: TransportLimits,
    state: TransportState,
    sample_rate: u32,
    line: u32,
    tick: u32,
    /// Frames left before the next tick starts.
    until_next: f64,
}

impl TransportClock {
    pub fn new(limits: TransportLimits, mut state: TransportState, sample_rate: u32) -> Self {
        state.bpm = limits.clamp_bpm(state.bpm);
        state.lpb = limits.clamp_lpb(state.lpb);
        state.shuffle = limits.clamp_shuffle(state.shuffle);
        Self {
            limits,
            state,
            sample_rate: sample_rate.max(1),
            line: 0,
            tick: 0,
            until_next: 0.0,
        }
    }

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    pub fn limits(&self) -> &TransportLimits {
        &self.limits
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn position(&self) -> TickPosition {
        TickPosition {
            line: self.line,
            tick: self.tick,
        }
    }

    /// Frames per tick on `line`. Shuffle stretches even lines and
    /// shortens odd ones by the same amount, so a line pair keeps its length.
    pub fn tick_frames(&self, line: u32) -> f64 {
        let ticks_per_minute =
            self.state.bpm as f64 * self.state.lpb as f64 * TICKS_PER_LINE as f64;
        let base = self.sample_rate as f64 * 60.0 / ticks_per_minute;
        let swing = self.state.shuffle as f64 / 200.0;
        if line % 2 == 0 {
            base * (1.0 + swing)
        } else {
            base * (1.0 - swing)
        }
    }

    /// Advance by `frames`, calling `on_tick(position, frame_offset)` for each
    /// tick that starts inside the span.
    pub fn process<F: FnMut(TickPosition, u32)>(&mut self, frames: u32, mut on_tick: F) {
        if !self.state.playing {
            return;
        }
        let mut offset = 0.0;
        let frames = frames as f64;
        while offset + self.until_next < frames {
            offset += self.until_next;
            on_tick(self.position(), offset as u32);
            self.step();
            self.until_next = self.tick_frames(self.line);
        }
        self.until_next -= frames - offset;
    }

    fn step(&mut self) {
        self.tick += 1;
        if self.tick < TICKS_PER_LINE {
            return;
        }
        self.tick = 0;
        self.line = self.line.saturating_add(1);
        if self.state.loop_enabled && self.state.loop_length > 0 && self.line >= self.state.loop_stop() {
            self.line = self.state.loop_start;
        }
    }

    pub fn set_bpm(&mut self, bpm: u32) -> u32 {
        self.state.bpm = self.limits.clamp_bpm(bpm);
        self.state.bpm
    }

    pub fn set_lpb(&mut self, lpb: u32) -> u32 {
        self.state.lpb = self.limits.clamp_lpb(lpb);
        self.state.lpb
    }

    pub fn set_shuffle(&mut self, shuffle: u32) -> u32 {
        self.state.shuffle = self.limits.clamp_shuffle(shuffle);
        self.state.shuffle
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.state.loop_enabled = enabled;
    }

    pub fn set_loop_start(&mut self, line: u32) {
        self.state.loop_start = line;
    }

    pub fn set_loop_length(&mut self, lines: u32) -> Result<u32, String> {
        if lines == 0 {
            return Err("loop length must be at least one line".to_string());
        }
        self.state.loop_length = lines;
        Ok(lines)
    }

    pub fn set_playing(&mut self, playing: bool) {
        if playing && !self.state.playing {
            self.until_next = 0.0;
        }
        self.state.playing = playing;
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.state.recording = recording;
    }

    pub fn jump(&mut self, line: u32) {
        self.line = line;
        self.tick = 0;
        self.until_next = 0.0;
    }
}

/// `Transport` over a clock shared with the engine thread.
#[derive(Debug, Clone)]
pub struct SharedTransport {
    clock: Arc<Mutex<TransportClock>>,
}

impl SharedTransport {
    pub fn new(clock: TransportClock) -> Self {
        Self {
            clock: Arc::new(Mutex::new(clock)),
        }
    }

    pub fn clock(&self) -> &Arc<Mutex<TransportClock>> {
        &self.clock
    }
}

impl Transport for SharedTransport {
    fn state(&self) -> TransportState {
        self.clock.lock().state().clone()
    }

    fn current_line(&self) -> u32 {
        self.clock.lock().line()
    }

    fn set_bpm(&self, bpm: u32) -> Result<u32, String> {
        Ok(self.clock.lock().set_bpm(bpm))
    }

    fn set_lpb(&self, lpb: u32) -> Result<u32, String> {
        Ok(self.clock.lock().set_lpb(lpb))
    }

    fn set_shuffle(&self, shuffle: u32) -> Result<u32, String> {
        Ok(self.clock.lock().set_shuffle(shuffle))
    }

    fn set_loop_enabled(&self, enabled: bool) -> Result<bool, String> {
        self.clock.lock().set_loop_enabled(enabled);
        Ok(enabled)
    }

    fn set_loop_start(&self, line: u32) -> Result<u32, String> {
        self.clock.lock().set_loop_start(line);
        Ok(line)
    }

    fn set_loop_length(&self, lines: u32) -> Result<u32, String> {
        self.clock.lock().set_loop_length(lines)
    }

    fn set_playing(&self, playing: bool) -> Result<bool, String> {
        self.clock.lock().set_playing(playing);
        Ok(playing)
    }

    fn set_recording(&self, recording: bool) -> Result<bool, String> {
        self.clock.lock().set_recording(recording);
        Ok(recording)
    }

    fn jump(&self, line: u32) -> Result<u32, String> {
        self.clock.lock().jump(line);
        Ok(line)
    }
}
