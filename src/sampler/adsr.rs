// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The per-voice amplitude envelope.

/// Stage times shorter than this are clamped.
pub const MIN_STAGE_SECONDS: f32 = 0.001;

/// Envelope stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Envelope parameters. Times are seconds, sustain is a level in 0..=1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: 0.003,
            decay: 0.1,
            sustain: 1.0,
            release: 0.3,
        }
    }
}

impl AdsrParams {
    /// Clamps times to the minimum stage length and sustain into 0..=1.
    pub fn clamped(self) -> Self {
        Self {
            attack: self.attack.max(MIN_STAGE_SECONDS),
            decay: self.decay.max(MIN_STAGE_SECONDS),
            sustain: self.sustain.clamp(0.0, 1.0),
            release: self.release.max(MIN_STAGE_SECONDS),
        }
    }
}

/// Attack/Decay/Sustain/Release state machine, advanced once per output
/// frame.
#[derive(Debug, Clone)]
pub struct Adsr {
    stage: Stage,
    level: f32,
    increment: f32,
    params: AdsrParams,
    sample_rate: f32,
}

impl Adsr {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            stage: Stage::Idle,
            level: 0.0,
            increment: 0.0,
            params: AdsrParams::default().clamped(),
            sample_rate,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    /// Adopts new parameters. Attack and decay slopes of a voice mid-stage
    /// follow the change; a running release keeps the slope computed when it
    /// was triggered.
    pub fn set_params(&mut self, params: AdsrParams) {
        let params = params.clamped();
        if params == self.params {
            return;
        }
        self.params = params;
        match self.stage {
            Stage::Attack => self.increment = self.attack_increment(),
            Stage::Decay => self.increment = self.decay_increment(),
            Stage::Idle | Stage::Sustain | Stage::Release => {}
        }
    }

    /// Starts the attack from silence.
    pub fn note_on(&mut self) {
        self.stage = Stage::Attack;
        self.level = 0.0;
        self.increment = self.attack_increment();
    }

    /// Enters release using the configured release time.
    pub fn release(&mut self) {
        self.release_over(self.params.release);
    }

    /// Enters release over the given number of seconds, overriding the
    /// configured release time. Used for same-note retriggers.
    pub fn release_over(&mut self, seconds: f32) {
        if self.stage == Stage::Idle {
            return;
        }
        if self.level <= 0.0 {
            self.stage = Stage::Idle;
            self.level = 0.0;
            return;
        }
        self.stage = Stage::Release;
        self.increment = -self.level / (seconds.max(MIN_STAGE_SECONDS) * self.sample_rate);
    }

    /// Advances the envelope by one frame and returns the new level.
    pub fn next(&mut self) -> f32 {
        match self.stage {
            Stage::Idle => {
                self.level = 0.0;
            }
            Stage::Attack => {
                self.level += self.increment;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                    self.increment = self.decay_increment();
                }
            }
            Stage::Decay => {
                self.level += self.increment;
                if self.level <= self.params.sustain {
                    self.level = self.params.sustain;
                    self.stage = Stage::Sustain;
                    self.increment = 0.0;
                }
            }
            Stage::Sustain => {
                self.level = self.params.sustain;
            }
            Stage::Release => {
                self.level += self.increment;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
        }
        self.level
    }

    fn attack_increment(&self) -> f32 {
        1.0 / (self.params.attack * self.sample_rate)
    }

    fn decay_increment(&self) -> f32 {
        (self.params.sustain - 1.0) / (self.params.decay * self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn params(attack: f32, decay: f32, sustain: f32, release: f32) -> AdsrParams {
        AdsrParams {
            attack,
            decay,
            sustain,
            release,
        }
    }

    #[test]
    fn test_attack_reaches_full_level() {
        let mut env = Adsr::new(SR);
        env.set_params(params(0.01, 0.01, 0.5, 0.1));
        env.note_on();

        let attack_frames = (0.01 * SR) as usize;
        let mut last = 0.0;
        for _ in 0..attack_frames {
            let level = env.next();
            assert!(level >= last, "attack must be monotonic");
            last = level;
        }
        assert!((last - 1.0).abs() < 1e-3);
        assert_eq!(Stage::Decay, env.stage());
    }

    #[test]
    fn test_decay_settles_on_sustain() {
        let mut env = Adsr::new(SR);
        env.set_params(params(0.001, 0.01, 0.5, 0.1));
        env.note_on();

        for _ in 0..((0.001 + 0.011) * SR) as usize {
            env.next();
        }
        assert_eq!(Stage::Sustain, env.stage());
        assert!((env.level() - 0.5).abs() < 1e-6);

        // Sustain holds indefinitely.
        for _ in 0..1000 {
            assert_eq!(0.5, env.next());
        }
    }

    #[test]
    fn test_release_reaches_idle_within_release_time() {
        let release_secs = 0.05;
        let mut env = Adsr::new(SR);
        env.set_params(params(0.001, 0.001, 0.8, release_secs));
        env.note_on();
        for _ in 0..(0.01 * SR) as usize {
            env.next();
        }

        env.release();
        assert_eq!(Stage::Release, env.stage());

        let budget = (release_secs * SR) as usize + 512;
        let mut frames = 0;
        while !env.is_idle() {
            env.next();
            frames += 1;
            assert!(frames <= budget, "release did not reach idle in time");
        }
    }

    #[test]
    fn test_release_from_attack() {
        let mut env = Adsr::new(SR);
        env.set_params(params(0.1, 0.01, 0.5, 0.01));
        env.note_on();
        for _ in 0..100 {
            env.next();
        }
        let level_at_release = env.level();
        assert!(level_at_release < 1.0);

        env.release();
        for _ in 0..(0.011 * SR) as usize {
            env.next();
        }
        assert!(env.is_idle());
    }

    #[test]
    fn test_release_before_any_level_deactivates() {
        let mut env = Adsr::new(SR);
        env.note_on();
        env.release();
        // Level never rose above zero, so there is nothing to ramp down.
        assert!(env.is_idle());
    }

    #[test]
    fn test_same_note_release_override_is_faster() {
        let mut fast = Adsr::new(SR);
        let mut slow = Adsr::new(SR);
        for env in [&mut fast, &mut slow] {
            env.set_params(params(0.001, 0.001, 1.0, 1.0));
            env.note_on();
            for _ in 0..200 {
                env.next();
            }
        }

        fast.release_over(0.01);
        slow.release();
        for _ in 0..(0.011 * SR) as usize {
            fast.next();
            slow.next();
        }
        assert!(fast.is_idle());
        assert!(!slow.is_idle());
    }

    #[test]
    fn test_times_clamp_to_one_millisecond() {
        let mut env = Adsr::new(SR);
        env.set_params(params(0.0, 0.0, 0.5, 0.0));
        env.note_on();

        // Even a zero attack takes at least a millisecond of frames.
        let level = env.next();
        assert!(level < 1.0);
        let one_ms = (MIN_STAGE_SECONDS * SR) as usize;
        for _ in 0..one_ms {
            env.next();
        }
        assert!(env.stage() != Stage::Attack);
    }
}
