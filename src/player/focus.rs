//! Audio focus and output volume fading.

use std::time::Duration;

/// Audio focus transitions reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gain,
    /// Another application took focus for good
    Loss,
    /// Focus will come back; pause until it does
    LossTransient,
    /// Focus will come back; keep playing quietly
    LossTransientCanDuck,
}

/// Host audio session: focus requests and media-button routing.
pub trait AudioSession: Send {
    /// Ask for playback focus. Returns false when the host refused.
    fn request_focus(&mut self) -> bool;

    fn abandon_focus(&mut self);

    /// Route hardware media buttons to this player.
    fn register_media_buttons(&mut self);

    fn unregister_media_buttons(&mut self);

    /// Hold or drop the host's wake lock.
    fn set_keep_awake(&mut self, _awake: bool) {}
}

/// Session for hosts without focus arbitration. Focus is always granted.
#[derive(Debug, Default)]
pub struct NoopAudioSession;

impl AudioSession for NoopAudioSession {
    fn request_focus(&mut self) -> bool {
        true
    }

    fn abandon_focus(&mut self) {}

    fn register_media_buttons(&mut self) {}

    fn unregister_media_buttons(&mut self) {}
}

/// Interval between fade steps.
pub const FADE_TICK: Duration = Duration::from_millis(10);

/// Volume kept while ducked.
pub const DUCK_VOLUME: f32 = 0.2;

/// Volume a resumed track fades up from.
pub const RESUME_VOLUME: f32 = 0.0;

/// Unattenuated output.
pub const FULL_VOLUME: f32 = 1.0;

const DUCK_STEP: f32 = 0.05;
const FADE_UP_STEP: f32 = 0.01;

/// Steps the output volume toward a target, one [`FADE_TICK`] at a time.
///
/// Ducking moves down in steps of 0.05; fading up moves in steps of 0.01.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeFader {
    volume: f32,
    target: f32,
}

impl Default for VolumeFader {
    fn default() -> Self {
        Self {
            volume: FULL_VOLUME,
            target: FULL_VOLUME,
        }
    }
}

impl VolumeFader {
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// True while a fade is in progress.
    pub fn is_fading(&self) -> bool {
        self.volume != self.target
    }

    /// Start fading down to [`DUCK_VOLUME`].
    pub fn duck(&mut self) {
        self.target = DUCK_VOLUME;
    }

    /// Start fading up to full volume.
    pub fn fade_up(&mut self) {
        self.target = FULL_VOLUME;
    }

    /// Jump to `volume` without fading and make it the target.
    pub fn set_immediate(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, FULL_VOLUME);
        self.target = self.volume;
    }

    /// Advance one step. Returns the new volume, or `None` when settled.
    pub fn tick(&mut self) -> Option<f32> {
        if !self.is_fading() {
            return None;
        }
        self.volume = if self.volume > self.target {
            (self.volume - DUCK_STEP).max(self.target)
        } else {
            (self.volume + FADE_UP_STEP).min(self.target)
        };
        Some(self.volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks_until_settled(fader: &mut VolumeFader) -> usize {
        let mut n = 0;
        while fader.tick().is_some() {
            n += 1;
            assert!(n < 1000, "fade never settled");
        }
        n
    }

    #[test]
    fn test_duck_steps_down_to_duck_volume() {
        let mut fader = VolumeFader::default();
        fader.duck();
        assert!(fader.is_fading());

        let first = fader.tick().unwrap();
        assert!((first - 0.95).abs() < 1e-6);

        let steps = ticks_until_settled(&mut fader);
        assert_eq!(fader.volume(), DUCK_VOLUME);
        assert!((16..=17).contains(&(steps + 1)));
    }

    #[test]
    fn test_fade_up_is_slower_than_duck() {
        let mut fader = VolumeFader::default();
        fader.set_immediate(DUCK_VOLUME);
        fader.fade_up();

        let first = fader.tick().unwrap();
        assert!((first - 0.21).abs() < 1e-6);

        ticks_until_settled(&mut fader);
        assert_eq!(fader.volume(), 1.0);
        assert!(!fader.is_fading());
    }

    #[test]
    fn test_settled_fader_does_not_tick() {
        let mut fader = VolumeFader::default();
        assert_eq!(fader.tick(), None);
        fader.set_immediate(3.0);
        assert_eq!(fader.volume(), 1.0);
    }

    #[test]
    fn test_noop_session_grants_focus() {
        let mut session = NoopAudioSession;
        assert!(session.request_focus());
    }
}
