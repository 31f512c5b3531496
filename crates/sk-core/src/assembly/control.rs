//! Controls that drive joint travel from external inputs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of input device bound to a control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InputKind {
    #[default]
    Keyboard,
    Joystick,
}

/// Which device input activates a control. The engine never reads devices;
/// the caller decides which controls are active each tick.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputBinding {
    pub kind: InputKind,
    pub button: String,
}

impl InputBinding {
    pub fn keyboard(button: impl Into<String>) -> Self {
        Self {
            kind: InputKind::Keyboard,
            button: button.into(),
        }
    }

    pub fn joystick(button: impl Into<String>) -> Self {
        Self {
            kind: InputKind::Joystick,
            button: button.into(),
        }
    }
}

/// Drives the bushing travel of every joint touching `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub id: Uuid,
    pub name: String,
    pub target: Uuid,
    pub input: InputBinding,
    /// Travel per second (mm/s)
    pub speed: f64,
    pub reverse: bool,
    /// Accumulated input
    #[serde(default)]
    pub value: f64,
}

impl Control {
    pub fn new(name: impl Into<String>, target: Uuid, input: InputBinding, speed: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            target,
            input,
            speed,
            reverse: false,
            value: 0.0,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    pub fn sign(&self) -> f64 {
        if self.reverse { -1.0 } else { 1.0 }
    }

    /// Travel change for one tick of `dt` seconds
    pub fn delta(&self, dt: f64) -> f64 {
        self.speed * dt * self.sign()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_respects_reverse() {
        let control = Control::new(
            "steer",
            Uuid::new_v4(),
            InputBinding::keyboard("ArrowLeft"),
            20.0,
        );
        assert_eq!(control.delta(0.5), 10.0);
        assert_eq!(control.reversed().delta(0.5), -10.0);
    }
}
