//! Gesprächsdauer eines verbundenen Calls

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("Cannot reset a running call timer")]
    Running,
}

/// Zählt die Sekunden im Zustand `Connected`
///
/// Der Timer selbst besitzt keinen Takt; der Besitzer ruft `tick()` einmal
/// pro Sekunde auf. Ticks eines gestoppten Timers werden ignoriert.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallTimer {
    seconds: u64,
    running: bool,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Timer; `false` wenn er bereits lief
    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        true
    }

    /// Hält an, der letzte Wert bleibt erhalten
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) -> Result<(), TimerError> {
        if self.running {
            return Err(TimerError::Running);
        }
        self.seconds = 0;
        Ok(())
    }

    /// Zählt eine Sekunde weiter und gibt den neuen Wert zurück
    pub fn tick(&mut self) -> Option<u64> {
        if !self.running {
            return None;
        }
        self.seconds += 1;
        Some(self.seconds)
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_only_while_running() {
        let mut timer = CallTimer::new();
        assert_eq!(timer.tick(), None);

        assert!(timer.start());
        assert_eq!(timer.tick(), Some(1));
        assert_eq!(timer.tick(), Some(2));

        timer.stop();
        assert_eq!(timer.tick(), None);
        assert_eq!(timer.seconds(), 2);
    }

    #[test]
    fn test_double_start_is_guarded() {
        let mut timer = CallTimer::new();
        assert!(timer.start());
        timer.tick();
        assert!(!timer.start());
        assert_eq!(timer.seconds(), 1);
    }

    #[test]
    fn test_reset_only_when_stopped() {
        let mut timer = CallTimer::new();
        timer.start();
        timer.tick();

        assert_eq!(timer.reset(), Err(TimerError::Running));
        assert_eq!(timer.seconds(), 1);

        timer.stop();
        assert_eq!(timer.reset(), Ok(()));
        assert_eq!(timer.seconds(), 0);
    }
}
