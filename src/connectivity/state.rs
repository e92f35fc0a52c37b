use serde::Serialize;
use std::fmt;

/// Phase of the connectivity supervisor. Exactly one is live at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectivityState {
    #[default]
    ModemRestart,
    NetworkInit,
    Gnss,
    MqttConnect,
    MqttListen,
    CheckSubscription,
    CheckConnection,
    Quarantine,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::ModemRestart => "modem restart",
            ConnectivityState::NetworkInit => "network init",
            ConnectivityState::Gnss => "gnss",
            ConnectivityState::MqttConnect => "mqtt connect",
            ConnectivityState::MqttListen => "mqtt listen",
            ConnectivityState::CheckSubscription => "check subscription",
            ConnectivityState::CheckConnection => "check connection",
            ConnectivityState::Quarantine => "quarantine",
        };
        write!(f, "{}", name)
    }
}

/// Resumable position inside a phase.
///
/// `step` indexes the phase's sub-operation list and only moves forward on success.
/// `attempts` is the retry/poll counter of the current sub-operation and restarts at zero
/// whenever `step` advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepSequencer {
    step: usize,
    attempts: u32,
}

impl StepSequencer {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn advance(&mut self) {
        self.step += 1;
        self.attempts = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Counts one more attempt and returns the new count
    pub fn bump(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Counts one more attempt and returns the count before it
    pub fn take_attempt(&mut self) -> u32 {
        let before = self.attempts;
        self.attempts += 1;
        before
    }
}

/// What a sub-operation asks the supervisor to do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Retry the same sub-operation next tick
    Stay,
    /// Move to the next sub-operation
    Advance,
    /// Leave the phase
    Enter(ConnectivityState),
    /// Enter the listening phase with fresh health timers
    Listen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_clears_the_attempt_counter() {
        let mut seq = StepSequencer::default();
        assert_eq!(seq.take_attempt(), 0);
        assert_eq!(seq.bump(), 2);
        seq.advance();
        assert_eq!(seq.step(), 1);
        assert_eq!(seq.attempts(), 0);
        seq.reset();
        assert_eq!(seq, StepSequencer::default());
    }
}
