//! Modem power sequencing through the power-key line.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::state::{ConnectivityState, Step};
use super::supervisor::Supervisor;
use crate::at::engine::LINE_TIMEOUT;
use crate::at::Transport;

const APP_READY: &str = "APP RDY";
const POWERED_DOWN: &str = "NORMAL POWER DOWN";
const FIX_LINE: &str = "+QGPSLOC:";
const WATCH_INTERVAL: Duration = Duration::from_millis(200);
const BOOT_WAIT: Duration = Duration::from_secs(40);
const COLD_BOOT_WAIT: Duration = Duration::from_secs(30);
/// A late fix is only trusted if the poll that asked for it is this recent
const LATE_FIX_WINDOW: Duration = Duration::from_secs(600);
/// Added to the age of a late fix for the time the modem spent computing it
const LATE_FIX_SLACK: Duration = Duration::from_secs(6);

#[derive(Debug, Default)]
struct PowerDownWatch {
    powered_down: bool,
    app_ready: bool,
}

impl<T: Transport> Supervisor<T> {
    async fn pulse(&mut self, levels: &[(bool, u64)]) {
        for &(high, hold_ms) in levels {
            if let Err(e) = self.power.set_level(high) {
                warn!("Power key: {}", e);
            }
            if hold_ms > 0 {
                self.at.pause_ms(hold_ms).await;
            }
        }
    }

    async fn turn_off(&mut self) {
        self.pulse(&[(false, 1000), (true, 1000), (false, 0)]).await;
    }

    async fn turn_on(&mut self) {
        self.pulse(&[(false, 1000), (true, 500), (false, 0)]).await;
    }

    /// Next line if one is buffered
    fn take_line(&mut self) -> Option<String> {
        if !self.at.has_input() {
            return None;
        }
        match self.at.read_line(LINE_TIMEOUT) {
            Ok(line) => line,
            Err(e) => {
                debug!("Read during power sequencing failed: {}", e);
                None
            }
        }
    }

    /// Waits up to `limit` for the modem to announce it booted
    async fn await_app_ready(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(line) = self.take_line() {
                if line.contains(APP_READY) {
                    return true;
                }
            }
            self.at.pause(WATCH_INTERVAL).await;
        }
        false
    }

    /// Powers the modem off, keeps it down for `power_down` and powers it on again.
    ///
    /// With `pick_up_fix` a position line that arrives while powering down is still applied.
    /// With `until_powered_down` the wait ends on the power-down notice, and a modem that
    /// only rebooted is left running.
    pub(crate) async fn power_cycle(
        &mut self,
        power_down: Duration,
        pick_up_fix: bool,
        until_powered_down: bool,
    ) {
        info!("Power cycling modem, down for {:?}", power_down);
        self.turn_off().await;

        let mut watch = PowerDownWatch::default();
        let deadline = Instant::now() + power_down;
        while Instant::now() < deadline {
            if let Some(line) = self.take_line() {
                if line.contains(POWERED_DOWN) {
                    watch.powered_down = true;
                } else if line.contains(APP_READY) {
                    watch.app_ready = true;
                }
                if until_powered_down && watch.powered_down {
                    break;
                }
                if pick_up_fix && line.contains(FIX_LINE) {
                    self.pick_up_late_fix(&line).await;
                }
            }
            self.at.pause(WATCH_INTERVAL).await;
        }

        if until_powered_down && watch.app_ready && !watch.powered_down {
            debug!("Modem came up on its own");
            return;
        }

        self.turn_on().await;
        if !self.await_app_ready(BOOT_WAIT).await {
            warn!("No {} within {:?} after power on", APP_READY, BOOT_WAIT);
        }
    }

    async fn pick_up_late_fix(&mut self, line: &str) {
        let Some(asked) = self.gnss.last_poll else {
            return;
        };
        let age = asked.elapsed();
        if age < LATE_FIX_WINDOW {
            debug!("Late fix {:?} after poll", age);
            self.apply_fix(line, age + LATE_FIX_SLACK).await;
        }
    }

    /// Longer key press starting a modem that ignores the normal sequence
    pub(crate) async fn cold_boot(&mut self) {
        warn!("Cold booting modem");
        self.pulse(&[(false, 1000), (true, 2000), (false, 0)]).await;
        if !self.await_app_ready(COLD_BOOT_WAIT).await {
            warn!("No {} within {:?} after cold boot", APP_READY, COLD_BOOT_WAIT);
        }
    }

    pub(crate) async fn quarantine(&mut self) -> Step {
        let power_down = self.escalation.next_quarantine();
        warn!("Quarantine: modem off for {:?}", power_down);
        self.power_cycle(power_down, false, false).await;
        self.net.activated_restart = false;
        Step::Enter(ConnectivityState::ModemRestart)
    }
}
