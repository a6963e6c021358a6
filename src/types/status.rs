//! Watchdog status and its transition table

use serde::{Deserialize, Serialize};

/// Status of the single worker a watchdog manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WatchdogStatus {
    /// No worker process is supervised
    #[default]
    Offline,
    /// A process was launched or is re-initialising and has not reported startup
    Starting,
    /// The worker reported startup and is serving
    Online,
    /// Soft restart: the process stays alive while the worker re-initialises
    Restarting,
    /// Hard restart: the process is being replaced
    HardRestarting,
    /// An explicit stop is tearing the worker down
    Terminating,
}

impl WatchdogStatus {
    /// Whether the supervision loop may move directly from `self` to `next`.
    ///
    /// Crashes never leave `Online` for `Starting` directly: the dead process is
    /// torn down under `HardRestarting` first, which then relaunches or gives up
    /// in `Offline`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use WatchdogStatus::{HardRestarting, Offline, Online, Restarting, Starting, Terminating};
        matches!(
            (self, next),
            (Offline, Starting | Terminating)
                | (Starting, Online | HardRestarting | Offline | Terminating)
                | (Online, Restarting | HardRestarting | Terminating)
                | (Restarting, Starting | HardRestarting | Terminating)
                | (HardRestarting, Starting | Offline | Terminating)
                | (Terminating, Offline)
        )
    }

    /// Whether a worker process is expected to exist in this status
    #[must_use]
    pub const fn has_process(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Starting => "starting",
            Self::Online => "online",
            Self::Restarting => "restarting",
            Self::HardRestarting => "hard-restarting",
            Self::Terminating => "terminating",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::WatchdogStatus::{self, *};

    const ALL: [WatchdogStatus; 6] = [Offline, Starting, Online, Restarting, HardRestarting, Terminating];

    #[test]
    fn test_online_only_reaches_restart_or_terminate() {
        let reachable: Vec<_> = ALL
            .into_iter()
            .filter(|next| Online.can_transition_to(*next))
            .collect();
        assert_eq!(reachable, vec![Restarting, HardRestarting, Terminating]);
    }

    #[test]
    fn test_every_status_can_be_terminated() {
        for status in ALL {
            if status != Terminating {
                assert!(status.can_transition_to(Terminating), "{status} -> terminating");
            }
        }
        assert!(Terminating.can_transition_to(Offline));
        assert!(!Terminating.can_transition_to(Starting));
    }

    #[test]
    fn test_restarts_lead_back_to_starting() {
        assert!(Restarting.can_transition_to(Starting));
        assert!(HardRestarting.can_transition_to(Starting));
        assert!(!Offline.can_transition_to(Online));
    }
}
