//! Reconfigurable analog front-end (RAFE) controller.
//!
//! Holds the selected analyte, the operating mode derived from it and the
//! virtual switch-matrix pin assignments. Every mutation commits a whole new
//! state under the state mutex and only then notifies subscribers, so an
//! observer never sees pins from one mode paired with another.
//!
//! # Mode lock sharp edge
//!
//! `lock_mode` is not re-entrant. A second call while already locked
//! overwrites the reason but keeps the original `acquired_at`, and a single
//! `unlock_mode` releases it regardless of how many times it was locked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use biosense_traits::Clock;
use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::util::lock;

/// Operating mode of the front-end, derived from the analyte class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RafeMode {
    /// Amperometric electrochemistry in a liquid sample.
    LiquidEc,
    /// Ion-selective electrode against a reference.
    Potentiometric,
    /// Chemiresistive gas sensing at high impedance.
    GasHighImpedance,
    /// Impedance spectroscopy through a solid or gel contact.
    SolidEis,
}

impl RafeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RafeMode::LiquidEc => "liquid-ec",
            RafeMode::Potentiometric => "potentiometric",
            RafeMode::GasHighImpedance => "gas-high-impedance",
            RafeMode::SolidEis => "solid-eis",
        }
    }

    /// Physical pin routing for this mode.
    pub fn pins(self) -> &'static [PinAssignment] {
        use PinRole::*;
        match self {
            RafeMode::LiquidEc => &[
                PinAssignment { pin: 1, role: Working },
                PinAssignment { pin: 2, role: Reference },
                PinAssignment { pin: 3, role: Counter },
            ],
            RafeMode::Potentiometric => &[
                PinAssignment { pin: 4, role: IonSelective },
                PinAssignment { pin: 2, role: Reference },
            ],
            RafeMode::GasHighImpedance => &[
                PinAssignment { pin: 5, role: GasSense },
                PinAssignment { pin: 6, role: GasSense },
                PinAssignment { pin: 7, role: Heater },
            ],
            RafeMode::SolidEis => &[
                PinAssignment { pin: 8, role: Excitation },
                PinAssignment { pin: 1, role: Working },
                PinAssignment { pin: 9, role: Guard },
            ],
        }
    }
}

impl std::fmt::Display for RafeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRole {
    Working,
    Reference,
    Counter,
    IonSelective,
    GasSense,
    Heater,
    Excitation,
    Guard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinAssignment {
    pub pin: u8,
    pub role: PinRole,
}

/// Static analyte → mode table. Names are matched case-insensitively.
const ANALYTES: &[(&str, RafeMode)] = &[
    ("glucose", RafeMode::LiquidEc),
    ("lactate", RafeMode::LiquidEc),
    ("uric_acid", RafeMode::LiquidEc),
    ("sodium", RafeMode::Potentiometric),
    ("potassium", RafeMode::Potentiometric),
    ("ph", RafeMode::Potentiometric),
    ("voc", RafeMode::GasHighImpedance),
    ("acetone", RafeMode::GasHighImpedance),
    ("ammonia", RafeMode::GasHighImpedance),
    ("co2", RafeMode::GasHighImpedance),
    ("cortisol", RafeMode::SolidEis),
];

/// Look up the mode for an analyte name.
pub fn mode_for_analyte(name: &str) -> Option<RafeMode> {
    let key = name.trim().to_ascii_lowercase();
    ANALYTES
        .iter()
        .find(|(n, _)| *n == key)
        .map(|(_, mode)| *mode)
}

/// All analytes the controller can target.
pub fn known_analytes() -> impl Iterator<Item = &'static str> {
    ANALYTES.iter().map(|(n, _)| *n)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeLock {
    pub reason: String,
    pub acquired_at: Instant,
}

/// Committed controller state handed to `get_state` callers and subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct RafeState {
    pub target_analyte: String,
    pub mode: RafeMode,
    pub pins: Vec<PinAssignment>,
    pub mode_lock: Option<ModeLock>,
    /// Incremented on every committed change.
    pub revision: u64,
}

impl RafeState {
    pub fn is_locked(&self) -> bool {
        self.mode_lock.is_some()
    }

    /// Physical pin numbers in routing order.
    pub fn pin_numbers(&self) -> Vec<u8> {
        self.pins.iter().map(|p| p.pin).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&RafeState) + Send + Sync>;

/// The single RAFE controller of a device session.
///
/// Subscribers run synchronously on the mutating thread after the commit.
/// They must not call mutating methods on the same controller.
pub struct RafeController {
    state: Mutex<RafeState>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    // Serializes commit + notify so observers see revisions in order.
    notify: Mutex<()>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for RafeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RafeController")
            .field("state", &*lock(&self.state))
            .field("subscribers", &lock(&self.subscribers).len())
            .finish()
    }
}

impl RafeController {
    /// Create a controller targeting `analyte`, unlocked.
    pub fn new(analyte: &str, clock: Arc<dyn Clock + Send + Sync>) -> Result<Self> {
        let mode = mode_for_analyte(analyte)
            .ok_or_else(|| eyre::Report::new(CoreError::UnknownAnalyte(analyte.to_string())))?;
        Ok(Self {
            state: Mutex::new(RafeState {
                target_analyte: analyte.trim().to_ascii_lowercase(),
                mode,
                pins: mode.pins().to_vec(),
                mode_lock: None,
                revision: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            notify: Mutex::new(()),
            next_id: AtomicU64::new(1),
            clock,
        })
    }

    /// Select a target analyte and return the resulting mode.
    ///
    /// While locked this is a no-op returning the current mode; compare with
    /// `mode_for_analyte(name)` to detect the rejection. Unknown names are an
    /// error only when unlocked; `Orchestrator::measure_analyte` validates the
    /// name up front and refuses unknown analytes in both states.
    pub fn select_target_analyte(&self, name: &str) -> Result<RafeMode> {
        let _serial = lock(&self.notify);
        let snapshot = {
            let mut st = lock(&self.state);
            if let Some(ml) = &st.mode_lock {
                tracing::info!(
                    requested = name,
                    current = %st.mode,
                    lock_reason = %ml.reason,
                    "analyte switch ignored: mode locked"
                );
                return Ok(st.mode);
            }
            let key = name.trim().to_ascii_lowercase();
            let mode = mode_for_analyte(&key)
                .ok_or_else(|| eyre::Report::new(CoreError::UnknownAnalyte(name.to_string())))?;
            if st.target_analyte == key {
                return Ok(st.mode);
            }
            let from = st.mode;
            let revision = st.revision + 1;
            *st = RafeState {
                target_analyte: key,
                mode,
                pins: mode.pins().to_vec(),
                mode_lock: None,
                revision,
            };
            tracing::info!(analyte = %st.target_analyte, %from, to = %mode, "RAFE mode switched");
            st.clone()
        };
        self.notify_all(&snapshot);
        Ok(snapshot.mode)
    }

    /// Freeze the mode. See the module docs for the re-entrancy sharp edge.
    pub fn lock_mode(&self, reason: &str) {
        let _serial = lock(&self.notify);
        let snapshot = {
            let mut st = lock(&self.state);
            match st.mode_lock.as_mut() {
                Some(ml) => {
                    tracing::warn!(
                        previous = %ml.reason,
                        reason,
                        "RAFE mode lock re-acquired; reason overwritten"
                    );
                    ml.reason = reason.to_string();
                }
                None => {
                    st.mode_lock = Some(ModeLock {
                        reason: reason.to_string(),
                        acquired_at: self.clock.now(),
                    });
                    tracing::info!(reason, mode = %st.mode, "RAFE mode locked");
                }
            }
            st.revision += 1;
            st.clone()
        };
        self.notify_all(&snapshot);
    }

    /// Release the mode lock. Returns false if it was not held.
    pub fn unlock_mode(&self, reason: &str) -> bool {
        let _serial = lock(&self.notify);
        let snapshot = {
            let mut st = lock(&self.state);
            let Some(prev) = st.mode_lock.take() else {
                tracing::debug!(reason, "RAFE unlock requested while unlocked");
                return false;
            };
            tracing::info!(
                reason,
                held_for_ms = self.clock.ms_since(prev.acquired_at),
                "RAFE mode unlocked"
            );
            st.revision += 1;
            st.clone()
        };
        self.notify_all(&snapshot);
        true
    }

    pub fn get_state(&self) -> RafeState {
        lock(&self.state).clone()
    }

    pub fn is_locked(&self) -> bool {
        lock(&self.state).is_locked()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&RafeState) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    fn notify_all(&self, snapshot: &RafeState) {
        // Clone the handles so a subscriber may (un)subscribe without deadlock.
        let subs: Vec<Subscriber> = lock(&self.subscribers)
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for s in subs {
            s(snapshot);
        }
    }
}
