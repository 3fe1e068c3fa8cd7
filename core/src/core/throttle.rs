//! Host-pressure throttle for task admission.
//!
//! Maps each resource snapshot onto one of four ordered levels and publishes
//! the result as a single immutable [`ThrottleState`]. Readers go through
//! `ArcSwap`, so `current_level()` never waits on the sampling loop.
//!
//! Escalation commits on the first breaching sample. De-escalation needs
//! `recovery_samples` consecutive samples that clear the thresholds by
//! `hysteresis_margin`, and then settles on the most restrictive level seen
//! during that streak.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::core::resources::{ResourceSampler, ResourceSnapshot};
use crate::core::{lock, shutdown_requested, BackgroundHandle};

/// LIGHT starts at this fraction of the CPU ceiling.
const LIGHT_CPU_FACTOR: f64 = 0.8;
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Discrete admission policy. Higher is more restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleLevel {
    Normal = 0,
    Light = 1,
    Heavy = 2,
    Pause = 3,
}

impl ThrottleLevel {
    pub const ALL: [ThrottleLevel; 4] = [
        ThrottleLevel::Normal,
        ThrottleLevel::Light,
        ThrottleLevel::Heavy,
        ThrottleLevel::Pause,
    ];

    /// Wire value consumed by the admin UI.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ThrottleLevel::Normal),
            1 => Some(ThrottleLevel::Light),
            2 => Some(ThrottleLevel::Heavy),
            3 => Some(ThrottleLevel::Pause),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ThrottleLevel::Normal => "NORMAL",
            ThrottleLevel::Light => "LIGHT",
            ThrottleLevel::Heavy => "HEAVY",
            ThrottleLevel::Pause => "PAUSE",
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleThresholds {
    pub disk_min_free_percent: f64,
    pub cpu_max_percent: f64,
    pub memory_max_percent: f64,
    /// Width of the band a metric must clear before it counts toward recovery.
    pub hysteresis_margin: f64,
}

impl Default for ThrottleThresholds {
    fn default() -> Self {
        Self {
            disk_min_free_percent: 15.0,
            cpu_max_percent: 85.0,
            memory_max_percent: 85.0,
            hysteresis_margin: 2.0,
        }
    }
}

impl ThrottleThresholds {
    /// First match wins: disk, then CPU ceiling, then the LIGHT band.
    pub fn classify(&self, s: &ResourceSnapshot) -> ThrottleLevel {
        if s.disk_free_percent < self.disk_min_free_percent {
            ThrottleLevel::Pause
        } else if s.cpu_percent > self.cpu_max_percent {
            ThrottleLevel::Heavy
        } else if s.cpu_percent > self.cpu_max_percent * LIGHT_CPU_FACTOR
            || s.memory_percent > self.memory_max_percent
        {
            ThrottleLevel::Light
        } else {
            ThrottleLevel::Normal
        }
    }

    /// Level of `s` judged against the lower band. Never below `classify(s)`.
    pub fn recovery_level(&self, s: &ResourceSnapshot) -> ThrottleLevel {
        let relaxed = Self {
            disk_min_free_percent: self.disk_min_free_percent + self.hysteresis_margin,
            cpu_max_percent: self.cpu_max_percent - self.hysteresis_margin,
            memory_max_percent: self.memory_max_percent - self.hysteresis_margin,
            hysteresis_margin: 0.0,
        };
        relaxed.classify(s).max(self.classify(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub thresholds: ThrottleThresholds,
    pub recovery_samples: u32,
    /// Stale samples tolerated in a row before forcing `PAUSE`.
    pub max_consecutive_misses: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            thresholds: ThrottleThresholds::default(),
            recovery_samples: 2,
            max_consecutive_misses: 3,
        }
    }
}

/// The single authoritative throttle decision.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleState {
    pub level: ThrottleLevel,
    pub snapshot: ResourceSnapshot,
    pub decided_at: DateTime<Utc>,
    /// Set when the level was forced by persistent sampling failure.
    pub fail_safe: bool,
}

#[derive(Debug, Clone)]
pub struct LevelChange {
    pub from: ThrottleLevel,
    pub to: ThrottleLevel,
    pub snapshot: ResourceSnapshot,
}

#[derive(Default)]
struct RecoveryStreak {
    samples: u32,
    worst: Option<ThrottleLevel>,
}

pub struct ThrottleController {
    config: ThrottleConfig,
    state: ArcSwap<ThrottleState>,
    streak: Mutex<RecoveryStreak>,
    changes: broadcast::Sender<LevelChange>,
    escalations: AtomicU64,
    samples_observed: AtomicU64,
}

impl ThrottleController {
    /// Seeds the controller from a first snapshot, classified without
    /// hysteresis.
    pub fn new(config: ThrottleConfig, initial: ResourceSnapshot) -> Self {
        let level = config.thresholds.classify(&initial);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            config,
            state: ArcSwap::from_pointee(ThrottleState {
                level,
                decided_at: Utc::now(),
                snapshot: initial,
                fail_safe: false,
            }),
            streak: Mutex::new(RecoveryStreak::default()),
            changes,
            escalations: AtomicU64::new(0),
            samples_observed: AtomicU64::new(0),
        }
    }

    pub fn current_level(&self) -> ThrottleLevel {
        self.state.load().level
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.state.load().snapshot.clone()
    }

    pub fn state(&self) -> Arc<ThrottleState> {
        self.state.load_full()
    }

    pub fn thresholds(&self) -> &ThrottleThresholds {
        &self.config.thresholds
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LevelChange> {
        self.changes.subscribe()
    }

    pub fn escalations(&self) -> u64 {
        self.escalations.load(Relaxed)
    }

    pub fn samples_observed(&self) -> u64 {
        self.samples_observed.load(Relaxed)
    }

    /// Folds one sample into the committed state and returns the new level.
    ///
    /// Only the sampling loop calls this in production; it is the single
    /// writer of the published state.
    pub fn observe(&self, snapshot: ResourceSnapshot, consecutive_misses: u32) -> ThrottleLevel {
        self.samples_observed.fetch_add(1, Relaxed);
        let current = self.state.load_full();
        let thresholds = &self.config.thresholds;

        let fail_safe = consecutive_misses > self.config.max_consecutive_misses;
        let raw = if fail_safe {
            ThrottleLevel::Pause
        } else {
            thresholds.classify(&snapshot)
        };

        let next = {
            let mut streak = lock(&self.streak);
            if raw >= current.level {
                *streak = RecoveryStreak::default();
                raw
            } else {
                let candidate = thresholds.recovery_level(&snapshot);
                if candidate < current.level {
                    streak.samples += 1;
                    let worst = streak.worst.map_or(candidate, |w| w.max(candidate));
                    streak.worst = Some(worst);
                    if streak.samples >= self.config.recovery_samples {
                        *streak = RecoveryStreak::default();
                        worst
                    } else {
                        current.level
                    }
                } else {
                    *streak = RecoveryStreak::default();
                    current.level
                }
            }
        };

        let decided_at = Utc::now().max(current.decided_at);
        self.state.store(Arc::new(ThrottleState {
            level: next,
            snapshot: snapshot.clone(),
            decided_at,
            fail_safe,
        }));

        if next != current.level {
            if next > current.level {
                self.escalations.fetch_add(1, Relaxed);
                warn!(
                    "Throttle escalated {} -> {} (cpu {:.1}%, mem {:.1}%, disk free {:.1}%{})",
                    current.level,
                    next,
                    snapshot.cpu_percent,
                    snapshot.memory_percent,
                    snapshot.disk_free_percent,
                    if fail_safe { ", sampling failing" } else { "" },
                );
            } else {
                info!("Throttle relaxed {} -> {}", current.level, next);
            }
            let _ = self.changes.send(LevelChange {
                from: current.level,
                to: next,
                snapshot,
            });
        }

        next
    }

    /// Spawns the periodic sampling loop. The first tick samples immediately.
    pub fn start(
        self: &Arc<Self>,
        sampler: Arc<ResourceSampler>,
        interval: Duration,
    ) -> BackgroundHandle {
        let controller = Arc::clone(self);
        BackgroundHandle::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = sampler.sample().await;
                        controller.observe(snapshot, sampler.consecutive_misses());
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            debug!("Sampling loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resources::tests::ScriptedProbe;
    use crate::core::resources::Metric;

    fn snap(cpu: f64, mem: f64, disk: f64) -> ResourceSnapshot {
        ResourceSnapshot::new(cpu, mem, disk)
    }

    fn controller_at(cpu: f64, mem: f64, disk: f64) -> ThrottleController {
        ThrottleController::new(ThrottleConfig::default(), snap(cpu, mem, disk))
    }

    #[test]
    fn test_level_wire_values() {
        for level in ThrottleLevel::ALL {
            assert_eq!(ThrottleLevel::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(ThrottleLevel::Normal.as_u8(), 0);
        assert_eq!(ThrottleLevel::Pause.as_u8(), 3);
        assert_eq!(ThrottleLevel::from_u8(4), None);
        assert!(ThrottleLevel::Normal < ThrottleLevel::Light);
        assert!(ThrottleLevel::Heavy < ThrottleLevel::Pause);
    }

    #[test]
    fn test_low_disk_always_pauses() {
        let t = ThrottleThresholds::default();
        for cpu in [0.0, 50.0, 99.0] {
            for mem in [0.0, 90.0] {
                for disk in [0.0, 7.5, 14.99] {
                    assert_eq!(t.classify(&snap(cpu, mem, disk)), ThrottleLevel::Pause);
                }
            }
        }
    }

    #[test]
    fn test_cpu_ceiling_is_heavy_when_disk_ok() {
        let t = ThrottleThresholds::default();
        for disk in [15.0, 40.0, 100.0] {
            assert_eq!(t.classify(&snap(85.1, 10.0, disk)), ThrottleLevel::Heavy);
            assert_eq!(t.classify(&snap(99.0, 99.0, disk)), ThrottleLevel::Heavy);
        }
    }

    #[test]
    fn test_light_band() {
        let t = ThrottleThresholds::default();
        assert_eq!(t.classify(&snap(68.1, 10.0, 50.0)), ThrottleLevel::Light);
        assert_eq!(t.classify(&snap(68.0, 10.0, 50.0)), ThrottleLevel::Normal);
        assert_eq!(t.classify(&snap(10.0, 85.1, 50.0)), ThrottleLevel::Light);
        assert_eq!(t.classify(&snap(30.0, 40.0, 50.0)), ThrottleLevel::Normal);
    }

    #[test]
    fn test_scenario_levels() {
        assert_eq!(controller_at(30.0, 40.0, 50.0).current_level(), ThrottleLevel::Normal);
        assert_eq!(controller_at(90.0, 40.0, 50.0).current_level(), ThrottleLevel::Heavy);
        assert_eq!(controller_at(20.0, 20.0, 10.0).current_level(), ThrottleLevel::Pause);
    }

    #[test]
    fn test_escalation_is_immediate() {
        let c = controller_at(30.0, 40.0, 50.0);
        assert_eq!(c.observe(snap(20.0, 20.0, 5.0), 0), ThrottleLevel::Pause);
        assert_eq!(c.current_level(), ThrottleLevel::Pause);
        assert_eq!(c.escalations(), 1);
    }

    #[test]
    fn test_single_good_sample_does_not_recover() {
        let c = controller_at(30.0, 40.0, 50.0);
        c.observe(snap(20.0, 20.0, 5.0), 0);
        assert_eq!(c.observe(snap(20.0, 20.0, 60.0), 0), ThrottleLevel::Pause);
        assert_eq!(c.observe(snap(20.0, 20.0, 60.0), 0), ThrottleLevel::Normal);
    }

    #[test]
    fn test_interrupted_streak_starts_over() {
        let c = controller_at(90.0, 40.0, 50.0);
        c.observe(snap(30.0, 40.0, 50.0), 0);
        c.observe(snap(90.0, 40.0, 50.0), 0);
        assert_eq!(c.observe(snap(30.0, 40.0, 50.0), 0), ThrottleLevel::Heavy);
        assert_eq!(c.observe(snap(30.0, 40.0, 50.0), 0), ThrottleLevel::Normal);
    }

    #[test]
    fn test_recovery_settles_on_worst_of_streak() {
        let c = controller_at(20.0, 20.0, 5.0);
        c.observe(snap(75.0, 20.0, 60.0), 0);
        assert_eq!(c.observe(snap(10.0, 20.0, 60.0), 0), ThrottleLevel::Light);
    }

    #[test]
    fn test_sample_inside_margin_does_not_count() {
        let c = controller_at(90.0, 40.0, 50.0);
        // Below the 85% ceiling but inside the 2-point band.
        c.observe(snap(84.0, 40.0, 50.0), 0);
        assert_eq!(c.observe(snap(84.0, 40.0, 50.0), 0), ThrottleLevel::Heavy);
        c.observe(snap(82.0, 40.0, 50.0), 0);
        assert_eq!(c.observe(snap(82.0, 40.0, 50.0), 0), ThrottleLevel::Light);
    }

    #[test]
    fn test_persistent_sampling_failure_forces_pause() {
        let c = controller_at(30.0, 40.0, 50.0);
        let mut stale = snap(30.0, 40.0, 50.0);
        stale.stale = vec![Metric::Cpu];
        assert_eq!(c.observe(stale.clone(), 3), ThrottleLevel::Normal);
        assert_eq!(c.observe(stale, 4), ThrottleLevel::Pause);
        assert!(c.state().fail_safe);
    }

    #[test]
    fn test_decided_at_never_goes_backwards() {
        let c = controller_at(30.0, 40.0, 50.0);
        let mut last = c.state().decided_at;
        for _ in 0..5 {
            c.observe(snap(30.0, 40.0, 50.0), 0);
            let now = c.state().decided_at;
            assert!(now >= last);
            last = now;
        }
        assert_eq!(c.samples_observed(), 5);
    }

    #[tokio::test]
    async fn test_level_changes_are_broadcast() {
        let c = controller_at(30.0, 40.0, 50.0);
        let mut rx = c.subscribe();
        c.observe(snap(90.0, 40.0, 50.0), 0);
        c.observe(snap(90.0, 40.0, 50.0), 0);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, ThrottleLevel::Normal);
        assert_eq!(change.to, ThrottleLevel::Heavy);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sampling_loop_publishes_and_stops() {
        let sampler = Arc::new(ResourceSampler::new(
            ScriptedProbe::new(vec![(Some(95.0), Some(10.0), Some(50.0)); 64]),
            Duration::from_secs(1),
        ));
        let c = Arc::new(controller_at(10.0, 10.0, 50.0));
        let handle = c.start(sampler, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(c.current_level(), ThrottleLevel::Heavy);
        handle.stop().await;
        let observed = c.samples_observed();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.samples_observed(), observed);
    }
}
