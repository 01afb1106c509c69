//! CPU throttling of a running worker
//!
//! Samples host CPU usage every interval and, while usage sits above the
//! target, suspends the worker's process group for a share of the next
//! interval proportional to the excess.

use super::process::WorkerControl;
use crate::resources::ResourceInspector;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Largest share of an interval the worker may spend suspended
const MAX_PAUSE_FRACTION: f32 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSettings {
    /// Host CPU usage to aim for, 0-100
    pub target_cpu_percent: f32,
    /// Time between usage samples
    pub interval: Duration,
    /// Window over which each usage sample is measured
    pub sample_window: Duration,
}

impl ThrottleSettings {
    /// How long to suspend the worker given the measured usage
    pub fn pause_for(&self, usage_percent: f32) -> Option<Duration> {
        if !usage_percent.is_finite() || usage_percent <= self.target_cpu_percent {
            return None;
        }
        let excess = (usage_percent - self.target_cpu_percent) / usage_percent;
        Some(self.interval.mul_f32(excess.clamp(0.0, MAX_PAUSE_FRACTION)))
    }
}

/// Run the throttle loop for one worker until `cancel` fires or it is reaped
pub(super) fn spawn(
    settings: ThrottleSettings,
    run_id: Uuid,
    control: WorkerControl,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let inspector = ResourceInspector::new(settings.sample_window);
        debug!(%run_id, target_cpu_percent = settings.target_cpu_percent, "CPU throttle started");

        loop {
            let snapshot = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = control.closed() => break,
                snapshot = inspector.snapshot() => snapshot,
            };

            let pause = snapshot
                .cpu_usage_percent
                .and_then(|usage| settings.pause_for(usage));
            if let Some(pause) = pause {
                if !control.suspend() {
                    break;
                }
                debug!(
                    %run_id,
                    usage = ?snapshot.cpu_usage_percent,
                    pause_ms = pause.as_millis() as u64,
                    "Worker suspended"
                );
                let cancelled = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = sleep(pause) => false,
                };
                control.resume();
                if cancelled {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = control.closed() => break,
                _ = sleep(settings.interval.saturating_sub(pause.unwrap_or_default())) => {}
            }
        }

        // Never leave the worker stopped
        control.resume();
        debug!(%run_id, "CPU throttle stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(target: f32) -> ThrottleSettings {
        ThrottleSettings {
            target_cpu_percent: target,
            interval: Duration::from_secs(10),
            sample_window: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_no_pause_at_or_below_target() {
        let settings = settings(70.0);
        assert_eq!(settings.pause_for(50.0), None);
        assert_eq!(settings.pause_for(70.0), None);
        assert_eq!(settings.pause_for(f32::NAN), None);
    }

    #[test]
    fn test_pause_scales_with_excess() {
        let settings = settings(50.0);
        // Half the measured usage is over target
        assert_eq!(settings.pause_for(100.0), Some(Duration::from_secs(5)));

        let small = settings.pause_for(60.0).unwrap();
        let large = settings.pause_for(90.0).unwrap();
        assert!(small < large);
    }

    #[test]
    fn test_pause_is_capped() {
        let settings = settings(1.0);
        let pause = settings.pause_for(100.0).unwrap();
        assert!((pause.as_secs_f32() - 9.0).abs() < 0.01);
    }
}
