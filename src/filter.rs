use std::collections::HashMap;

use log::debug;

pub const DEFAULT_DEVIATION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SUSPECT_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSettings {
    /// Largest relative change accepted without suspicion
    pub deviation_threshold: f64,
    /// Consecutive outliers after which the change is taken as real
    pub suspect_limit: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        FilterSettings {
            deviation_threshold: DEFAULT_DEVIATION_THRESHOLD,
            suspect_limit: DEFAULT_SUSPECT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityState {
    pub stable_distance: f64,
    pub suspect_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First reading for the device
    First,
    /// Within the deviation threshold of the stable distance
    Accepted,
    /// Outlier, but seen often enough in a row to be believed
    Confirmed,
    /// Outlier; stable distance kept
    Rejected { suspect_count: u32 },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Decision::Rejected { .. })
    }
}

/// Hysteresis over raw distance estimates, one state per device id.
#[derive(Debug, Default)]
pub struct ProximityFilter {
    settings: FilterSettings,
    states: HashMap<String, ProximityState>,
}

impl ProximityFilter {
    pub fn new(settings: FilterSettings) -> Self {
        ProximityFilter {
            settings,
            states: HashMap::new(),
        }
    }

    pub fn observe(&mut self, device_id: &str, distance: f64) -> Decision {
        let Some(state) = self.states.get_mut(device_id) else {
            self.states.insert(
                device_id.to_string(),
                ProximityState {
                    stable_distance: distance,
                    suspect_count: 0,
                },
            );
            return Decision::First;
        };

        // A zero stable distance has no meaningful relative deviation.
        let within = state.stable_distance == 0.0
            || (distance - state.stable_distance).abs() / state.stable_distance
                <= self.settings.deviation_threshold;

        if within {
            state.stable_distance = distance;
            state.suspect_count = 0;
            return Decision::Accepted;
        }

        state.suspect_count += 1;
        if state.suspect_count >= self.settings.suspect_limit {
            state.stable_distance = distance;
            state.suspect_count = 0;
            Decision::Confirmed
        } else {
            debug!(
                "Ignoring suspect distance for {}: {:.2} (stable {:.2}, count={})",
                device_id, distance, state.stable_distance, state.suspect_count
            );
            Decision::Rejected {
                suspect_count: state.suspect_count,
            }
        }
    }

    #[cfg(test)]
    pub fn state(&self, device_id: &str) -> Option<&ProximityState> {
        self.states.get(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(readings: &[f64]) -> (ProximityFilter, Vec<Decision>) {
        let mut filter = ProximityFilter::default();
        let decisions = readings.iter().map(|d| filter.observe("C-A", *d)).collect();
        (filter, decisions)
    }

    fn stable(filter: &ProximityFilter) -> f64 {
        filter.state("C-A").unwrap().stable_distance
    }

    #[test]
    fn test_first_reading_always_accepted() {
        for reading in [0.0, 0.001, 5.0, 1e12] {
            let (filter, decisions) = run(&[reading]);
            assert_eq!(decisions, vec![Decision::First]);
            assert_eq!(stable(&filter), reading);
        }
    }

    #[test]
    fn test_small_deviations_follow_readings() {
        let (filter, decisions) = run(&[5.0, 7.4, 5.0]);
        assert!(decisions.iter().all(Decision::is_accepted));
        assert_eq!(stable(&filter), 5.0);
    }

    #[test]
    fn test_settles_on_last_accepted_reading() {
        let (filter, decisions) = run(&[5.0, 7.6, 5.0]);
        assert_eq!(decisions.last(), Some(&Decision::Accepted));
        assert_eq!(stable(&filter), 5.0);
    }

    #[test]
    fn test_single_spike_rejected() {
        let (filter, decisions) = run(&[5.0, 15.0, 5.5]);
        assert_eq!(decisions[1], Decision::Rejected { suspect_count: 1 });
        assert_eq!(decisions[2], Decision::Accepted);
        assert_eq!(stable(&filter), 5.5);
        assert_eq!(filter.state("C-A").unwrap().suspect_count, 0);
    }

    #[test]
    fn test_sustained_deviation_confirmed() {
        let (filter, decisions) = run(&[5.0, 15.0, 16.0]);
        assert_eq!(
            decisions,
            vec![
                Decision::First,
                Decision::Rejected { suspect_count: 1 },
                Decision::Confirmed
            ]
        );
        assert_eq!(stable(&filter), 16.0);
    }

    #[test]
    fn test_zero_stable_distance_accepts_anything() {
        let (filter, decisions) = run(&[0.0, 40.0]);
        assert_eq!(decisions[1], Decision::Accepted);
        assert_eq!(stable(&filter), 40.0);
    }

    #[test]
    fn test_devices_tracked_independently() {
        let mut filter = ProximityFilter::default();
        filter.observe("C-A", 1.0);
        filter.observe("C-B", 10.0);
        assert_eq!(
            filter.observe("C-A", 9.0),
            Decision::Rejected { suspect_count: 1 }
        );
        assert_eq!(filter.observe("C-B", 9.0), Decision::Accepted);
        assert_eq!(filter.state("C-A").unwrap().stable_distance, 1.0);
    }
}
