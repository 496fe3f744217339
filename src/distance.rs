/// Received signal strength at one metre for the default advertiser.
pub const DEFAULT_REFERENCE_RSSI: i32 = -59;

/// Free-space path loss.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Log-distance path loss model used to turn RSSI into an estimated distance.
///
/// Both parameters depend on the radio hardware, so they come from config
/// rather than being baked in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    pub reference_rssi: i32,
    pub exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        PathLossModel {
            reference_rssi: DEFAULT_REFERENCE_RSSI,
            exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl PathLossModel {
    pub fn new(reference_rssi: i32, exponent: f64) -> Self {
        PathLossModel {
            reference_rssi,
            exponent,
        }
    }

    /// `10^((reference - rssi) / (10 * exponent))`, clamped to a finite value.
    pub fn estimate(&self, rssi: i32) -> f64 {
        let loss = i64::from(self.reference_rssi) - i64::from(rssi);
        let distance = 10f64.powf(loss as f64 / (10.0 * self.exponent));
        if distance.is_finite() {
            distance
        } else {
            f64::MAX
        }
    }
}
