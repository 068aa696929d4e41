use std::collections::HashMap;

use crate::integrator::DivergenceInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum SampleStatValue {
    Array(Box<[f64]>),
    U64(u64),
    F64(f64),
    Bool(bool),
}

impl From<Box<[f64]>> for SampleStatValue {
    fn from(val: Box<[f64]>) -> Self {
        SampleStatValue::Array(val)
    }
}

impl From<u64> for SampleStatValue {
    fn from(val: u64) -> Self {
        SampleStatValue::U64(val)
    }
}

impl From<f64> for SampleStatValue {
    fn from(val: f64) -> Self {
        SampleStatValue::F64(val)
    }
}

impl From<bool> for SampleStatValue {
    fn from(val: bool) -> Self {
        SampleStatValue::Bool(val)
    }
}

pub trait AsSampleStatMap {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue>;
}

/// Diagnostics of a single draw
#[derive(Debug, Clone)]
pub struct SampleStats {
    /// 1-based index of the draw, warmup included.
    pub draw: u64,
    /// Number of doublings of the trajectory.
    pub tree_height: u64,
    /// Whether the trajectory was terminated because it reached
    /// the maximum tree height.
    pub maxdepth_reached: bool,
    pub diverging: bool,
    /// Details about the first divergence of the trajectory. Only kept if
    /// `store_divergences` is set.
    pub divergence_info: Option<DivergenceInfo>,
    pub log_prob: f64,
    /// The step size used for this trajectory.
    pub step_size: f64,
    pub step_size_bar: f64,
    pub mean_accept_prob: f64,
    pub n_leapfrog: u64,
    /// Number of points in the trajectory inside the slice.
    pub accepted_count: u64,
    pub tuning: bool,
}

impl AsSampleStatMap for SampleStats {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue> {
        let mut map: HashMap<_, SampleStatValue> = HashMap::with_capacity(16);
        map.insert("draw", self.draw.into());
        map.insert("tree_height", self.tree_height.into());
        map.insert("maxdepth_reached", self.maxdepth_reached.into());
        map.insert("diverging", self.diverging.into());
        map.insert("log_prob", self.log_prob.into());
        map.insert("step_size", self.step_size.into());
        map.insert("step_size_bar", self.step_size_bar.into());
        map.insert("mean_tree_accept", self.mean_accept_prob.into());
        map.insert("n_steps", self.n_leapfrog.into());
        map.insert("accepted_count", self.accepted_count.into());
        map.insert("tuning", self.tuning.into());

        if let Some(info) = self.divergence_info.as_ref() {
            if let Some(energy_error) = info.energy_error {
                map.insert("energy_error", energy_error.into());
            }
            if let Some(start) = info.start_location.as_ref() {
                let values: Box<[f64]> = start.values().flat_map(|t| t.iter().copied()).collect();
                map.insert("divergence_start", values.into());
            }
            if let Some(end) = info.end_location.as_ref() {
                let values: Box<[f64]> = end.values().flat_map(|t| t.iter().copied()).collect();
                map.insert("divergence_end", values.into());
            }
        }
        map
    }
}
