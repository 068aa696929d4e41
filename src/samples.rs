//! Collections of draws.

use std::collections::HashMap;

use crate::model::{Sample, Tensor, VariableRef};

/// One draw: the recorded variables together with the log probability at
/// the draw's position.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSample {
    pub sample: Sample,
    pub log_prob: f64,
}

impl NetworkSample {
    pub fn get(&self, var: &VariableRef) -> Option<&Tensor> {
        self.sample.get(var)
    }
}

/// Destination for draws as they are produced.
pub trait SampleSink {
    fn append(&mut self, draw: &NetworkSample);
}

impl SampleSink for HashMap<VariableRef, Vec<Tensor>> {
    fn append(&mut self, draw: &NetworkSample) {
        for (var, value) in draw.sample.iter() {
            self.entry(*var).or_default().push(value.clone());
        }
    }
}

impl SampleSink for Vec<NetworkSample> {
    fn append(&mut self, draw: &NetworkSample) {
        self.push(draw.clone());
    }
}

/// The draws of one chain, stored per variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSamples {
    samples: HashMap<VariableRef, Vec<Tensor>>,
    log_probs: Vec<f64>,
}

impl NetworkSamples {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    /// All draws of `var`, in order.
    pub fn get(&self, var: &VariableRef) -> Option<&[Tensor]> {
        self.samples.get(var).map(|values| values.as_slice())
    }

    /// Draws of a variable with a single element, as plain numbers.
    pub fn scalars(&self, var: &VariableRef) -> Option<Vec<f64>> {
        self.get(var)?
            .iter()
            .map(|value| {
                if value.len() == 1 {
                    value.iter().next().copied()
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn log_probs(&self) -> &[f64] {
        &self.log_probs
    }

    pub fn variables(&self) -> impl Iterator<Item = &VariableRef> {
        self.samples.keys()
    }

    /// Drop the first `count` draws, usually the warmup.
    pub fn drop_count(&self, count: usize) -> NetworkSamples {
        let samples = self
            .samples
            .iter()
            .map(|(var, values)| (*var, values.iter().skip(count).cloned().collect()))
            .collect();
        NetworkSamples {
            samples,
            log_probs: self.log_probs.iter().skip(count).copied().collect(),
        }
    }

    /// Keep every `factor`-th draw, starting with the first.
    pub fn down_sample(&self, factor: usize) -> NetworkSamples {
        let factor = factor.max(1);
        let samples = self
            .samples
            .iter()
            .map(|(var, values)| (*var, values.iter().step_by(factor).cloned().collect()))
            .collect();
        NetworkSamples {
            samples,
            log_probs: self.log_probs.iter().step_by(factor).copied().collect(),
        }
    }

    /// Elementwise mean over all draws of `var`.
    pub fn mean(&self, var: &VariableRef) -> Option<Tensor> {
        let values = self.get(var)?;
        let first = values.first()?;
        let mut sum = Tensor::zeros(first.raw_dim());
        for value in values {
            sum += value;
        }
        Some(sum / values.len() as f64)
    }

    /// Elementwise unbiased sample variance over all draws of `var`.
    pub fn variance(&self, var: &VariableRef) -> Option<Tensor> {
        let values = self.get(var)?;
        if values.len() < 2 {
            return None;
        }
        let mean = self.mean(var)?;
        let mut sum_sq = Tensor::zeros(mean.raw_dim());
        for value in values {
            let diff = value - &mean;
            sum_sq += &(&diff * &diff);
        }
        Some(sum_sq / (values.len() - 1) as f64)
    }
}

impl SampleSink for NetworkSamples {
    fn append(&mut self, draw: &NetworkSample) {
        let count = self.len();
        for (var, value) in draw.sample.iter() {
            let values = self.samples.entry(*var).or_default();
            // Variables that appear late are not aligned with the draw index.
            debug_assert_eq!(values.len(), count);
            values.push(value.clone());
        }
        self.log_probs.push(draw.log_prob);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, arr1};
    use pretty_assertions::assert_eq;

    const A: VariableRef = VariableRef::new(1);
    const B: VariableRef = VariableRef::new(2);

    fn samples() -> NetworkSamples {
        let mut samples = NetworkSamples::new();
        for i in 0..6 {
            let x = i as f64;
            let mut sample = Sample::new();
            sample.insert(A, arr0(x).into_dyn());
            sample.insert(B, arr1(&[x, 2. * x]).into_dyn());
            samples.append(&NetworkSample {
                sample,
                log_prob: -x,
            });
        }
        samples
    }

    #[test]
    fn summaries() {
        let samples = samples();
        assert_eq!(samples.len(), 6);
        assert_eq!(samples.scalars(&A).unwrap(), vec![0., 1., 2., 3., 4., 5.]);
        assert!(samples.scalars(&B).is_none());
        assert_eq!(samples.mean(&B).unwrap(), arr1(&[2.5, 5.]).into_dyn());
        let var = samples.variance(&A).unwrap();
        assert_abs_diff_eq!(var.iter().next().copied().unwrap(), 3.5);
        assert!(samples.get(&VariableRef::new(9)).is_none());
        let mut variables: Vec<_> = samples.variables().copied().collect();
        variables.sort();
        assert_eq!(variables, vec![A, B]);
    }

    #[test]
    fn thinning() {
        let samples = samples();
        let dropped = samples.drop_count(2);
        assert_eq!(dropped.scalars(&A).unwrap(), vec![2., 3., 4., 5.]);
        assert_eq!(dropped.log_probs(), &[-2., -3., -4., -5.]);

        let thinned = samples.down_sample(4);
        assert_eq!(thinned.scalars(&A).unwrap(), vec![0., 4.]);
        assert_eq!(thinned.len(), 2);
        assert_eq!(samples.down_sample(0), samples);
    }

    #[test]
    fn map_sink() {
        let mut sink: HashMap<VariableRef, Vec<Tensor>> = HashMap::new();
        let mut sample = Sample::new();
        sample.insert(A, arr0(1.).into_dyn());
        sink.append(&NetworkSample {
            sample,
            log_prob: 0.,
        });
        assert_eq!(sink[&A].len(), 1);
    }
}
