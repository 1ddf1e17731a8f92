use std::{fmt, str::FromStr};

use candle_core::{DType, Tensor, D};

use crate::{distributed::Collective, error::to_runtime_error, TrainingError};

/// How a meter condenses itself into the end-of-pass summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    None,
    Average,
    Sum,
    Count,
}

impl FromStr for Summary {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Summary::None),
            "average" | "avg" | "mean" => Ok(Summary::Average),
            "sum" => Ok(Summary::Sum),
            "count" => Ok(Summary::Count),
            other => Err(TrainingError::validation(vec![format!(
                "unknown summary kind '{other}' (expected none, average, sum or count)"
            )])),
        }
    }
}

/// Number rendering used by a meter's progress entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    Fixed { width: usize, precision: usize },
    Scientific { precision: usize },
}

impl MeterFormat {
    fn render(&self, value: f64) -> String {
        match *self {
            MeterFormat::Fixed { width, precision } => {
                format!("{value:>width$.precision$}")
            }
            MeterFormat::Scientific { precision } => scientific(value, precision),
        }
    }
}

/// `1.5000e+00` style: signed exponent with at least two digits.
fn scientific(value: f64, precision: usize) -> String {
    let rendered = format!("{value:.precision$e}");
    let Some((mantissa, exponent)) = rendered.split_once('e') else {
        return rendered;
    };
    match exponent.parse::<i32>() {
        Ok(exponent) => {
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
        }
        Err(_) => rendered,
    }
}

/// Running value/sum/count of one scalar statistic.
#[derive(Debug, Clone)]
pub struct AverageMeter {
    name: String,
    format: MeterFormat,
    summary: Summary,
    val: f64,
    sum: f64,
    count: f64,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>, format: MeterFormat, summary: Summary) -> Self {
        Self {
            name: name.into(),
            format,
            summary,
            val: 0.0,
            sum: 0.0,
            count: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0.0;
    }

    /// Records `value` observed over `weight` samples.
    pub fn update(&mut self, value: f64, weight: usize) {
        let weight = weight as f64;
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
    }

    /// Adds another meter's totals, e.g. a second pass over disjoint samples.
    pub fn absorb(&mut self, other: &AverageMeter) {
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Sums `(sum, count)` over every rank. All ranks must call this in the same order.
    pub fn reduce_across_processes(
        &mut self,
        collective: &dyn Collective,
    ) -> Result<(), TrainingError> {
        let mut totals = [self.sum, self.count];
        collective.all_reduce_sum(&mut totals)?;
        self.sum = totals[0];
        self.count = totals[1];
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    pub fn summary_kind(&self) -> Summary {
        self.summary
    }

    pub fn summarize(&self) -> Option<String> {
        let value = match self.summary {
            Summary::None => return None,
            Summary::Average => self.avg(),
            Summary::Sum => self.sum,
            Summary::Count => self.count,
        };
        Some(format!("{} {:.3}", self.name, value))
    }
}

impl fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.name,
            self.format.render(self.val),
            self.format.render(self.avg())
        )
    }
}

/// Mean of the values recorded since the last `take`.
#[derive(Debug, Default, Clone)]
pub struct WindowAverage {
    total: f64,
    samples: usize,
}

impl WindowAverage {
    pub fn record(&mut self, value: f64) {
        self.total += value;
        self.samples += 1;
    }

    pub fn take(&mut self) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        let mean = self.total / self.samples as f64;
        self.total = 0.0;
        self.samples = 0;
        Some(mean)
    }
}

/// Percentage of rows whose target is among the `k` highest scores, for each `k`.
///
/// A target ranks at position `r` when `r` scores are strictly greater than its own.
pub fn accuracy(logits: &Tensor, targets: &Tensor, topk: &[usize]) -> Result<Vec<f64>, TrainingError> {
    let scores = logits
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec2::<f32>()
        .map_err(to_runtime_error)?;
    let labels = targets.to_vec1::<u32>().map_err(to_runtime_error)?;
    if scores.len() != labels.len() {
        return Err(TrainingError::runtime(format!(
            "accuracy expects one target per row (got {} rows and {} targets)",
            scores.len(),
            labels.len()
        )));
    }
    if labels.is_empty() {
        return Ok(vec![0.0; topk.len()]);
    }

    let mut correct = vec![0usize; topk.len()];
    for (row, label) in scores.iter().zip(&labels) {
        let target_score = row.get(*label as usize).copied().ok_or_else(|| {
            TrainingError::runtime(format!(
                "target {label} out of range for {} classes",
                row.len()
            ))
        })?;
        let rank = row.iter().filter(|score| **score > target_score).count();
        for (hits, k) in correct.iter_mut().zip(topk) {
            if rank < *k {
                *hits += 1;
            }
        }
    }

    let batch = labels.len() as f64;
    Ok(correct
        .into_iter()
        .map(|hits| hits as f64 * 100.0 / batch)
        .collect())
}

/// Index of the highest score in each row.
pub fn predictions(logits: &Tensor) -> Result<Vec<u32>, TrainingError> {
    logits
        .argmax(D::Minus1)
        .map_err(to_runtime_error)?
        .to_vec1::<u32>()
        .map_err(to_runtime_error)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::distributed::InProcessGroup;

    fn meter(summary: Summary) -> AverageMeter {
        AverageMeter::new("Acc@1", MeterFormat::Fixed { width: 6, precision: 2 }, summary)
    }

    #[test]
    fn weighted_updates_average_correctly() {
        let mut m = meter(Summary::Average);
        m.update(50.0, 4);
        m.update(100.0, 1);
        m.update(0.0, 5);
        assert_eq!(m.count(), 10.0);
        assert!((m.sum() - 300.0).abs() < 1e-9);
        assert!((m.avg() - 30.0).abs() < 1e-9);
        assert_eq!(m.val(), 0.0);
    }

    #[test]
    fn empty_meter_reports_zero_average() {
        let m = meter(Summary::Average);
        assert_eq!(m.avg(), 0.0);
        assert_eq!(m.summarize().as_deref(), Some("Acc@1 0.000"));
    }

    #[test]
    fn summary_kinds_select_the_reported_scalar() {
        let mut m = meter(Summary::Sum);
        m.update(2.0, 3);
        assert_eq!(m.summarize().as_deref(), Some("Acc@1 6.000"));

        let mut m = meter(Summary::Count);
        m.update(2.0, 3);
        assert_eq!(m.summarize().as_deref(), Some("Acc@1 3.000"));

        let mut m = meter(Summary::None);
        m.update(2.0, 3);
        assert_eq!(m.summarize(), None);
    }

    #[test]
    fn unknown_summary_kind_fails_to_parse() {
        assert_eq!("AVG".parse::<Summary>().unwrap(), Summary::Average);
        let err = "median".parse::<Summary>().unwrap_err();
        assert!(matches!(err, TrainingError::Validation(_)));
        assert!(err.to_string().contains("median"));
    }

    #[test]
    fn display_renders_current_and_average() {
        let mut m = meter(Summary::Average);
        m.update(12.5, 1);
        m.update(37.5, 1);
        assert_eq!(m.to_string(), "Acc@1  37.50 ( 25.00)");

        let mut loss = AverageMeter::new("Loss", MeterFormat::Scientific { precision: 4 }, Summary::None);
        loss.update(1.5, 2);
        assert_eq!(loss.to_string(), "Loss 1.5000e+00 (1.5000e+00)");
    }

    #[test]
    fn scientific_exponents_are_signed_and_padded() {
        assert_eq!(scientific(0.00123, 4), "1.2300e-03");
        assert_eq!(scientific(-2.5e12, 2), "-2.50e+12");
        assert_eq!(scientific(6.02e123, 1), "6.0e+123");
        assert_eq!(scientific(0.0, 4), "0.0000e+00");
        assert_eq!(scientific(f64::NAN, 4), "NaN");
    }

    #[test]
    fn absorb_adds_disjoint_totals() {
        let mut main = meter(Summary::Average);
        main.update(100.0, 10);
        let mut aux = meter(Summary::Average);
        aux.update(0.0, 2);
        main.absorb(&aux);
        assert_eq!(main.count(), 12.0);
        assert!((main.avg() - 1000.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn reduction_sums_every_rank_independent_of_arrival() {
        let reports = [(10.0, 2.0), (3.0, 1.0), (0.0, 0.0), (7.5, 5.0)];
        let group = InProcessGroup::new(reports.len(), None);

        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = reports
                .iter()
                .enumerate()
                .map(|(rank, (sum, count))| {
                    let member = group.member(rank);
                    scope.spawn(move || {
                        // later ranks arrive first
                        std::thread::sleep(std::time::Duration::from_millis(
                            (reports.len() - rank) as u64 * 5,
                        ));
                        let mut m = meter(Summary::Average);
                        m.sum = *sum;
                        m.count = *count;
                        m.reduce_across_processes(&member).unwrap();
                        (m.sum(), m.count())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        for (sum, count) in results {
            assert!((sum - 20.5).abs() < 1e-12);
            assert_eq!(count, 8.0);
        }
    }

    #[test]
    fn topk_accuracy_counts_strictly_higher_scores() {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(
            vec![
                0.1f32, 0.7, 0.2, //
                0.5, 0.3, 0.2, //
                0.2, 0.3, 0.5, //
                0.6, 0.1, 0.3,
            ],
            (4, 3),
            &device,
        )
        .unwrap();
        let targets = Tensor::from_vec(vec![1u32, 1, 0, 2], 4, &device).unwrap();

        let acc = accuracy(&logits, &targets, &[1, 2]).unwrap();
        assert!((acc[0] - 25.0).abs() < 1e-9);
        assert!((acc[1] - 75.0).abs() < 1e-9);

        assert_eq!(predictions(&logits).unwrap(), vec![1, 0, 2, 0]);
    }

    #[test]
    fn window_average_resets_after_take() {
        let mut window = WindowAverage::default();
        assert_eq!(window.take(), None);
        window.record(1.0);
        window.record(3.0);
        assert_eq!(window.take(), Some(2.0));
        assert_eq!(window.take(), None);
    }
}
