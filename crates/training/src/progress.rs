use crate::metrics::AverageMeter;

/// Formats per-batch progress lines and the end-of-pass summary.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    num_batches: usize,
    width: usize,
    prefix: String,
}

impl ProgressMeter {
    pub fn new(num_batches: usize, prefix: impl Into<String>) -> Self {
        Self {
            num_batches,
            width: num_batches.to_string().len(),
            prefix: prefix.into(),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// `"{prefix}[{batch}/{num_batches}]"` followed by each meter, tab separated.
    pub fn display(&self, batch: usize, meters: &[&AverageMeter]) -> String {
        let mut entries = Vec::with_capacity(meters.len() + 1);
        entries.push(format!(
            "{}[{:>width$}/{}]",
            self.prefix,
            batch,
            self.num_batches,
            width = self.width
        ));
        entries.extend(meters.iter().map(|meter| meter.to_string()));
        entries.join("\t")
    }

    /// `" *"` followed by every meter summary that reports something.
    pub fn display_summary(&self, meters: &[&AverageMeter]) -> String {
        let mut entries = vec![" *".to_string()];
        entries.extend(meters.iter().filter_map(|meter| meter.summarize()));
        entries.join(" ")
    }
}
