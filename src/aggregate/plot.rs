//! Plot leaves: counters and fixed-bin histograms.
//!
//! Leaves fill in two phases. Samples land in a scratch layer first; `commit`
//! folds the scratch into the published totals and `discard` drops it, so one
//! event's samples are applied as a whole or not at all.

use thiserror::Error;

use super::snapshot::PlotSnapshot;

/// Errors recording one sample.
#[derive(Error, Debug, PartialEq)]
pub enum PlotError {
    #[error("plot {plot}: non-finite sample {value}")]
    NonFinite { plot: &'static str, value: f64 },
}

/// Monotonic counter with a running sum of sample values.
#[derive(Debug)]
pub struct CounterPlot {
    name: &'static str,
    count: u64,
    sum: f64,
    scratch_count: u64,
    scratch_sum: f64,
}

impl CounterPlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: 0,
            sum: 0.0,
            scratch_count: 0,
            scratch_sum: 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record one sample into the scratch layer.
    pub fn add(&mut self, value: f64) -> Result<(), PlotError> {
        if !value.is_finite() {
            return Err(PlotError::NonFinite {
                plot: self.name,
                value,
            });
        }
        self.scratch_count += 1;
        self.scratch_sum += value;
        Ok(())
    }

    pub fn commit(&mut self) {
        self.count += self.scratch_count;
        self.sum += self.scratch_sum;
        self.scratch_count = 0;
        self.scratch_sum = 0.0;
    }

    pub fn discard(&mut self) {
        self.scratch_count = 0;
        self.scratch_sum = 0.0;
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
        self.discard();
    }

    pub fn snapshot(&self) -> PlotSnapshot {
        PlotSnapshot::Counter {
            name: self.name.to_string(),
            count: self.count,
            sum: self.sum,
        }
    }
}

/// Uniform-bin histogram over `[low, high)` with under/overflow tallies.
#[derive(Debug)]
pub struct HistogramPlot {
    name: &'static str,
    low: f64,
    high: f64,
    bins: Vec<u64>,
    underflow: u64,
    overflow: u64,
    entries: u64,
    sum: f64,
    scratch_bins: Vec<u64>,
    scratch_underflow: u64,
    scratch_overflow: u64,
    scratch_entries: u64,
    scratch_sum: f64,
}

impl HistogramPlot {
    pub fn new(name: &'static str, low: f64, high: f64, num_bins: usize) -> Self {
        debug_assert!(high > low && num_bins > 0);
        Self {
            name,
            low,
            high,
            bins: vec![0; num_bins],
            underflow: 0,
            overflow: 0,
            entries: 0,
            sum: 0.0,
            scratch_bins: vec![0; num_bins],
            scratch_underflow: 0,
            scratch_overflow: 0,
            scratch_entries: 0,
            scratch_sum: 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record one sample into the scratch layer.
    pub fn fill(&mut self, value: f64) -> Result<(), PlotError> {
        if !value.is_finite() {
            return Err(PlotError::NonFinite {
                plot: self.name,
                value,
            });
        }

        if value < self.low {
            self.scratch_underflow += 1;
        } else if value >= self.high {
            self.scratch_overflow += 1;
        } else {
            let width = (self.high - self.low) / self.bins.len() as f64;
            // Float rounding at the upper edge can land one past the end.
            let idx = (((value - self.low) / width) as usize).min(self.bins.len() - 1);
            self.scratch_bins[idx] += 1;
        }
        self.scratch_entries += 1;
        self.scratch_sum += value;
        Ok(())
    }

    pub fn commit(&mut self) {
        for (bin, scratch) in self.bins.iter_mut().zip(&self.scratch_bins) {
            *bin += scratch;
        }
        self.underflow += self.scratch_underflow;
        self.overflow += self.scratch_overflow;
        self.entries += self.scratch_entries;
        self.sum += self.scratch_sum;
        self.clear_scratch();
    }

    pub fn discard(&mut self) {
        self.clear_scratch();
    }

    pub fn reset(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.underflow = 0;
        self.overflow = 0;
        self.entries = 0;
        self.sum = 0.0;
        self.clear_scratch();
    }

    fn clear_scratch(&mut self) {
        self.scratch_bins.iter_mut().for_each(|b| *b = 0);
        self.scratch_underflow = 0;
        self.scratch_overflow = 0;
        self.scratch_entries = 0;
        self.scratch_sum = 0.0;
    }

    pub fn snapshot(&self) -> PlotSnapshot {
        PlotSnapshot::Histogram {
            name: self.name.to_string(),
            low: self.low,
            high: self.high,
            bins: self.bins.clone(),
            underflow: self.underflow,
            overflow: self.overflow,
            entries: self.entries,
            sum: self.sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist_bins(plot: &HistogramPlot) -> (Vec<u64>, u64, u64, u64) {
        match plot.snapshot() {
            PlotSnapshot::Histogram {
                bins,
                underflow,
                overflow,
                entries,
                ..
            } => (bins, underflow, overflow, entries),
            other => panic!("expected histogram snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_counter_commit_and_discard() {
        let mut counter = CounterPlot::new("hits_total");
        counter.add(3.0).expect("add");
        counter.add(2.0).expect("add");

        // Nothing published before commit.
        assert!(matches!(
            counter.snapshot(),
            PlotSnapshot::Counter { count: 0, .. }
        ));

        counter.commit();
        match counter.snapshot() {
            PlotSnapshot::Counter { count, sum, .. } => {
                assert_eq!(count, 2);
                assert!((sum - 5.0).abs() < 1e-12);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }

        counter.add(7.0).expect("add");
        counter.discard();
        counter.commit();
        assert!(matches!(
            counter.snapshot(),
            PlotSnapshot::Counter { count: 2, .. }
        ));
    }

    #[test]
    fn test_counter_rejects_non_finite() {
        let mut counter = CounterPlot::new("hits_total");
        assert!(matches!(
            counter.add(f64::NAN),
            Err(PlotError::NonFinite { plot: "hits_total", .. })
        ));
    }

    #[test]
    fn test_histogram_bin_edges() {
        let mut hist = HistogramPlot::new("charge", 0.0, 10.0, 10);
        hist.fill(0.0).expect("fill");
        hist.fill(9.999).expect("fill");
        hist.fill(10.0).expect("fill");
        hist.fill(-0.001).expect("fill");
        hist.commit();

        let (bins, underflow, overflow, entries) = hist_bins(&hist);
        assert_eq!(bins[0], 1);
        assert_eq!(bins[9], 1);
        assert_eq!(underflow, 1);
        assert_eq!(overflow, 1);
        assert_eq!(entries, 4);
    }

    #[test]
    fn test_histogram_discard_leaves_totals() {
        let mut hist = HistogramPlot::new("charge", 0.0, 10.0, 10);
        hist.fill(5.0).expect("fill");
        hist.commit();

        hist.fill(5.0).expect("fill");
        hist.fill(6.0).expect("fill");
        hist.discard();

        let (bins, _, _, entries) = hist_bins(&hist);
        assert_eq!(bins[5], 1);
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_histogram_reset() {
        let mut hist = HistogramPlot::new("charge", 0.0, 10.0, 10);
        hist.fill(5.0).expect("fill");
        hist.commit();
        hist.reset();

        let (bins, underflow, overflow, entries) = hist_bins(&hist);
        assert!(bins.iter().all(|&b| b == 0));
        assert_eq!((underflow, overflow, entries), (0, 0, 0));
    }

    #[test]
    fn test_histogram_rejects_non_finite() {
        let mut hist = HistogramPlot::new("charge", 0.0, 10.0, 10);
        assert!(hist.fill(f64::INFINITY).is_err());
        assert!(hist.fill(f64::NAN).is_err());
    }
}
