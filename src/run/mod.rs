//! Run and sub-run boundary bookkeeping.
//!
//! The tracker owns the run coordinates: which run the aggregate currently
//! describes, how many events it holds, and the sub-run suffix the next
//! persisted snapshot will carry (0 means no suffix). It decides *when* a
//! boundary happens; the service executes the flush/reset sequence using the
//! returned [`CompletedRun`] coordinates.

/// Coordinates of an aggregate that just completed: what a flush of it must
/// be named and whether it clears the persistence threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedRun {
    pub run: u32,
    pub sub_run: u32,
    pub events: u64,
}

/// Tracks the current run and detects boundaries.
pub struct RunTracker {
    current_run: Option<u32>,
    sub_run: u32,
    events: u64,
    min_events: u64,
}

impl RunTracker {
    pub fn new(min_events: u64) -> Self {
        Self {
            current_run: None,
            sub_run: 0,
            events: 0,
            min_events,
        }
    }

    pub fn current_run(&self) -> Option<u32> {
        self.current_run
    }

    pub fn sub_run(&self) -> u32 {
        self.sub_run
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn min_events(&self) -> u64 {
        self.min_events
    }

    /// Override the persistence threshold (one-shot processing uses 1).
    pub fn set_min_events(&mut self, min_events: u64) {
        self.min_events = min_events;
    }

    /// Count events committed into the current aggregate.
    pub fn record_events(&mut self, n: u64) {
        self.events += n;
    }

    /// Compare the incoming unit's run id against the tracked one. On a
    /// change, return the completed run and adopt the new id with a fresh
    /// sub-run counter. The first observed run adopts silently.
    pub fn observe(&mut self, run: u32) -> Option<CompletedRun> {
        match self.current_run {
            Some(current) if current != run => {
                let completed = CompletedRun {
                    run: current,
                    sub_run: self.sub_run,
                    events: self.events,
                };
                self.current_run = Some(run);
                self.sub_run = 0;
                self.events = 0;
                Some(completed)
            }
            Some(_) => None,
            None => {
                self.current_run = Some(run);
                self.sub_run = 0;
                self.events = 0;
                None
            }
        }
    }

    /// Operator-triggered rollover within the current run. The completed
    /// portion gets the next sub-run suffix (starting at 1) and the counter
    /// moves past it, so successive rollovers persist `_1`, `_2`, ... and a
    /// later run change flushes with the pending suffix before dropping back
    /// to 0. Returns None before any run has been observed.
    pub fn force_rollover(&mut self) -> Option<CompletedRun> {
        let run = self.current_run?;
        if self.sub_run == 0 {
            self.sub_run = 1;
        }
        let completed = CompletedRun {
            run,
            sub_run: self.sub_run,
            events: self.events,
        };
        self.sub_run += 1;
        self.events = 0;
        Some(completed)
    }

    /// Current coordinates without ending anything, for the final flush at
    /// shutdown.
    pub fn completed_now(&self) -> Option<CompletedRun> {
        self.current_run.map(|run| CompletedRun {
            run,
            sub_run: self.sub_run,
            events: self.events,
        })
    }

    /// Whether a completed aggregate clears the persistence threshold.
    pub fn should_persist(&self, completed: &CompletedRun) -> bool {
        completed.events >= self.min_events
    }
}
