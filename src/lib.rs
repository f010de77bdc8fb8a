//! Batch post-processing for periodic host-sampler analysis logs.
//!
//! The lower-level query scripts scan raw host samples on a schedule and
//! append candidate violations to daily logs, repeating the same violations
//! across many scans. The modules here fold those redundant rows into one
//! record per logical job, reconcile them against a persistent per-job
//! state file so each violation is announced exactly once, and generate
//! per-host load series for the web dashboard.

pub mod cpuhog;
pub mod deadweight;
pub mod enumerate;
pub mod freecsv;
pub mod load;
pub mod report;
pub mod state;
pub mod window;
