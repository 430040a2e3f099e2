//! Retention policy for stored snapshots.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::period::first_of_month;

/// How many months of snapshots to keep. `0` disables pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicy {
  pub months: u32,
}

impl RetentionPolicy {
  pub fn months(months: u32) -> Self { Self { months } }

  pub fn is_enabled(&self) -> bool { self.months > 0 }

  /// Snapshots dated strictly before the returned date are expired: the first
  /// of the current month, `months` months back.
  pub fn cutoff(&self, today: NaiveDate) -> Option<NaiveDate> {
    if !self.is_enabled() {
      return None;
    }
    first_of_month(today).checked_sub_months(Months::new(self.months))
  }
}
