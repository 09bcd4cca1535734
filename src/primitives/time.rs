use {
  chrono::{DateTime, TimeZone, Utc},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    ops::{Add, Sub},
    time::Duration,
  },
};

/// Length of a production slot. Two blocks per second.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// Slot counting starts at 2000-01-01T00:00:00Z.
pub const BLOCK_TIMESTAMP_EPOCH_MS: i64 = 946_684_800_000;

/// A point in time with nanosecond resolution.
///
/// All wire-level timestamps (handshakes, time sync, vote records) are
/// expressed in nanoseconds since the unix epoch. Other epochs are not
/// accepted anywhere.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct TimePoint(pub i64);

impl TimePoint {
  pub fn now() -> Self {
    Self(Utc::now().timestamp_nanos())
  }

  pub fn from_millis(ms: i64) -> Self {
    Self(ms * 1_000_000)
  }

  pub fn as_nanos(&self) -> i64 {
    self.0
  }

  pub fn as_millis(&self) -> i64 {
    self.0 / 1_000_000
  }

  pub fn elapsed_since(&self, earlier: TimePoint) -> Duration {
    Duration::from_nanos((self.0 - earlier.0).max(0) as u64)
  }
}

impl Add<Duration> for TimePoint {
  type Output = TimePoint;

  fn add(self, rhs: Duration) -> TimePoint {
    TimePoint(self.0 + rhs.as_nanos() as i64)
  }
}

impl Sub<TimePoint> for TimePoint {
  type Output = i64;

  fn sub(self, rhs: TimePoint) -> i64 {
    self.0 - rhs.0
  }
}

impl Display for TimePoint {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let dt: DateTime<Utc> = Utc.timestamp_nanos(self.0);
    write!(f, "{}", dt.to_rfc3339())
  }
}

impl Debug for TimePoint {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "TimePoint({self})")
  }
}

/// A block production slot. Slot 0 starts at the block timestamp epoch
/// and each slot is [`BLOCK_INTERVAL_MS`] long.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Default,
  Serialize,
  Deserialize,
)]
pub struct BlockTimestamp(pub u32);

impl BlockTimestamp {
  pub fn from_time_point(t: TimePoint) -> Self {
    let ms = t.as_millis() - BLOCK_TIMESTAMP_EPOCH_MS;
    Self((ms.max(0) as u64 / BLOCK_INTERVAL_MS) as u32)
  }

  pub fn to_time_point(self) -> TimePoint {
    TimePoint::from_millis(
      self.0 as i64 * BLOCK_INTERVAL_MS as i64 + BLOCK_TIMESTAMP_EPOCH_MS,
    )
  }

  pub fn next(self) -> Self {
    Self(self.0 + 1)
  }

  pub fn slot(&self) -> u32 {
    self.0
  }
}

impl Display for BlockTimestamp {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_time_point())
  }
}

impl Debug for BlockTimestamp {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlockTimestamp({})", self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn slot_time_point_roundtrip() {
    let slot = BlockTimestamp(1_000_000);
    assert_eq!(BlockTimestamp::from_time_point(slot.to_time_point()), slot);
  }

  #[test]
  fn slots_are_half_seconds() {
    let a = BlockTimestamp(10).to_time_point();
    let b = BlockTimestamp(12).to_time_point();
    assert_eq!(b.as_millis() - a.as_millis(), 1000);
  }

  #[test]
  fn times_before_epoch_clamp_to_slot_zero() {
    let t = TimePoint::from_millis(BLOCK_TIMESTAMP_EPOCH_MS - 5000);
    assert_eq!(BlockTimestamp::from_time_point(t), BlockTimestamp(0));
  }
}
