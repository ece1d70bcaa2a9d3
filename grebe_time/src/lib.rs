//! Wall-clock abstractions for the grebe query engine.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt,
    ops::{Add, Sub},
    sync::Arc,
    time::Duration,
};

/// A nanosecond-precision UTC timestamp.
///
/// Wraps a [`chrono::DateTime`] so callers get calendar formatting for free,
/// but the engine deals in nanoseconds since the Unix epoch everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Create a `Time` from the provided nanoseconds since the Unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Create a `Time` from seconds + an additional nanosecond offset.
    pub fn from_timestamp(secs: i64, nanos: u32) -> Self {
        Self(Utc.timestamp(secs, nanos))
    }

    /// Create a `Time` from an RFC3339 formatted string, e.g.
    /// `2022-07-01T12:00:00Z`.
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self(
            DateTime::<chrono::FixedOffset>::parse_from_rfc3339(s)?.with_timezone(&Utc),
        ))
    }

    /// Create a `Time` from an existing [`DateTime`].
    pub fn from_date_time(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Whole seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.0.timestamp()
    }

    /// The wrapped [`DateTime`].
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// RFC3339 rendering with fixed nine-digit nanoseconds and a `Z` suffix.
    ///
    /// The fixed width makes lexicographic ordering of rendered timestamps
    /// identical to chronological ordering, which table sorting relies on.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Add `d` to this time, returning `None` on overflow.
    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        Some(Self(
            self.0.checked_add_signed(chrono::Duration::from_std(d).ok()?)?,
        ))
    }

    /// Subtract `d` from this time, returning `None` on overflow.
    pub fn checked_sub(&self, d: Duration) -> Option<Self> {
        Some(Self(
            self.0.checked_sub_signed(chrono::Duration::from_std(d).ok()?)?,
        ))
    }

    /// The duration elapsed since `earlier`, or `None` if `earlier` is later
    /// than `self`.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        (self.0 - earlier.0).to_std().ok()
    }

    /// Truncate this time down to a multiple of `width_nanos` from the epoch.
    ///
    /// Truncation floors, so pre-epoch timestamps land on the bin boundary at
    /// or before them.
    pub fn truncate_to(&self, width_nanos: i64) -> Self {
        assert!(width_nanos > 0, "bin width must be positive");
        let nanos = self.timestamp_nanos();
        Self::from_timestamp_nanos(nanos - nanos.rem_euclid(width_nanos))
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// A source of wall-clock time.
///
/// Injected wherever the engine needs "now" so tests can substitute a
/// [`MockProvider`].
pub trait TimeProvider: fmt::Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that uses the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new provider reading the system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] returning a programmable fixed time.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider that reports `now` until told otherwise.
    pub fn new(now: Time) -> Arc<Self> {
        Arc::new(Self {
            now: RwLock::new(now),
        })
    }

    /// Replace the reported time.
    pub fn set(&self, now: Time) {
        *self.now.write() = now;
    }

    /// Advance the reported time by `d` and return the new value.
    pub fn inc(&self, d: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + d;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider + ?Sized> TimeProvider for Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}
