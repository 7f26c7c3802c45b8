//! Local time and durations, with microsecond resolution.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time.
///
/// A signed number of microseconds. Only comparisons between values are
/// meaningful; the epoch is arbitrary. [`LocalTime::now`] is monotonic.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Hash, Default)]
pub struct LocalTime {
    micros: i64,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.micros)
    }
}

impl LocalTime {
    /// The earliest representable time.
    pub const MIN: LocalTime = LocalTime { micros: i64::MIN };

    /// The latest representable time.
    pub const MAX: LocalTime = LocalTime { micros: i64::MAX };

    /// Construct a local time from the current system time.
    pub fn now() -> Self {
        static LAST: AtomicI64 = AtomicI64::new(i64::MIN);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or_default();
        let last = LAST.load(Ordering::SeqCst);

        // If the current time is in the past, return the last recorded time instead.
        if now < last {
            Self::from_micros(last)
        } else {
            LAST.store(now, Ordering::SeqCst);
            Self::from_micros(now)
        }
    }

    /// Construct a local time from microseconds.
    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Construct a local time from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self { micros: secs * 1_000_000 }
    }

    /// The time as a number of microseconds.
    pub const fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Get the difference between two times.
    pub fn diff(&self, other: LocalTime) -> LocalDuration {
        if self > &other {
            *self - other
        } else {
            other - *self
        }
    }

    /// Elapse time.
    ///
    /// Adds the given duration to the time.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.micros = self.micros.saturating_add(duration.as_micros())
    }
}

/// Substract two local times. Yields a duration.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration::from_micros(self.micros.saturating_sub(other.micros))
    }
}

/// Substract a duration from a local time. Yields a local time.
impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime { micros: self.micros.saturating_sub(other.as_micros()) }
    }
}

/// Add a duration to a local time. Yields a local time.
impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime { micros: self.micros.saturating_add(other.as_micros()) }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Default)]
pub struct LocalDuration(i64);

impl LocalDuration {
    /// Maximum duration.
    pub const MAX: LocalDuration = LocalDuration(i64::MAX);

    /// Construct a new duration from microseconds.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Construct a new duration from milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    /// Create a new duration from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000)
    }

    /// Create a new duration from whole minutes.
    pub const fn from_mins(mins: i64) -> Self {
        Self::from_secs(mins * 60)
    }

    /// Return the number of microseconds in this duration.
    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    /// Return the number of milliseconds in this duration.
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    /// Return the number of seconds in this duration.
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Return the number of minutes in this duration.
    pub const fn as_mins(&self) -> i64 {
        self.as_secs() / 60
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            dur if dur.as_millis() == 0 => write!(f, "{} microsecond(s)", self.as_micros()),
            dur if dur.as_secs() == 0 => write!(f, "{} millisecond(s)", self.as_millis()),
            dur if dur.as_mins() == 0 => write!(f, "{} second(s)", self.as_secs()),
            _ => write!(f, "{} minute(s)", self.as_mins()),
        }
    }
}

impl std::ops::Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0.saturating_add(other.0))
    }
}

impl std::ops::Sub<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn sub(self, other: LocalDuration) -> LocalDuration {
        LocalDuration(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Mul<i64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: i64) -> LocalDuration {
        LocalDuration(self.0.saturating_mul(other))
    }
}

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability.
#[derive(Debug, Clone)]
pub struct RefClock<T: Clock> {
    inner: Arc<Mutex<T>>,
}

impl<T: Clock> std::ops::Deref for RefClock<T> {
    type Target = Arc<Mutex<T>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Clock> From<T> for RefClock<T> {
    fn from(other: T) -> Self {
        Self { inner: Arc::new(Mutex::new(other)) }
    }
}

impl<T: Clock> Clock for RefClock<T> {
    fn local_time(&self) -> LocalTime {
        self.inner.lock().unwrap().local_time()
    }
}
