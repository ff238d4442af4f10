use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Offset,
    Timelike, Utc, Weekday,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Receiver side of the session-wide shutdown flag.
pub type Shutdown = watch::Receiver<bool>;

pub const PROCESS_CADENCE_SECS: u32 = 30;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub utc_offset: FixedOffset,
    pub holidays: HashSet<NaiveDate>,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset: FixedOffset::east_opt(330 * 60).unwrap_or_else(|| Utc.fix()),
            holidays: HashSet::new(),
        }
    }
}

impl MarketHours {
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.utc_offset).date_naive()
    }

    /// The instant at `time` (exchange local time) on the trading day containing `now`.
    pub fn at_time_of_day(&self, now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let local = self.local_date(now).and_time(time);
        (local - ChronoDuration::seconds(self.utc_offset.local_minus_utc() as i64)).and_utc()
    }

    pub fn open_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.at_time_of_day(now, self.open)
    }

    pub fn close_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.at_time_of_day(now, self.close)
    }

    pub fn is_holiday(&self, now: DateTime<Utc>) -> bool {
        let date = self.local_date(now);
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun) || self.holidays.contains(&date)
    }

    pub fn is_market_closed_for_the_day(&self, now: DateTime<Utc>) -> bool {
        self.is_holiday(now) || now >= self.close_at(now)
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        !self.is_holiday(now) && now >= self.open_at(now) && now < self.close_at(now)
    }
}

/// Time left until the next wall-clock boundary that is a multiple of `period_secs`.
pub fn next_cadence_wait(now: DateTime<Utc>, period_secs: u32) -> Duration {
    let period = period_secs.max(1);
    let into_period = now.second() % period;
    let wait_secs = period - into_period;
    let wait = Duration::from_secs(wait_secs as u64);
    wait.saturating_sub(Duration::from_nanos(now.nanosecond().min(999_999_999) as u64))
        .max(Duration::from_millis(1))
}

/// Sleeps for `duration` unless shutdown is requested first. Returns true on shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut Shutdown) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Waits until `deadline` according to `clock`. Returns true if shutdown interrupted the wait.
pub async fn wait_until(clock: &dyn Clock, deadline: DateTime<Utc>, shutdown: &mut Shutdown) -> bool {
    loop {
        let now = clock.now();
        if now >= deadline {
            return *shutdown.borrow();
        }
        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_secs(60));
        if sleep_or_shutdown(remaining, shutdown).await {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ist(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2024-06-03 is a Monday
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 3, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn market_open_and_close_follow_exchange_offset() {
        let hours = MarketHours::default();
        assert!(!hours.is_market_open(ist(9, 14, 59)));
        assert!(hours.is_market_open(ist(9, 15, 0)));
        assert!(hours.is_market_open(ist(15, 29, 59)));
        assert!(hours.is_market_closed_for_the_day(ist(15, 30, 0)));
        assert_eq!(hours.open_at(ist(12, 0, 0)), ist(9, 15, 0));
    }

    #[test]
    fn weekends_and_listed_holidays_are_closed() {
        let mut hours = MarketHours::default();
        let saturday = ist(11, 0, 0) + ChronoDuration::days(5);
        assert!(hours.is_market_closed_for_the_day(saturday));

        hours.holidays.insert(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert!(hours.is_market_closed_for_the_day(ist(11, 0, 0)));
    }

    #[test]
    fn cadence_wakes_on_thirty_second_boundaries() {
        assert_eq!(next_cadence_wait(ist(10, 0, 0), 30), Duration::from_secs(30));
        assert_eq!(next_cadence_wait(ist(10, 0, 12), 30), Duration::from_secs(18));
        assert_eq!(next_cadence_wait(ist(10, 0, 45), 30), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(handle.await.unwrap());
    }
}
