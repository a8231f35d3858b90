// =============================================================================
// scheduler.rs — ONE DAILY TRIGGER PER ENGINE
// =============================================================================
//
// A scheduler turns "15:00" into a background loop that wakes up every poll
// interval, looks at the wall clock and fires its trigger once the due time
// has passed. The trigger is normally `ScrapeEngine::start_scraping`, so a
// firing that lands while a run is still going is dropped by the engine's
// single-flight guard rather than queued.
//
//   INACTIVE --start(valid)--> ACTIVE --stop--> INACTIVE
//
// Times are local wall-clock times. The next run is always the first
// occurrence strictly after "now", both at start and after each firing, so
// a trigger fires at most once per day.
// =============================================================================

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default wall-clock poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What the scheduler fires.
pub type Trigger = Arc<dyn Fn() + Send + Sync>;

/// Wall-clock source. Swapped for a manual clock in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// Local time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<NaiveDateTime>);

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.0.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock()
    }
}

/// A validated `H:MM` / `HH:MM` time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTime {
    hour: u32,
    minute: u32,
}

impl DailyTime {
    /// Accepts `H:MM` or `HH:MM` with hour 0-23 and minute 0-59. Nothing
    /// else: no seconds, no surrounding whitespace, no single-digit minutes.
    pub fn parse(text: &str) -> Option<Self> {
        let (hour, minute) = text.split_once(':')?;

        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(hour) || hour.len() > 2 || !all_digits(minute) || minute.len() != 2 {
            return None;
        }

        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self { hour, minute })
    }

    fn time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }

    /// First occurrence of this time strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.time());
        if today > now {
            today
        } else {
            today.checked_add_days(Days::new(1)).unwrap_or(today)
        }
    }
}

impl fmt::Display for DailyTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Default)]
struct ScheduleState {
    time: Option<DailyTime>,
    next_run: Arc<Mutex<Option<NaiveDateTime>>>,
    task: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    name: String,
    trigger: Trigger,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    state: Mutex<ScheduleState>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Mutex::new(ScheduleState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule the trigger daily at `time`. Returns false, leaving any
    /// existing schedule untouched, when the time is malformed or there is
    /// no tokio runtime. A valid call replaces the previous schedule.
    pub fn start(&self, time: &str) -> bool {
        let Some(daily) = DailyTime::parse(time) else {
            warn!(scheduler = %self.name, time = time, "Invalid schedule time, expected HH:MM");
            return false;
        };

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(scheduler = %self.name, error = %e, "Cannot schedule outside a tokio runtime");
                return false;
            }
        };

        let mut state = self.state.lock();
        if let Some(old) = state.task.take() {
            old.abort();
            debug!(scheduler = %self.name, "Previous schedule cleared");
        }

        let first = daily.next_after(self.clock.now());
        let next_run = Arc::new(Mutex::new(Some(first)));

        let poller = Poller {
            name: self.name.clone(),
            time: daily,
            trigger: self.trigger.clone(),
            clock: self.clock.clone(),
            next_run: next_run.clone(),
            poll_interval: self.poll_interval,
        };

        state.time = Some(daily);
        state.next_run = next_run;
        state.task = Some(handle.spawn(poller.run()));

        info!(scheduler = %self.name, time = %daily, next_run = %first, "Scheduler active");
        true
    }

    /// Drop the schedule. Calling it again is harmless.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
            info!(scheduler = %self.name, "Scheduler stopped");
        }
        state.time = None;
        *state.next_run.lock() = None;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().task.is_some()
    }

    /// The active schedule as `HH:MM`.
    pub fn scheduled_time(&self) -> Option<String> {
        self.state.lock().time.map(|t| t.to_string())
    }

    pub fn next_run(&self) -> Option<NaiveDateTime> {
        *self.state.lock().next_run.lock()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

struct Poller {
    name: String,
    time: DailyTime,
    trigger: Trigger,
    clock: Arc<dyn Clock>,
    next_run: Arc<Mutex<Option<NaiveDateTime>>>,
    poll_interval: Duration,
}

impl Poller {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let now = self.clock.now();
            let due = {
                let mut next_run = self.next_run.lock();
                match *next_run {
                    Some(at) if now >= at => {
                        *next_run = Some(self.time.next_after(now));
                        true
                    }
                    Some(_) => false,
                    None => return,
                }
            };

            if due {
                info!(scheduler = %self.name, time = %self.time, "Schedule due, firing trigger");
                let trigger = &self.trigger;
                if std::panic::catch_unwind(AssertUnwindSafe(|| trigger())).is_err() {
                    error!(scheduler = %self.name, "Scheduled trigger panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .unwrap()
    }

    fn counting_trigger() -> (Trigger, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        (Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }), fired)
    }

    fn scheduler(clock: Arc<ManualClock>) -> (Scheduler, Arc<AtomicUsize>) {
        let (trigger, fired) = counting_trigger();
        let scheduler = Scheduler::new("test", trigger)
            .with_clock(clock)
            .with_poll_interval(Duration::from_millis(5));
        (scheduler, fired)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn test_daily_time_parsing() {
        assert_eq!(DailyTime::parse("15:00").map(|t| t.to_string()), Some("15:00".into()));
        assert_eq!(DailyTime::parse("9:05").map(|t| t.to_string()), Some("09:05".into()));
        assert!(DailyTime::parse("0:00").is_some());
        assert!(DailyTime::parse("23:59").is_some());

        for bad in ["25:00", "12:60", "abc", "", "12", "12:5", "123:00", " 12:00", "12:00:00", "-1:00", "+1:00"] {
            assert!(DailyTime::parse(bad).is_none(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let three = DailyTime::parse("15:00").unwrap();
        assert_eq!(three.next_after(at(2, 14, 59, 59)), at(2, 15, 0, 0));
        assert_eq!(three.next_after(at(2, 15, 0, 0)), at(3, 15, 0, 0));
        assert_eq!(three.next_after(at(2, 23, 0, 0)), at(3, 15, 0, 0));
    }

    #[tokio::test]
    async fn test_invalid_times_leave_scheduler_inactive() {
        let (scheduler, _) = scheduler(Arc::new(ManualClock::new(at(2, 9, 0, 0))));
        for bad in ["25:00", "12:60", "abc"] {
            assert!(!scheduler.start(bad));
            assert!(!scheduler.is_active());
        }
        assert!(scheduler.start("15:00"));
        assert!(scheduler.is_active());
        assert_eq!(scheduler.scheduled_time().as_deref(), Some("15:00"));
        assert_eq!(scheduler.next_run(), Some(at(2, 15, 0, 0)));

        // A bad restart does not disturb the running schedule.
        assert!(!scheduler.start("99:99"));
        assert_eq!(scheduler.scheduled_time().as_deref(), Some("15:00"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (scheduler, _) = scheduler(Arc::new(ManualClock::new(at(2, 9, 0, 0))));
        scheduler.stop();
        assert!(scheduler.start("15:00"));
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.scheduled_time(), None);
        assert_eq!(scheduler.next_run(), None);
    }

    #[test]
    fn test_start_without_runtime_is_refused() {
        let (scheduler, _) = scheduler(Arc::new(ManualClock::new(at(2, 9, 0, 0))));
        assert!(!scheduler.start("15:00"));
        assert!(!scheduler.is_active());
    }

    #[tokio::test]
    async fn test_due_trigger_fires_once_per_day() {
        let clock = Arc::new(ManualClock::new(at(2, 14, 59, 0)));
        let (scheduler, fired) = scheduler(clock.clone());
        assert!(scheduler.start("15:00"));

        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.set(at(2, 15, 0, 0));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.next_run(), Some(at(3, 15, 0, 0)));

        clock.advance(chrono::Duration::hours(2));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        clock.set(at(3, 15, 0, 1));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_trigger() {
        let clock = Arc::new(ManualClock::new(at(2, 9, 0, 0)));
        let (scheduler, fired) = scheduler(clock.clone());
        assert!(scheduler.start("15:00"));
        assert!(scheduler.start("16:00"));
        assert_eq!(scheduler.scheduled_time().as_deref(), Some("16:00"));

        clock.set(at(2, 15, 30, 0));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.set(at(2, 16, 0, 0));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_scheduler_never_fires() {
        let clock = Arc::new(ManualClock::new(at(2, 9, 0, 0)));
        let (scheduler, fired) = scheduler(clock.clone());
        assert!(scheduler.start("15:00"));
        scheduler.stop();

        clock.set(at(2, 15, 0, 0));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_trigger_keeps_loop_alive() {
        let clock = Arc::new(ManualClock::new(at(2, 14, 59, 0)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let scheduler = Scheduler::new(
            "panicky",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("trigger blew up");
            }),
        )
        .with_clock(clock.clone())
        .with_poll_interval(Duration::from_millis(5));

        assert!(scheduler.start("15:00"));
        clock.set(at(2, 15, 0, 0));
        settle().await;
        clock.set(at(3, 15, 0, 0));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_active());
    }
}
