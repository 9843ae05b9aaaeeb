use std::time::{Duration, Instant};

/// One-shot suspend deadline for the blocking wait.
///
/// Re-arming on every `suspend_until` call with an unchanged deadline causes spurious
/// wake/cancel churn: the dispatcher asks to suspend, the poller wakes for an unrelated event,
/// finds nothing ready and asks to suspend until the SAME deadline again. Arming must therefore
/// be suppressed when the requested deadline equals the one already armed.
#[derive(Debug, Default)]
pub struct SuspendTimer {
    deadline: Option<Instant>,
    arm_count: u64,
}

impl SuspendTimer {
    pub fn new() -> SuspendTimer {
        SuspendTimer::default()
    }

    /// Arm the timer for `deadline`, unless that exact deadline is already armed. `None`
    /// disarms.
    pub fn arm(&mut self, deadline: Option<Instant>) {
        if deadline == self.deadline {
            return;
        }
        self.deadline = deadline;
        if deadline.is_some() {
            self.arm_count += 1;
        }
    }

    /// Remaining time until the armed deadline, for use as a blocking-wait timeout. `None`
    /// means no deadline is armed and the wait may block indefinitely.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|d| d.checked_duration_since(now).unwrap_or(Duration::ZERO))
    }

    /// Disarm if the deadline has passed and report whether it fired.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Number of times a timer was actually armed. Observable stand-in for "a wake callback
    /// was scheduled"; two `arm` calls with one deadline must count once.
    pub fn arm_count(&self) -> u64 {
        self.arm_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_same_deadline_is_suppressed() {
        let mut timer = SuspendTimer::new();
        let deadline = Instant::now() + Duration::from_millis(50);

        timer.arm(Some(deadline));
        timer.arm(Some(deadline));
        timer.arm(Some(deadline));
        assert_eq!(timer.arm_count(), 1);

        // A different deadline re-arms.
        timer.arm(Some(deadline + Duration::from_millis(1)));
        assert_eq!(timer.arm_count(), 2);
    }

    #[test]
    fn timeout_and_expiry() {
        let mut timer = SuspendTimer::new();
        let now = Instant::now();

        assert_eq!(timer.timeout(now), None);
        assert!(!timer.expire(now));

        timer.arm(Some(now + Duration::from_millis(20)));
        let left = timer.timeout(now).unwrap();
        assert!(left <= Duration::from_millis(20));
        assert!(!timer.expire(now));
        assert!(timer.expire(now + Duration::from_millis(20)));

        // Fired timers are disarmed.
        assert_eq!(timer.timeout(now), None);
    }

    #[test]
    fn past_deadline_yields_zero_timeout() {
        let mut timer = SuspendTimer::new();
        let now = Instant::now();
        timer.arm(Some(now));
        assert_eq!(timer.timeout(now + Duration::from_millis(1)), Some(Duration::ZERO));
    }
}
