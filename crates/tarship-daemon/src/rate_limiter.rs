//! Failed-login limiter
//!
//! Tracks failed authentications per IP address. After `max_failures`
//! failures inside `window` the address is locked out; each further lockout
//! doubles in length up to `MAX_LOCKOUT`. An address whose last lockout
//! ended more than `forget_after` ago starts over with a clean record.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Longest lockout, however often an address re-offends
const MAX_LOCKOUT: Duration = Duration::from_secs(3600);

/// Cap on the backoff exponent (2^6 = 64x)
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Failures inside `window` that trigger a lockout
    pub max_failures: u32,
    pub window: Duration,
    /// First lockout length
    pub lockout: Duration,
    /// Quiet time after a lockout before the address is forgotten
    pub forget_after: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(60),
            forget_after: MAX_LOCKOUT,
        }
    }
}

#[derive(Debug, Default)]
struct Offender {
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
    lockouts: u32,
}

impl Offender {
    fn forget_before(&mut self, cutoff: Instant) {
        while self.failures.front().is_some_and(|t| *t <= cutoff) {
            self.failures.pop_front();
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Whether the last lockout still counts towards the backoff
    fn remembered(&self, now: Instant, forget_after: Duration) -> bool {
        self.locked_until
            .is_some_and(|until| now < until + forget_after)
    }
}

/// Shared across all connection tasks of a host
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    offenders: Arc<Mutex<HashMap<IpAddr, Offender>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            offenders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `Err` with the time left if `ip` is locked out
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let offenders = self.offenders.lock();
        match offenders.get(&ip).and_then(|o| o.remaining(Instant::now())) {
            Some(left) => Err(left),
            None => Ok(()),
        }
    }

    /// Forget recent failures after a good login. Past lockouts still count
    /// towards the backoff.
    pub fn record_success(&self, ip: IpAddr) {
        if let Some(offender) = self.offenders.lock().get_mut(&ip) {
            offender.failures.clear();
            debug!("Cleared failed logins for {}", ip);
        }
    }

    /// Record a failed login. Returns the lockout length if this failure
    /// triggered one.
    pub fn record_failure(&self, ip: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let mut offenders = self.offenders.lock();
        let offender = offenders.entry(ip).or_default();

        if offender.remaining(now).is_some() {
            return None;
        }
        if offender.lockouts > 0 && !offender.remembered(now, self.config.forget_after) {
            debug!("Forgetting past lockouts of {}", ip);
            offender.lockouts = 0;
            offender.locked_until = None;
        }

        if let Some(cutoff) = now.checked_sub(self.config.window) {
            offender.forget_before(cutoff);
        }
        offender.failures.push_back(now);

        if (offender.failures.len() as u32) < self.config.max_failures {
            debug!(
                "Failed login from {} ({}/{})",
                ip,
                offender.failures.len(),
                self.config.max_failures
            );
            return None;
        }

        let factor = 1u32 << offender.lockouts.min(MAX_BACKOFF_SHIFT);
        let lockout = (self.config.lockout * factor).min(MAX_LOCKOUT);
        offender.locked_until = Some(now + lockout);
        offender.lockouts = offender.lockouts.saturating_add(1);
        offender.failures.clear();

        warn!(
            "Locked out {} for {}s after {} failed logins (lockout #{})",
            ip,
            lockout.as_secs(),
            self.config.max_failures,
            offender.lockouts
        );
        Some(lockout)
    }

    /// Drop addresses with nothing left to remember
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        let forget_after = self.config.forget_after;
        self.offenders.lock().retain(|_, offender| {
            if let Some(cutoff) = now.checked_sub(window) {
                offender.forget_before(cutoff);
            }
            !offender.failures.is_empty() || offender.remembered(now, forget_after)
        });
    }

    /// Number of addresses currently locked out
    pub fn locked_out(&self) -> usize {
        let now = Instant::now();
        self.offenders
            .lock()
            .values()
            .filter(|o| o.remaining(now).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter(max_failures: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            max_failures,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(60),
            forget_after: Duration::from_secs(3600),
        })
    }

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

    #[test]
    fn test_fresh_address_allowed() {
        assert!(limiter(3).check(IP).is_ok());
    }

    #[test]
    fn test_locks_out_after_max_failures() {
        let limiter = limiter(3);

        assert_eq!(limiter.record_failure(IP), None);
        assert_eq!(limiter.record_failure(IP), None);
        assert_eq!(limiter.record_failure(IP), Some(Duration::from_secs(60)));

        let left = limiter.check(IP).unwrap_err();
        assert!(left <= Duration::from_secs(60));
        assert_eq!(limiter.locked_out(), 1);
    }

    #[test]
    fn test_success_resets_count() {
        let limiter = limiter(3);

        limiter.record_failure(IP);
        limiter.record_failure(IP);
        limiter.record_success(IP);

        assert_eq!(limiter.record_failure(IP), None);
        assert_eq!(limiter.record_failure(IP), None);
        assert!(limiter.check(IP).is_ok());
    }

    #[test]
    fn test_addresses_tracked_separately() {
        let limiter = limiter(2);
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));

        limiter.record_failure(IP);
        limiter.record_failure(IP);

        assert!(limiter.check(other).is_ok());
        assert!(limiter.check(IP).is_err());
    }

    #[test]
    fn test_lockouts_back_off() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_failures: 1,
            window: Duration::from_secs(60),
            lockout: Duration::from_millis(10),
            forget_after: Duration::from_secs(3600),
        });

        assert_eq!(limiter.record_failure(IP), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.check(IP).is_ok());
        assert_eq!(limiter.record_failure(IP), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_prune_keeps_repeat_offenders() {
        let limiter = limiter(5);
        limiter.record_failure(IP);
        limiter.prune();
        assert_eq!(limiter.offenders.lock().len(), 1);
    }

    #[test]
    fn test_prune_forgets_old_lockouts() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_failures: 1,
            window: Duration::from_millis(10),
            lockout: Duration::from_millis(10),
            forget_after: Duration::from_millis(20),
        });

        limiter.record_failure(IP);
        limiter.prune();
        assert_eq!(limiter.offenders.lock().len(), 1);

        std::thread::sleep(Duration::from_millis(50));
        limiter.prune();
        assert!(limiter.offenders.lock().is_empty());
    }

    #[test]
    fn test_backoff_resets_after_quiet_period() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_failures: 1,
            window: Duration::from_secs(60),
            lockout: Duration::from_millis(10),
            forget_after: Duration::from_millis(20),
        });

        assert_eq!(limiter.record_failure(IP), Some(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(limiter.record_failure(IP), Some(Duration::from_millis(10)));
    }
}
