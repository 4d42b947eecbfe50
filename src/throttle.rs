//! Per-client request throttling with watch windows and timed blocks.
//!
//! Each client address gets a tracker counting requests inside a watch
//! window. Crossing the threshold transitions the tracker to blocked for a
//! fixed duration; expired watches and expired blocks are evicted the next
//! time the address is observed. Allow- and deny-lists bypass the window
//! logic entirely. All tracker mutation happens under a single mutex and no
//! I/O ever runs while it is held.
//!
//! Denied requests answer `429` with an empty `text/plain` body and a
//! `Retry-After` header carrying the block expiry as unix seconds.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    body::HibanaBody,
    error::Error,
    pipeline::{Next, Stage},
    types::{Request, Response, StageResult},
};

/// Throttle settings.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Watch window length.
    pub interval: Duration,
    /// Block length once the threshold is crossed.
    pub duration: Duration,
    /// Requests allowed inside a watch window before blocking.
    pub threshold: u64,
    /// Addresses that bypass throttling entirely.
    pub whitelist: Vec<IpAddr>,
    /// Addresses that are always denied.
    pub blacklist: Vec<IpAddr>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            duration: Duration::from_secs(300),
            threshold: 100,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

struct Tracker {
    expires: Instant,
    requests: u64,
    block_expires: Option<Instant>,
    /// Wall-clock block expiry for the `Retry-After` header.
    block_expires_unix: Option<u64>,
}

/// Counts exposed for operational inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleStats {
    pub tracked_ips: usize,
    pub blocked_ips: usize,
}

enum Decision {
    Allow,
    Deny { retry_after_unix: u64 },
}

/// Watch-window rate limiter keyed by client address.
pub struct Throttle {
    config: ThrottleConfig,
    trackers: Mutex<HashMap<IpAddr, Tracker>>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, ip: IpAddr) -> Decision {
        if self.config.whitelist.contains(&ip) {
            return Decision::Allow;
        }
        if self.config.blacklist.contains(&ip) {
            return Decision::Deny {
                retry_after_unix: unix_now(),
            };
        }

        enum Outcome {
            EvictExpired,
            EvictReleased,
            Deny(u64),
            Block(u64),
            Allow,
        }

        let now = Instant::now();
        let mut trackers = self.trackers.lock();
        let tracker = trackers.entry(ip).or_insert_with(|| Tracker {
            expires: now + self.config.interval,
            requests: 0,
            block_expires: None,
            block_expires_unix: None,
        });
        tracker.requests += 1;

        let outcome = match tracker.block_expires {
            None if now >= tracker.expires => Outcome::EvictExpired,
            Some(block_expires) if now >= block_expires => Outcome::EvictReleased,
            Some(_) => Outcome::Deny(tracker.block_expires_unix.unwrap_or_else(unix_now)),
            None if tracker.requests > self.config.threshold => {
                let retry_after_unix = unix_now() + self.config.duration.as_secs();
                tracker.block_expires = Some(now + self.config.duration);
                tracker.block_expires_unix = Some(retry_after_unix);
                tracing::warn!(%ip, requests = tracker.requests, "throttle block engaged");
                Outcome::Block(retry_after_unix)
            }
            None => Outcome::Allow,
        };

        match outcome {
            Outcome::EvictExpired => {
                // The watch window lapsed without a block: forget the client.
                trackers.remove(&ip);
                Decision::Allow
            }
            Outcome::EvictReleased => {
                trackers.remove(&ip);
                tracing::info!(%ip, "throttle block released");
                Decision::Allow
            }
            Outcome::Deny(retry_after_unix) | Outcome::Block(retry_after_unix) => {
                Decision::Deny { retry_after_unix }
            }
            Outcome::Allow => Decision::Allow,
        }
    }

    /// Current tracker and block counts.
    pub fn stats(&self) -> ThrottleStats {
        let trackers = self.trackers.lock();
        ThrottleStats {
            tracked_ips: trackers.len(),
            blocked_ips: trackers
                .values()
                .filter(|t| t.block_expires.is_some())
                .count(),
        }
    }

    /// Drops every tracker. Test seam.
    pub fn reset(&self) {
        self.trackers.lock().clear();
    }

    fn deny_response(retry_after_unix: u64) -> Result<Response, Error> {
        http::Response::builder()
            .status(http::StatusCode::TOO_MANY_REQUESTS)
            .header(http::header::CONTENT_TYPE, "text/plain")
            .header(http::header::CONTENT_LENGTH, "0")
            .header(http::header::RETRY_AFTER, retry_after_unix.to_string())
            .body(HibanaBody::empty())
            .map_err(|e| Error::internal(e.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl Stage for Throttle {
    async fn call(&self, req: Request, next: Next) -> StageResult {
        let ip = req
            .extensions()
            .get::<SocketAddr>()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        match self.check(ip) {
            Decision::Allow => next.run(req).await,
            Decision::Deny { retry_after_unix } => Self::deny_response(retry_after_unix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(interval_ms: u64, duration_ms: u64, threshold: u64) -> Throttle {
        Throttle::new(ThrottleConfig {
            interval: Duration::from_millis(interval_ms),
            duration: Duration::from_millis(duration_ms),
            threshold,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([1, 1, 1, last])
    }

    #[test]
    fn threshold_crossing_blocks_and_block_expiry_releases() {
        let throttle = throttle(5_000, 50, 3);
        let client = ip(1);

        for _ in 0..3 {
            assert!(matches!(throttle.check(client), Decision::Allow));
        }
        let denied = throttle.check(client);
        match denied {
            Decision::Deny { retry_after_unix } => {
                assert!(retry_after_unix + 1 >= unix_now());
            }
            Decision::Allow => panic!("fourth request must be denied"),
        }
        assert_eq!(throttle.stats().blocked_ips, 1);

        // While the block holds, requests keep getting denied.
        assert!(matches!(throttle.check(client), Decision::Deny { .. }));

        std::thread::sleep(Duration::from_millis(80));
        assert!(matches!(throttle.check(client), Decision::Allow));
        assert_eq!(throttle.stats().blocked_ips, 0);
    }

    #[test]
    fn watch_window_expiry_evicts_the_tracker() {
        let throttle = throttle(30, 1_000, 100);
        let client = ip(2);

        assert!(matches!(throttle.check(client), Decision::Allow));
        assert_eq!(throttle.stats().tracked_ips, 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(throttle.check(client), Decision::Allow));
        assert_eq!(throttle.stats().tracked_ips, 0);
    }

    #[test]
    fn blocked_trackers_either_expire_or_hold() {
        let throttle = throttle(5_000, 10_000, 1);
        let client = ip(3);

        assert!(matches!(throttle.check(client), Decision::Allow));
        assert!(matches!(throttle.check(client), Decision::Deny { .. }));
        // Invariant: a blocked tracker keeps denying until its expiry passes.
        assert!(matches!(throttle.check(client), Decision::Deny { .. }));
        assert_eq!(throttle.stats().blocked_ips, 1);
    }

    #[test]
    fn whitelist_bypasses_and_blacklist_denies() {
        let throttle = Throttle::new(ThrottleConfig {
            interval: Duration::from_secs(5),
            duration: Duration::from_secs(5),
            threshold: 0,
            whitelist: vec![ip(10)],
            blacklist: vec![ip(11)],
        });

        // Whitelisted clients are never tracked, even with a zero threshold.
        assert!(matches!(throttle.check(ip(10)), Decision::Allow));
        assert_eq!(throttle.stats().tracked_ips, 0);

        assert!(matches!(throttle.check(ip(11)), Decision::Deny { .. }));
    }

    #[test]
    fn reset_forgets_everything() {
        let throttle = throttle(5_000, 5_000, 1);
        throttle.check(ip(4));
        throttle.check(ip(4));
        assert_eq!(throttle.stats().tracked_ips, 1);
        throttle.reset();
        assert_eq!(
            throttle.stats(),
            ThrottleStats {
                tracked_ips: 0,
                blocked_ips: 0
            }
        );
    }

    #[test]
    fn deny_responses_carry_the_contract_headers() {
        let res = Throttle::deny_response(1_234_567).unwrap();
        assert_eq!(res.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[http::header::CONTENT_TYPE], "text/plain");
        assert_eq!(res.headers()[http::header::CONTENT_LENGTH], "0");
        assert_eq!(res.headers()[http::header::RETRY_AFTER], "1234567");
    }
}
