//! Synthetic login traffic for demos and local testing.
//!
//! Writes plausible attempts into the event log so the dashboard and alert
//! rules have something to chew on. Every tick is either a normal batch or,
//! with probability `burst_prob`, a larger batch with a depressed success
//! ratio that looks like an outage or a credential-stuffing run.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::config::TrafficConfig;
use crate::events::{hash_user, AttemptRecord, AttemptResult, Channel, FailReason};
use crate::storage::{insert_attempt, Pool, StoreError};

const CHANNELS: [Channel; 3] = [Channel::Web, Channel::Mykt, Channel::Membership];
const IPS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "172.16.0.5"];
const FAIL_REASONS: [FailReason; 3] = [FailReason::InvalidPw, FailReason::Locked, FailReason::OtpFail];
const USER_AGENT: &str = "bg-traffic/1.0";
const FINGERPRINTS: u32 = 8;
const MIN_LATENCY_MS: f64 = 20.0;

pub struct TrafficGenerator {
    pool: Pool,
    config: TrafficConfig,
    rng: StdRng,
    normal_user: String,
    attacker_user: String,
}

impl TrafficGenerator {
    pub fn new(pool: Pool, config: TrafficConfig) -> Self {
        Self::with_rng(pool, config, StdRng::from_entropy())
    }

    /// Reproducible generator for tests.
    pub fn seeded(pool: Pool, config: TrafficConfig, seed: u64) -> Self {
        Self::with_rng(pool, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(pool: Pool, config: TrafficConfig, rng: StdRng) -> Self {
        Self {
            pool,
            config,
            rng,
            normal_user: hash_user("user@example.com"),
            attacker_user: hash_user("attacker@example.com"),
        }
    }

    /// Normal sample via Box-Muller.
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + z * std_dev
    }

    fn attempt(&mut self, success_ratio: f64, now: DateTime<Utc>) -> AttemptRecord {
        let ok = self.rng.gen_bool(success_ratio.clamp(0.0, 1.0));
        let channel = CHANNELS.choose(&mut self.rng).cloned().unwrap_or(Channel::Web);
        let ip = IPS.choose(&mut self.rng).copied().unwrap_or(IPS[0]);
        let fingerprint = format!("fp-{}", self.rng.gen_range(1..=FINGERPRINTS));
        let fail_reason = if ok {
            FailReason::None
        } else {
            FAIL_REASONS
                .choose(&mut self.rng)
                .cloned()
                .unwrap_or(FailReason::InvalidPw)
        };
        let latency = self
            .gauss(if ok { 90.0 } else { 160.0 }, 25.0)
            .max(MIN_LATENCY_MS);

        AttemptRecord {
            timestamp: now,
            channel,
            user_hash: if ok {
                self.normal_user.clone()
            } else {
                self.attacker_user.clone()
            },
            ip: ip.to_string(),
            user_agent: USER_AGENT.to_string(),
            fingerprint,
            result: if ok { AttemptResult::Success } else { AttemptResult::Fail },
            fail_reason,
            latency_ms: latency.round() as u32,
        }
    }

    /// Insert `count` attempts stamped `now`.
    pub fn insert_batch(&mut self, count: usize, success_ratio: f64, now: DateTime<Utc>) -> Result<usize, StoreError> {
        for _ in 0..count {
            let record = self.attempt(success_ratio, now);
            insert_attempt(&self.pool, &record)?;
        }
        Ok(count)
    }

    /// One generator step: a burst or a normal batch.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let burst = self.rng.gen_bool(self.config.burst_prob.clamp(0.0, 1.0));
        let (count, success) = if burst {
            (self.config.burst_batch, self.config.burst_success)
        } else {
            (self.config.normal_batch, self.config.normal_success)
        };
        let inserted = self.insert_batch(count, success, now)?;
        debug!(inserted, burst, "synthetic batch written");
        Ok(inserted)
    }

    /// Run `batches` ticks back to back. Used by the `simulate` command.
    pub fn run_batches(&mut self, batches: usize) -> Result<usize, StoreError> {
        let mut total = 0;
        for _ in 0..batches {
            total += self.tick(Utc::now())?;
        }
        Ok(total)
    }

    /// Tick forever, sleeping `base_sleep_ms` between batches. Each batch is
    /// written on the blocking pool. Write errors are logged and the loop
    /// carries on; a panicked batch stops the generator.
    pub async fn run(self) {
        info!(
            sleep_ms = self.config.base_sleep_ms,
            burst_prob = self.config.burst_prob,
            "synthetic traffic generator started"
        );
        let pause = StdDuration::from_millis(self.config.base_sleep_ms);
        let mut generator = self;
        loop {
            let batch = tokio::task::spawn_blocking(move || {
                let result = generator.tick(Utc::now());
                (generator, result)
            });
            generator = match batch.await {
                Ok((generator, result)) => {
                    if let Err(e) = result {
                        warn!(error = %e, "synthetic batch failed");
                    }
                    generator
                }
                Err(e) => {
                    error!(error = %e, "synthetic batch task failed, generator stopped");
                    return;
                }
            };
            tokio::time::sleep(pause).await;
        }
    }
}
