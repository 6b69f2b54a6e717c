//! Soft rotation thresholds
//!
//! A key is rotated away from before it hits the hard cap, once it crosses a
//! fraction of the daily limit or an absolute request count. The thresholds
//! can be sampled from a range on every check so rotation points are spread
//! across keys instead of landing on one fixed, recognisable pattern.

use std::ops::RangeInclusive;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::error::{Error, Result};
use crate::ledger::Usage;

/// One sampled pair of thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Fraction of the daily limit, in (0, 1]
    pub fraction: f64,
    /// Absolute request count
    pub requests: u64,
}

impl Thresholds {
    /// Whether `usage` has crossed either threshold.
    pub fn should_rotate(&self, usage: Usage, daily_limit: u64) -> bool {
        usage.quota_used as f64 >= daily_limit as f64 * self.fraction
            || usage.request_count >= self.requests
    }
}

/// Source of rotation thresholds.
pub enum ThresholdPolicy {
    Fixed(Thresholds),
    Ranged {
        fraction: RangeInclusive<f64>,
        requests: RangeInclusive<u64>,
        rng: Mutex<StdRng>,
    },
}

impl ThresholdPolicy {
    pub fn fixed(fraction: f64, requests: u64) -> Result<Self> {
        validate_fraction(fraction)?;
        validate_requests(requests)?;
        Ok(Self::Fixed(Thresholds { fraction, requests }))
    }

    /// Ranged policy seeded from the thread RNG.
    pub fn ranged(fraction: RangeInclusive<f64>, requests: RangeInclusive<u64>) -> Result<Self> {
        let seed: u64 = rand::rng().random();
        Self::ranged_seeded(fraction, requests, seed)
    }

    /// Ranged policy with a fixed seed, for reproducible rotation points.
    pub fn ranged_seeded(
        fraction: RangeInclusive<f64>,
        requests: RangeInclusive<u64>,
        seed: u64,
    ) -> Result<Self> {
        validate_fraction(*fraction.start())?;
        validate_fraction(*fraction.end())?;
        validate_requests(*requests.start())?;
        if fraction.start() > fraction.end() {
            return Err(Error::InvalidThresholds(format!(
                "fraction range is inverted: {:?}",
                fraction
            )));
        }
        if requests.start() > requests.end() {
            return Err(Error::InvalidThresholds(format!(
                "request range is inverted: {:?}",
                requests
            )));
        }
        if fraction.start() == fraction.end() && requests.start() == requests.end() {
            return Ok(Self::Fixed(Thresholds {
                fraction: *fraction.start(),
                requests: *requests.start(),
            }));
        }
        Ok(Self::Ranged {
            fraction,
            requests,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Thresholds for one rotation check.
    pub fn sample(&self) -> Thresholds {
        match self {
            ThresholdPolicy::Fixed(thresholds) => *thresholds,
            ThresholdPolicy::Ranged {
                fraction,
                requests,
                rng,
            } => {
                let mut rng = rng.lock().unwrap_or_else(|e| e.into_inner());
                Thresholds {
                    fraction: rng.random_range(fraction.clone()),
                    requests: rng.random_range(requests.clone()),
                }
            }
        }
    }
}

fn validate_fraction(fraction: f64) -> Result<()> {
    if fraction.is_finite() && fraction > 0.0 && fraction <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidThresholds(format!(
            "fraction must be in (0, 1], got {fraction}"
        )))
    }
}

fn validate_requests(requests: u64) -> Result<()> {
    if requests == 0 {
        return Err(Error::InvalidThresholds(
            "request threshold must be greater than 0".into(),
        ));
    }
    Ok(())
}
