//! Credit pricing tables
//!
//! Two tabulated step functions over file size and processing time, summed
//! into the credits charged for a completed job. The table values are the
//! pricing contract; changing them changes what users pay.

use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Reporting labels for the size component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
}

/// Reporting labels for the time component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeTier {
    Quick,
    Normal,
    Slow,
    Heavy,
    Extreme,
}

/// Per-job charge with its component breakdown, persisted on the job row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBreakdown {
    pub size_tier: SizeTier,
    pub time_tier: TimeTier,
    pub size_credits: i64,
    pub time_credits: i64,
    pub total: i64,
}

/// Size component: thresholds are strict `<`, not `<=`
pub fn size_credits(bytes: u64) -> (SizeTier, i64) {
    if bytes < 512 * KIB {
        (SizeTier::Tiny, 2)
    } else if bytes < 5 * MIB {
        (SizeTier::Small, 5)
    } else if bytes < 20 * MIB {
        (SizeTier::Medium, 10)
    } else if bytes < 50 * MIB {
        (SizeTier::Large, 20)
    } else {
        (SizeTier::Huge, 35)
    }
}

/// Time component: thresholds are strict `<`, not `<=`
pub fn time_credits(seconds: u64) -> (TimeTier, i64) {
    if seconds < 10 {
        (TimeTier::Quick, 0)
    } else if seconds < 30 {
        (TimeTier::Normal, 3)
    } else if seconds < 60 {
        (TimeTier::Slow, 7)
    } else if seconds < 120 {
        (TimeTier::Heavy, 15)
    } else {
        (TimeTier::Extreme, 25)
    }
}

/// Price a job from its recorded file size and processing time
pub fn price(file_size: u64, processing_seconds: u64) -> CreditBreakdown {
    let (size_tier, size_credits) = size_credits(file_size);
    let (time_tier, time_credits) = time_credits(processing_seconds);
    CreditBreakdown {
        size_tier,
        time_tier,
        size_credits,
        time_credits,
        total: size_credits + time_credits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_table() {
        assert_eq!(size_credits(0), (SizeTier::Tiny, 2));
        assert_eq!(size_credits(200 * KIB), (SizeTier::Tiny, 2));
        // Exactly 500 KiB crosses into the next band (strict `<`)
        assert_eq!(size_credits(512 * KIB), (SizeTier::Small, 5));
        assert_eq!(size_credits(5 * MIB - 1), (SizeTier::Small, 5));
        assert_eq!(size_credits(5 * MIB), (SizeTier::Medium, 10));
        // Exactly 20 MiB is Large, not Medium
        assert_eq!(size_credits(20 * MIB), (SizeTier::Large, 20));
        assert_eq!(size_credits(50 * MIB), (SizeTier::Huge, 35));
        assert_eq!(size_credits(60 * MIB), (SizeTier::Huge, 35));
    }

    #[test]
    fn time_table() {
        assert_eq!(time_credits(0), (TimeTier::Quick, 0));
        assert_eq!(time_credits(9), (TimeTier::Quick, 0));
        // Exactly 10 s is Normal
        assert_eq!(time_credits(10), (TimeTier::Normal, 3));
        assert_eq!(time_credits(29), (TimeTier::Normal, 3));
        assert_eq!(time_credits(30), (TimeTier::Slow, 7));
        assert_eq!(time_credits(60), (TimeTier::Heavy, 15));
        assert_eq!(time_credits(119), (TimeTier::Heavy, 15));
        assert_eq!(time_credits(120), (TimeTier::Extreme, 25));
        assert_eq!(time_credits(150), (TimeTier::Extreme, 25));
    }

    #[test]
    fn total_is_component_sum() {
        // 200 KiB in 5 s: the small fast file from the standard scenario
        let breakdown = price(200 * KIB, 5);
        assert_eq!(breakdown.size_credits, 2);
        assert_eq!(breakdown.time_credits, 0);
        assert_eq!(breakdown.total, 2);

        // 60 MiB in 150 s: the worst-case debt scenario
        let breakdown = price(60 * MIB, 150);
        assert_eq!(breakdown.size_credits, 35);
        assert_eq!(breakdown.time_credits, 25);
        assert_eq!(breakdown.total, 60);
    }

    #[test]
    fn breakdown_serializes_with_lowercase_tiers() {
        let breakdown = price(MIB, 40);
        let json = serde_json::to_value(&breakdown).unwrap();
        assert_eq!(json["size_tier"], "small");
        assert_eq!(json["time_tier"], "slow");
        assert_eq!(json["total"], 12);
    }
}
