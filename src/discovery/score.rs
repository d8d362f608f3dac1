/// Composite admission score: weighted blend of market cap, volume,
/// 24h momentum, and an externally supplied sentiment signal, each
/// normalized to [0, 1].
///
/// Market cap and volume are log-scaled so a $50B instrument does not
/// drown out every mid-cap; momentum maps +/-50% into the unit range.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub market_cap: f64,
    pub volume_24h: f64,
    /// 24h price change in percent (e.g. -12.5).
    pub momentum_24h_pct: f64,
    /// External numeric signal in [0, 1]; 0.5 is neutral.
    pub sentiment: f64,
}

const WEIGHT_MARKET_CAP: f64 = 0.35;
const WEIGHT_VOLUME: f64 = 0.25;
const WEIGHT_MOMENTUM: f64 = 0.20;
const WEIGHT_SENTIMENT: f64 = 0.20;

pub fn composite_score(inputs: &ScoreInputs) -> f64 {
    let market_cap = log_scale(inputs.market_cap, 1e6, 1e12);
    let volume = log_scale(inputs.volume_24h, 1e4, 1e10);
    let momentum = (inputs.momentum_24h_pct / 100.0 + 0.5).clamp(0.0, 1.0);
    let sentiment = inputs.sentiment.clamp(0.0, 1.0);

    WEIGHT_MARKET_CAP * market_cap
        + WEIGHT_VOLUME * volume
        + WEIGHT_MOMENTUM * momentum
        + WEIGHT_SENTIMENT * sentiment
}

fn log_scale(value: f64, lo: f64, hi: f64) -> f64 {
    if value <= lo {
        return 0.0;
    }
    ((value.log10() - lo.log10()) / (hi.log10() - lo.log10())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(market_cap: f64, volume: f64, momentum: f64, sentiment: f64) -> ScoreInputs {
        ScoreInputs {
            market_cap,
            volume_24h: volume,
            momentum_24h_pct: momentum,
            sentiment,
        }
    }

    #[test]
    fn test_score_stays_in_unit_range() {
        let zero = composite_score(&inputs(0.0, 0.0, -1000.0, -5.0));
        assert_eq!(zero, 0.0);

        let max = composite_score(&inputs(1e13, 1e11, 1000.0, 2.0));
        assert!((max - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_larger_market_cap_scores_higher() {
        let small = composite_score(&inputs(2e7, 1e6, 0.0, 0.5));
        let large = composite_score(&inputs(5e10, 1e6, 0.0, 0.5));
        assert!(large > small);
    }

    #[test]
    fn test_momentum_moves_the_score() {
        let falling = composite_score(&inputs(1e9, 1e8, -20.0, 0.5));
        let flat = composite_score(&inputs(1e9, 1e8, 0.0, 0.5));
        let rising = composite_score(&inputs(1e9, 1e8, 20.0, 0.5));
        assert!(falling < flat && flat < rising);
    }

    #[test]
    fn test_blue_chip_clears_default_threshold() {
        // SOL-like numbers against the default 0.5 threshold
        let score = composite_score(&inputs(68e9, 2.5e9, 3.2, 0.5));
        assert!(score > 0.5, "score {score}");
    }

    #[test]
    fn test_thin_mid_cap_stays_below_default_threshold() {
        let score = composite_score(&inputs(2e7, 1.5e6, -10.0, 0.5));
        assert!(score < 0.5, "score {score}");
    }
}
