use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Raw component values as submitted by a scorer.
///
/// Kept wider than the stored `u8` so out-of-range input is rejected rather
/// than silently wrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreComponents {
    pub quality: i64,
    pub credibility: i64,
    pub usage: i64,
    pub technical_accuracy: i64,
    pub deprecation: i64,
    pub incompleteness: i64,
    pub contradiction: i64,
    pub obsolescence: i64,
}

impl ScoreComponents {
    /// All four confidence components set to `confidence`, doubt ones to `doubt`.
    pub fn uniform(confidence: i64, doubt: i64) -> Self {
        Self {
            quality: confidence,
            credibility: confidence,
            usage: confidence,
            technical_accuracy: confidence,
            deprecation: doubt,
            incompleteness: doubt,
            contradiction: doubt,
            obsolescence: doubt,
        }
    }

    fn named(&self) -> [(&'static str, i64); 8] {
        [
            ("quality", self.quality),
            ("credibility", self.credibility),
            ("usage", self.usage),
            ("technicalAccuracy", self.technical_accuracy),
            ("deprecation", self.deprecation),
            ("incompleteness", self.incompleteness),
            ("contradiction", self.contradiction),
            ("obsolescence", self.obsolescence),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.named() {
            if !(0..=100).contains(&value) {
                return Err(StrataError::Validation(format!(
                    "score component {name} = {value} is outside 0..=100"
                )));
            }
        }
        Ok(())
    }
}

/// Per-component weights used to derive the aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight")]
    pub quality: f64,
    #[serde(default = "default_weight")]
    pub credibility: f64,
    #[serde(default = "default_weight")]
    pub usage: f64,
    #[serde(default = "default_weight")]
    pub technical_accuracy: f64,
    #[serde(default = "default_weight")]
    pub deprecation: f64,
    #[serde(default = "default_weight")]
    pub incompleteness: f64,
    #[serde(default = "default_weight")]
    pub contradiction: f64,
    #[serde(default = "default_weight")]
    pub obsolescence: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            quality: default_weight(),
            credibility: default_weight(),
            usage: default_weight(),
            technical_accuracy: default_weight(),
            deprecation: default_weight(),
            incompleteness: default_weight(),
            contradiction: default_weight(),
            obsolescence: default_weight(),
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

impl ScoreWeights {
    fn confidence(&self) -> [f64; 4] {
        [
            self.quality,
            self.credibility,
            self.usage,
            self.technical_accuracy,
        ]
    }

    fn doubt(&self) -> [f64; 4] {
        [
            self.deprecation,
            self.incompleteness,
            self.contradiction,
            self.obsolescence,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (group, weights) in [("confidence", self.confidence()), ("doubt", self.doubt())] {
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(StrataError::Config(format!(
                    "{group} weights must be finite and non-negative"
                )));
            }
            if weights.iter().sum::<f64>() <= 0.0 {
                return Err(StrataError::Config(format!(
                    "{group} weights must not all be zero"
                )));
            }
        }
        Ok(())
    }
}

/// Weighted mean, rounded to the nearest integer and clamped to 0..=100.
pub fn aggregate(values: [u8; 4], weights: [f64; 4]) -> u8 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 0;
    }
    let weighted: f64 = values
        .iter()
        .zip(weights.iter())
        .map(|(v, w)| f64::from(*v) * w)
        .sum();
    (weighted / total).round().clamp(0.0, 100.0) as u8
}

/// Stored scores for a chunk. Aggregates are always derived, never set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSet {
    pub chunk_id: String,
    pub quality: u8,
    pub credibility: u8,
    pub usage: u8,
    pub technical_accuracy: u8,
    pub confidence: u8,
    pub deprecation: u8,
    pub incompleteness: u8,
    pub contradiction: u8,
    pub obsolescence: u8,
    pub doubt: u8,
    pub updated_at: DateTime<Utc>,
}

impl ScoreSet {
    pub fn from_components(
        chunk_id: impl Into<String>,
        components: &ScoreComponents,
        weights: &ScoreWeights,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        components.validate()?;

        // validated above, so the narrowing casts cannot truncate
        let c = |v: i64| v as u8;
        let mut set = Self {
            chunk_id: chunk_id.into(),
            quality: c(components.quality),
            credibility: c(components.credibility),
            usage: c(components.usage),
            technical_accuracy: c(components.technical_accuracy),
            confidence: 0,
            deprecation: c(components.deprecation),
            incompleteness: c(components.incompleteness),
            contradiction: c(components.contradiction),
            obsolescence: c(components.obsolescence),
            doubt: 0,
            updated_at: now,
        };
        (set.confidence, set.doubt) = set.recompute(weights);
        Ok(set)
    }

    /// Aggregates as derived from the stored components.
    pub fn recompute(&self, weights: &ScoreWeights) -> (u8, u8) {
        let confidence = aggregate(
            [
                self.quality,
                self.credibility,
                self.usage,
                self.technical_accuracy,
            ],
            weights.confidence(),
        );
        let doubt = aggregate(
            [
                self.deprecation,
                self.incompleteness,
                self.contradiction,
                self.obsolescence,
            ],
            weights.doubt(),
        );
        (confidence, doubt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_equal_weights_average() {
        assert_eq!(aggregate([90, 90, 90, 90], [1.0; 4]), 90);
        assert_eq!(aggregate([0, 0, 100, 100], [1.0; 4]), 50);
        assert_eq!(aggregate([1, 2, 2, 2], [1.0; 4]), 2);
    }

    #[test]
    fn test_custom_weights_shift_aggregate() {
        assert_eq!(aggregate([100, 0, 0, 0], [3.0, 1.0, 0.0, 0.0]), 75);
    }

    #[test]
    fn test_zero_weights_rejected() {
        let weights = ScoreWeights {
            quality: 0.0,
            credibility: 0.0,
            usage: 0.0,
            technical_accuracy: 0.0,
            ..ScoreWeights::default()
        };
        assert!(matches!(weights.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_out_of_range_component_rejected() {
        let mut components = ScoreComponents::uniform(50, 10);
        components.usage = 101;
        let err = ScoreSet::from_components("c1", &components, &ScoreWeights::default(), Utc::now());
        assert!(matches!(err, Err(StrataError::Validation(msg)) if msg.contains("usage")));

        components.usage = -1;
        assert!(components.validate().is_err());
    }

    #[test]
    fn test_components_deserialize_from_camel_case() {
        let json = r#"{"quality":90,"credibility":80,"usage":70,"technicalAccuracy":60,
            "deprecation":1,"incompleteness":2,"contradiction":3,"obsolescence":4}"#;
        let components: ScoreComponents = serde_json::from_str(json).unwrap();
        assert_eq!(components.technical_accuracy, 60);
        let set = ScoreSet::from_components("c1", &components, &ScoreWeights::default(), Utc::now())
            .unwrap();
        assert_eq!(set.confidence, 75);
        assert_eq!(set.doubt, 3);
    }

    fn arb_component() -> impl Strategy<Value = i64> {
        0i64..=100
    }

    proptest! {
        #[test]
        fn prop_aggregates_are_reproducible(
            q in arb_component(), cr in arb_component(), u in arb_component(), t in arb_component(),
            d in arb_component(), i in arb_component(), co in arb_component(), o in arb_component(),
            wq in 0.0f64..5.0, wc in 0.1f64..5.0,
        ) {
            let components = ScoreComponents {
                quality: q, credibility: cr, usage: u, technical_accuracy: t,
                deprecation: d, incompleteness: i, contradiction: co, obsolescence: o,
            };
            let weights = ScoreWeights { quality: wq, credibility: wc, ..ScoreWeights::default() };
            let set = ScoreSet::from_components("c", &components, &weights, Utc::now()).unwrap();

            prop_assert!(set.confidence <= 100);
            prop_assert!(set.doubt <= 100);
            prop_assert_eq!(set.recompute(&weights), (set.confidence, set.doubt));
        }

        #[test]
        fn prop_out_of_range_never_accepted(value in prop_oneof![i64::MIN..0i64, 101i64..i64::MAX]) {
            let mut components = ScoreComponents::uniform(50, 50);
            components.obsolescence = value;
            prop_assert!(components.validate().is_err());
        }
    }
}
