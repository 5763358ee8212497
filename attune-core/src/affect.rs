//! Affect detection: a three-axis emotional shape and the conversational
//! complement that answers it.
//!
//! Axes, each in [-1, 1]:
//! - **expansion**: open/exploring (+) vs. contracted/withdrawn (-)
//! - **activation**: energised (+) vs. frozen/flooded (-)
//! - **certainty**: sure of direction (+) vs. lost (-)

use serde::{Deserialize, Serialize};

/// Emotional shape of a message.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AffectShape {
    /// Open (+) vs. contracted (-).
    pub expansion: f32,
    /// Energised (+) vs. frozen (-).
    pub activation: f32,
    /// Certain (+) vs. uncertain (-).
    pub certainty: f32,
}

impl AffectShape {
    /// Euclidean magnitude of the shape.
    #[must_use]
    pub fn magnitude(&self) -> f32 {
        (self.expansion.powi(2) + self.activation.powi(2) + self.certainty.powi(2)).sqrt()
    }

    fn finalize(self) -> Self {
        let axis = |v: f32| {
            let v = if v.is_nan() { 0.0 } else { v.clamp(-1.0, 1.0) };
            (v * 100.0).round() / 100.0
        };
        Self {
            expansion: axis(self.expansion),
            activation: axis(self.activation),
            certainty: axis(self.certainty),
        }
    }
}

/// Conversational strategy chosen for a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectStrategy {
    /// Offer stability and one concrete next step.
    Anchor,
    /// Push back and stress-test.
    Spar,
    /// Slow down, reduce load.
    Ground,
    /// Give energy a direction.
    Channel,
    /// No adjustment.
    None,
}

/// The complement of an [`AffectShape`]: how to meet the user where they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AffectComplement {
    /// Short state label ("contracted/uncertain", ...).
    pub label: &'static str,
    /// Strategy tag.
    pub strategy: AffectStrategy,
    /// Guidance text for the assistant; empty for [`AffectStrategy::None`].
    pub guidance: String,
}

/// Shape plus complement, produced per message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AffectReading {
    /// The detected shape.
    pub shape: AffectShape,
    /// Number of table signals that fired.
    pub signals: usize,
    /// The complement derived from the shape.
    pub complement: AffectComplement,
}

/// (phrase, expansion, activation, certainty)
const SIGNALS: &[(&str, f32, f32, f32)] = &[
    ("stuck", -0.4, -0.3, -0.3),
    ("overwhelmed", -0.3, -0.4, -0.3),
    ("exhausted", -0.2, -0.5, 0.0),
    ("numb", -0.3, -0.5, -0.1),
    ("paralyzed", -0.3, -0.5, -0.3),
    ("frozen", -0.2, -0.5, -0.2),
    ("lost", -0.3, -0.1, -0.4),
    ("confused", 0.0, 0.0, -0.4),
    ("don't know", -0.1, 0.0, -0.4),
    ("not sure", 0.0, 0.0, -0.3),
    ("anxious", -0.2, 0.4, -0.3),
    ("panic", -0.3, 0.5, -0.4),
    ("restless", 0.1, 0.4, -0.2),
    ("can't stop thinking", 0.0, 0.4, -0.3),
    ("angry", 0.1, 0.5, 0.2),
    ("furious", 0.1, 0.6, 0.3),
    ("excited", 0.4, 0.4, 0.1),
    ("curious", 0.4, 0.2, -0.2),
    ("wondering", 0.3, 0.1, -0.2),
    ("what if", 0.3, 0.1, -0.2),
    ("exploring", 0.4, 0.1, -0.1),
    ("confident", 0.3, 0.2, 0.4),
    ("convinced", 0.3, 0.2, 0.5),
    ("definitely", 0.2, 0.1, 0.4),
    ("i know", 0.2, 0.0, 0.4),
    ("decided", 0.3, 0.1, 0.4),
    ("sad", -0.3, -0.3, 0.0),
    ("lonely", -0.4, -0.2, -0.1),
    ("calm", 0.1, -0.2, 0.2),
];

/// Detect the affect shape of a message and derive its complement.
///
/// Every table phrase that is a substring of the lower-cased message adds
/// its shifts. With more than one signal the sum is damped by
/// `1/sqrt(signals)` so stacked keywords cannot saturate an axis.
#[must_use]
pub fn detect_affect(message: &str) -> AffectReading {
    let lowered = message.replace('\u{2019}', "'").to_lowercase();
    let mut raw = AffectShape::default();
    let mut signals = 0_usize;

    for &(phrase, e, a, c) in SIGNALS {
        if lowered.contains(phrase) {
            raw.expansion += e;
            raw.activation += a;
            raw.certainty += c;
            signals += 1;
        }
    }

    if signals > 1 {
        #[allow(clippy::cast_precision_loss)]
        let damp = 1.0 / (signals as f32).sqrt();
        raw.expansion *= damp;
        raw.activation *= damp;
        raw.certainty *= damp;
    }

    let shape = raw.finalize();
    AffectReading {
        shape,
        signals,
        complement: complement_for(&shape),
    }
}

/// Map a shape to its complement. Branches are checked in priority order.
#[must_use]
pub fn complement_for(shape: &AffectShape) -> AffectComplement {
    let AffectShape {
        expansion: e,
        activation: a,
        certainty: c,
    } = *shape;

    let (label, strategy) = if e < -0.3 && c < -0.3 {
        ("contracted/uncertain", AffectStrategy::Anchor)
    } else if e > 0.3 && c > 0.3 {
        ("expanded/certain", AffectStrategy::Spar)
    } else if a < -0.3 {
        ("frozen/flooded", AffectStrategy::Ground)
    } else if a > 0.3 && c < -0.2 {
        ("activated/uncertain", AffectStrategy::Channel)
    } else if e > 0.2 && c < -0.2 {
        ("seeking/uncertain", AffectStrategy::Anchor)
    } else {
        ("neutral", AffectStrategy::None)
    };

    AffectComplement {
        label,
        strategy,
        guidance: guidance_for(label, strategy),
    }
}

fn guidance_for(label: &str, strategy: AffectStrategy) -> String {
    let body = match strategy {
        AffectStrategy::Anchor if label == "seeking/uncertain" => {
            "They are exploring without footing. Reflect back what they already know, \
             then offer one structure to organise the options."
        }
        AffectStrategy::Anchor => {
            "They feel closed in and unsure. Be steady and warm. Name one small, concrete \
             next step instead of a list of options."
        }
        AffectStrategy::Spar => {
            "They are open and confident. Engage as a sparring partner: challenge \
             assumptions and point out what could go wrong."
        }
        AffectStrategy::Ground => {
            "They are low on energy or flooded. Slow down, keep replies short, and \
             reduce the number of decisions asked of them."
        }
        AffectStrategy::Channel => {
            "They have energy but no direction. Help focus it on a single question \
             they can act on now."
        }
        AffectStrategy::None => return String::new(),
    };
    format!("Affect: {label}. {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_message_has_zero_shape() {
        let r = detect_affect("The meeting is on Tuesday.");
        assert_eq!(r.signals, 0);
        assert_eq!(r.shape, AffectShape::default());
        assert_eq!(r.complement.strategy, AffectStrategy::None);
        assert!(r.complement.guidance.is_empty());
    }

    #[test]
    fn single_signal_is_not_damped() {
        let r = detect_affect("I'm so stuck");
        assert_eq!(r.signals, 1);
        assert!((r.shape.expansion + 0.4).abs() < 1e-6);
        assert!((r.shape.activation + 0.3).abs() < 1e-6);
    }

    #[test]
    fn stuck_and_overwhelmed_are_damped() {
        let r = detect_affect("I'm stuck and overwhelmed");
        assert_eq!(r.signals, 2);
        let raw_sum = AffectShape {
            expansion: -0.4 - 0.3,
            activation: -0.3 - 0.4,
            certainty: -0.3 - 0.3,
        };
        assert!(r.shape.magnitude() < raw_sum.magnitude());
        assert!(matches!(
            r.complement.strategy,
            AffectStrategy::Ground | AffectStrategy::Anchor
        ));
        // e = -0.49, c = -0.42 → branch (a)
        assert_eq!(r.complement.strategy, AffectStrategy::Anchor);
    }

    #[test]
    fn expanded_certain_maps_to_spar() {
        let r = detect_affect("I'm excited and convinced this is right, I know it");
        assert_eq!(r.complement.strategy, AffectStrategy::Spar);
    }

    #[test]
    fn low_activation_maps_to_ground() {
        let r = detect_affect("just exhausted");
        assert_eq!(r.complement.strategy, AffectStrategy::Ground);
        assert!(r.complement.guidance.starts_with("Affect: frozen/flooded."));
    }

    #[test]
    fn priority_order_prefers_anchor_over_ground() {
        let shape = AffectShape {
            expansion: -0.5,
            activation: -0.8,
            certainty: -0.5,
        };
        assert_eq!(complement_for(&shape).strategy, AffectStrategy::Anchor);
    }

    #[test]
    fn axes_stay_bounded() {
        let everything: String = SIGNALS.iter().map(|s| s.0).collect::<Vec<_>>().join(" ");
        let r = detect_affect(&everything);
        for v in [r.shape.expansion, r.shape.activation, r.shape.certainty] {
            assert!((-1.0..=1.0).contains(&v));
        }
    }
}
