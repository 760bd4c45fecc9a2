//! Differential-privacy sanitization of behavioral patterns.
//!
//! Raw [`IdentifiedPattern`]s never reach a model. The sanitizer adds Laplace
//! noise to strength and frequency, clamps them back to their valid ranges and
//! reduces the context to coarse, non-identifying flags. It also owns the
//! anonymization policy applied to every log line and event that mentions a
//! user, and the per-user epsilon ledger.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::config::PrivacyConfig;
use crate::domain::{IdentifiedPattern, PatternContext, SanitizedContext, SanitizedPattern, TimeBucket};
use crate::error::{AdaptError, AdaptResult};

const QUIET_THRESHOLD_DB: f64 = 45.0;
const LOW_BATTERY_PCT: f64 = 20.0;

/// Stable pseudonym for a user id, safe to log.
pub fn user_tag(user_id: &str) -> String {
    format!("u-{}", digest_prefix(&[b"sona-edge/user\0", user_id.as_bytes()]))
}

fn digest_prefix(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Laplace sample via inverse CDF: `-b * sign(u) * ln(1 - 2|u|)`, `u ~ U(-0.5, 0.5)`.
fn laplace(rng: &mut StdRng, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    let u: f64 = rng.gen::<f64>() - 0.5;
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// Output of one sanitization pass.
#[derive(Debug, Clone)]
pub struct SanitizedBatch {
    /// Sanitized patterns, in input order.
    pub patterns: Vec<SanitizedPattern>,
    /// Laplace scale applied to strength.
    pub strength_scale: f64,
    /// Laplace scale applied to frequency.
    pub frequency_scale: f64,
    /// Epsilon the batch was sanitized under.
    pub epsilon: f64,
}

/// Differential-privacy sanitizer.
pub struct DifferentialPrivacySanitizer {
    config: PrivacyConfig,
    rng: Mutex<StdRng>,
}

impl DifferentialPrivacySanitizer {
    /// Create a sanitizer. Seeds from config when given, OS entropy otherwise.
    pub fn new(config: PrivacyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng: Mutex::new(rng) }
    }

    /// Sanitize a batch under `epsilon`.
    ///
    /// Strength scale is `max_strength / epsilon`. Frequency uses the strength
    /// scale times `frequency_noise_ratio`, so it never exceeds the strength
    /// scale. Never fails: heavy noise is an accepted privacy/quality trade-off.
    pub fn sanitize(&self, patterns: &[IdentifiedPattern], user_id: &str, epsilon: f64) -> SanitizedBatch {
        let sensitivity = patterns.iter().map(|p| p.strength).fold(0.0_f64, f64::max);

        let (strength_scale, frequency_scale) = if self.config.noise_enabled && epsilon > 0.0 {
            let s = sensitivity / epsilon;
            (s, s * self.config.frequency_noise_ratio)
        } else {
            (0.0, 0.0)
        };

        let mut rng = self.rng.lock();
        let sanitized = patterns
            .iter()
            .map(|p| SanitizedPattern {
                id: format!("p-{}", digest_prefix(&[user_id.as_bytes(), b"\0", p.id.as_bytes()])),
                pattern_type: p.pattern_type,
                strength: (p.strength + laplace(&mut rng, strength_scale)).clamp(0.0, 1.0),
                frequency: (p.frequency + laplace(&mut rng, frequency_scale)).max(0.0),
                context: reduce_context(&p.context),
            })
            .collect();

        tracing::debug!(
            user = %user_tag(user_id),
            patterns = patterns.len(),
            strength_scale,
            frequency_scale,
            epsilon,
            "Sanitized pattern batch"
        );

        SanitizedBatch { patterns: sanitized, strength_scale, frequency_scale, epsilon }
    }

    /// Stable pseudonym for `user_id`.
    pub fn user_tag(&self, user_id: &str) -> String {
        user_tag(user_id)
    }

    /// Replace whole-token occurrences of the raw user id in `text` with its
    /// tag. A match glued to a letter, digit or `_` is part of another word
    /// and is left alone.
    pub fn scrub(&self, text: &str, user_id: &str) -> String {
        if user_id.is_empty() {
            return text.to_string();
        }
        let tag = user_tag(user_id);
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, _) in text.match_indices(user_id) {
            let end = start + user_id.len();
            if is_word_char(text[..start].chars().next_back()) || is_word_char(text[end..].chars().next()) {
                continue;
            }
            out.push_str(&text[last..start]);
            out.push_str(&tag);
            last = end;
        }
        out.push_str(&text[last..]);
        out
    }

    /// Active configuration.
    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }
}

/// Keep only coarse flags; location, time zone, device and contact ids are dropped.
pub fn reduce_context(context: &PatternContext) -> SanitizedContext {
    SanitizedContext {
        time_bucket: context.hour_of_day().map(TimeBucket::from_hour),
        is_weekend: context.day_of_week().map(|d| d >= 5),
        is_quiet: context.noise_level_db().map(|db| db < QUIET_THRESHOLD_DB),
        is_alone: context.companions().map(|c| c == 0),
        low_power: context.battery().map(|(pct, charging)| pct < LOW_BATTERY_PCT && !charging),
    }
}

// ---------------------------------------------------------------------------
// PrivacyAccountant
// ---------------------------------------------------------------------------

/// Per-user epsilon ledger. Spending is monotonic; nothing is ever refunded.
pub struct PrivacyAccountant {
    total_budget: f64,
    spent: DashMap<String, f64>,
}

impl PrivacyAccountant {
    /// Create a ledger with a lifetime budget per user.
    pub fn new(total_budget: f64) -> Self {
        Self { total_budget, spent: DashMap::new() }
    }

    /// Reserve `epsilon` for one session, returning what is left afterwards.
    ///
    /// # Errors
    ///
    /// [`AdaptError::PrivacyBudgetExhausted`] when the reservation would
    /// exceed the budget. Nothing is spent in that case.
    pub fn reserve(&self, user_id: &str, epsilon: f64) -> AdaptResult<f64> {
        let mut spent = self.spent.entry(user_id.to_string()).or_insert(0.0);
        if *spent + epsilon > self.total_budget + 1e-12 {
            return Err(AdaptError::PrivacyBudgetExhausted {
                user_tag: user_tag(user_id),
                spent: *spent,
                budget: self.total_budget,
            });
        }
        *spent += epsilon;
        Ok(self.total_budget - *spent)
    }

    /// Epsilon spent so far.
    pub fn spent(&self, user_id: &str) -> f64 {
        self.spent.get(user_id).map(|s| *s).unwrap_or(0.0)
    }

    /// Epsilon still available.
    pub fn remaining(&self, user_id: &str) -> f64 {
        (self.total_budget - self.spent(user_id)).max(0.0)
    }

    /// Lifetime budget per user.
    pub fn total_budget(&self) -> f64 {
        self.total_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextFacet, PatternType};
    use proptest::prelude::*;

    fn rich_pattern(strength: f64, frequency: f64) -> IdentifiedPattern {
        IdentifiedPattern::new("walk-after-lunch", PatternType::Temporal, strength, frequency).with_context(
            PatternContext::with_facets(vec![
                ContextFacet::Temporal { hour_of_day: Some(13), day_of_week: Some(6), timezone: Some("Europe/Oslo".into()) },
                ContextFacet::Environmental { location: Some("home".into()), noise_level_db: Some(30.0), light_level_lux: None },
                ContextFacet::Social { companions: Some(0), contact_ids: vec!["alice".into()] },
                ContextFacet::Device { device_id: Some("dev-123".into()), battery_pct: Some(10.0), charging: Some(false) },
            ]),
        )
    }

    fn seeded(noise: bool) -> DifferentialPrivacySanitizer {
        DifferentialPrivacySanitizer::new(PrivacyConfig { noise_enabled: noise, seed: Some(11), ..Default::default() })
    }

    #[test]
    fn noise_disabled_is_idempotent() {
        let s = seeded(false);
        let input = vec![rich_pattern(0.7, 2.0)];
        let a = s.sanitize(&input, "user-1", 1.0);
        let b = s.sanitize(&input, "user-1", 1.0);
        assert_eq!(a.patterns, b.patterns);
        assert_eq!(a.patterns[0].strength, 0.7);
        assert_eq!(a.patterns[0].frequency, 2.0);
    }

    #[test]
    fn context_is_reduced_to_flags() {
        let out = seeded(false).sanitize(&[rich_pattern(0.5, 1.0)], "user-1", 1.0);
        let ctx = out.patterns[0].context;
        assert_eq!(ctx.time_bucket, Some(TimeBucket::Afternoon));
        assert_eq!(ctx.is_weekend, Some(true));
        assert_eq!(ctx.is_quiet, Some(true));
        assert_eq!(ctx.is_alone, Some(true));
        assert_eq!(ctx.low_power, Some(true));

        let json = serde_json::to_string(&out.patterns[0]).unwrap();
        for secret in ["home", "Europe/Oslo", "alice", "dev-123", "walk-after-lunch", "user-1"] {
            assert!(!json.contains(secret), "{secret} leaked into sanitized pattern");
        }
    }

    #[test]
    fn noise_scale_follows_sensitivity_over_epsilon() {
        let s = seeded(true);
        let out = s.sanitize(&[rich_pattern(0.8, 1.0), rich_pattern(0.4, 1.0)], "u", 2.0);
        assert!((out.strength_scale - 0.4).abs() < 1e-12);
        assert!((out.frequency_scale - 0.04).abs() < 1e-12);
    }

    #[test]
    fn zero_sensitivity_adds_no_noise() {
        let out = seeded(true).sanitize(&[rich_pattern(0.0, 3.0)], "u", 1.0);
        assert_eq!(out.patterns[0].strength, 0.0);
        assert_eq!(out.patterns[0].frequency, 3.0);
    }

    #[test]
    fn scrub_replaces_raw_id() {
        let s = seeded(false);
        let text = s.scrub("training failed for alice@example.com twice", "alice@example.com");
        assert!(!text.contains("alice@example.com"));
        assert!(text.contains(&user_tag("alice@example.com")));
    }

    #[test]
    fn scrub_leaves_words_containing_short_id() {
        let s = seeded(false);
        let tag = user_tag("u");
        let text = s.scrub("user u failed: u", "u");
        assert_eq!(text, format!("user {tag} failed: {tag}"));
        assert_eq!(s.scrub("queue busy", "u"), "queue busy");
    }

    #[test]
    fn frequency_noise_capped_for_high_frequency_batch() {
        let out = seeded(true).sanitize(&[rich_pattern(0.8, 100.0)], "u", 1.0);
        assert!((out.strength_scale - 0.8).abs() < 1e-12);
        assert!((out.frequency_scale - 0.08).abs() < 1e-12);
    }

    #[test]
    fn user_tag_is_stable_and_distinct() {
        assert_eq!(user_tag("a"), user_tag("a"));
        assert_ne!(user_tag("a"), user_tag("b"));
        assert!(user_tag("a").starts_with("u-"));
    }

    #[test]
    fn accountant_refuses_when_exhausted() {
        let acct = PrivacyAccountant::new(2.0);
        assert_eq!(acct.reserve("u", 1.0).unwrap(), 1.0);
        assert_eq!(acct.reserve("u", 1.0).unwrap(), 0.0);
        let err = acct.reserve("u", 1.0).unwrap_err();
        assert!(matches!(err, AdaptError::PrivacyBudgetExhausted { .. }));
        assert_eq!(acct.spent("u"), 2.0);
        assert_eq!(acct.remaining("other"), 2.0);
    }

    proptest! {
        #[test]
        fn prop_sanitized_values_stay_in_range(
            strength in 0.0f64..=1.0,
            frequency in 0.0f64..1000.0,
            epsilon in 0.01f64..10.0,
            seed in any::<u64>(),
        ) {
            let s = DifferentialPrivacySanitizer::new(PrivacyConfig { seed: Some(seed), ..Default::default() });
            let out = s.sanitize(&[rich_pattern(strength, frequency)], "u", epsilon);
            let p = &out.patterns[0];
            prop_assert!((0.0..=1.0).contains(&p.strength));
            prop_assert!(p.frequency >= 0.0);
            prop_assert!(p.frequency.is_finite());
        }

        #[test]
        fn prop_frequency_scale_never_exceeds_strength_scale(
            strength in 0.0f64..=1.0,
            frequency in 0.0f64..1000.0,
            epsilon in 0.01f64..10.0,
            ratio in 0.0f64..=1.0,
        ) {
            let s = DifferentialPrivacySanitizer::new(PrivacyConfig {
                frequency_noise_ratio: ratio,
                seed: Some(3),
                ..Default::default()
            });
            let out = s.sanitize(&[rich_pattern(strength, frequency), rich_pattern(0.1, 1.0)], "u", epsilon);
            prop_assert!(out.frequency_scale <= out.strength_scale);
        }
    }
}
