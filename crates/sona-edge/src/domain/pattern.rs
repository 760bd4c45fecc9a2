//! Behavioral patterns and their sanitized form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, AdaptResult};

/// Newest context schema this build understands.
pub const CONTEXT_SCHEMA_VERSION: u16 = 1;

/// Category of an observed pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Time-of-day or day-of-week habits.
    Temporal,
    /// Habits tied to a place or situation.
    Contextual,
    /// Interaction style.
    Behavioral,
    /// Explicit or inferred preferences.
    Preference,
}

impl PatternType {
    /// All variants, in feature-encoding order.
    pub const ALL: [PatternType; 4] = [
        PatternType::Temporal,
        PatternType::Contextual,
        PatternType::Behavioral,
        PatternType::Preference,
    ];

    /// Position in the feature one-hot block.
    pub fn index(&self) -> usize {
        match self {
            PatternType::Temporal => 0,
            PatternType::Contextual => 1,
            PatternType::Behavioral => 2,
            PatternType::Preference => 3,
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PatternType::Temporal => "temporal",
            PatternType::Contextual => "contextual",
            PatternType::Behavioral => "behavioral",
            PatternType::Preference => "preference",
        };
        f.write_str(s)
    }
}

/// One facet of the situation a pattern was observed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextFacet {
    /// When it happened.
    Temporal {
        /// Local hour, 0..=23.
        hour_of_day: Option<u8>,
        /// 0 = Monday .. 6 = Sunday.
        day_of_week: Option<u8>,
        /// IANA zone name. Never survives sanitization.
        timezone: Option<String>,
    },
    /// Where it happened.
    Environmental {
        /// Free-form place label. Never survives sanitization.
        location: Option<String>,
        /// Ambient noise level.
        noise_level_db: Option<f64>,
        /// Ambient light level.
        light_level_lux: Option<f64>,
    },
    /// Who was around.
    Social {
        /// Number of other people present.
        companions: Option<u32>,
        /// Contact identifiers. Never survive sanitization.
        #[serde(default)]
        contact_ids: Vec<String>,
    },
    /// Device state.
    Device {
        /// Hardware identifier. Never survives sanitization.
        device_id: Option<String>,
        /// Battery charge, 0..=100.
        battery_pct: Option<f64>,
        /// Whether the device was charging.
        charging: Option<bool>,
    },
}

/// Versioned set of context facets attached to a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternContext {
    /// Schema version of `facets`.
    pub schema_version: u16,
    /// At most one facet of each kind is meaningful; later facets win.
    pub facets: Vec<ContextFacet>,
}

impl Default for PatternContext {
    fn default() -> Self {
        PatternContext { schema_version: CONTEXT_SCHEMA_VERSION, facets: Vec::new() }
    }
}

impl PatternContext {
    /// Context with the given facets at the current schema version.
    pub fn with_facets(facets: Vec<ContextFacet>) -> Self {
        PatternContext { schema_version: CONTEXT_SCHEMA_VERSION, facets }
    }

    /// Hour of day from the temporal facet, if any.
    pub fn hour_of_day(&self) -> Option<u8> {
        self.facets.iter().rev().find_map(|f| match f {
            ContextFacet::Temporal { hour_of_day, .. } => *hour_of_day,
            _ => None,
        })
    }

    /// Day of week from the temporal facet, if any.
    pub fn day_of_week(&self) -> Option<u8> {
        self.facets.iter().rev().find_map(|f| match f {
            ContextFacet::Temporal { day_of_week, .. } => *day_of_week,
            _ => None,
        })
    }

    /// Noise level from the environmental facet, if any.
    pub fn noise_level_db(&self) -> Option<f64> {
        self.facets.iter().rev().find_map(|f| match f {
            ContextFacet::Environmental { noise_level_db, .. } => *noise_level_db,
            _ => None,
        })
    }

    /// Companion count from the social facet, if any.
    pub fn companions(&self) -> Option<u32> {
        self.facets.iter().rev().find_map(|f| match f {
            ContextFacet::Social { companions, .. } => *companions,
            _ => None,
        })
    }

    /// Battery level and charging flag from the device facet, if any.
    pub fn battery(&self) -> Option<(f64, bool)> {
        self.facets.iter().rev().find_map(|f| match f {
            ContextFacet::Device { battery_pct: Some(pct), charging, .. } => {
                Some((*pct, charging.unwrap_or(false)))
            }
            _ => None,
        })
    }
}

/// A pattern produced by the pattern-recognition collaborator.
///
/// Immutable and consumed once per training cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedPattern {
    /// Producer-assigned id.
    pub id: String,
    /// Category.
    pub pattern_type: PatternType,
    /// Confidence in the pattern, in `[0, 1]`.
    pub strength: f64,
    /// Observations per day, `>= 0`.
    pub frequency: f64,
    /// Situation the pattern was observed in.
    pub context: PatternContext,
    /// Most recent observation.
    pub last_observed: DateTime<Utc>,
}

impl IdentifiedPattern {
    /// Convenience constructor with an empty context observed now.
    pub fn new(id: impl Into<String>, pattern_type: PatternType, strength: f64, frequency: f64) -> Self {
        IdentifiedPattern {
            id: id.into(),
            pattern_type,
            strength,
            frequency,
            context: PatternContext::default(),
            last_observed: Utc::now(),
        }
    }

    /// Replace the context.
    pub fn with_context(mut self, context: PatternContext) -> Self {
        self.context = context;
        self
    }

    /// Reject anything the pipeline must not consume.
    pub fn validate(&self) -> AdaptResult<()> {
        if self.id.trim().is_empty() {
            return Err(AdaptError::validation("pattern.id", "must not be empty"));
        }
        if !(self.strength.is_finite() && (0.0..=1.0).contains(&self.strength)) {
            return Err(AdaptError::validation(
                "pattern.strength",
                format!("must be in [0, 1], got {}", self.strength),
            ));
        }
        if !(self.frequency.is_finite() && self.frequency >= 0.0) {
            return Err(AdaptError::validation(
                "pattern.frequency",
                format!("must be finite and >= 0, got {}", self.frequency),
            ));
        }
        if self.context.schema_version > CONTEXT_SCHEMA_VERSION {
            return Err(AdaptError::validation(
                "pattern.context.schema_version",
                format!(
                    "version {} is newer than supported version {}",
                    self.context.schema_version, CONTEXT_SCHEMA_VERSION
                ),
            ));
        }
        for facet in &self.context.facets {
            match facet {
                ContextFacet::Temporal { hour_of_day: Some(h), .. } if *h > 23 => {
                    return Err(AdaptError::validation("pattern.context.hour_of_day", "must be 0..=23"));
                }
                ContextFacet::Temporal { day_of_week: Some(d), .. } if *d > 6 => {
                    return Err(AdaptError::validation("pattern.context.day_of_week", "must be 0..=6"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Validate a whole batch. Empty batches are rejected.
pub fn validate_patterns(patterns: &[IdentifiedPattern]) -> AdaptResult<()> {
    if patterns.is_empty() {
        return Err(AdaptError::validation("patterns", "must contain at least one pattern"));
    }
    patterns.iter().try_for_each(IdentifiedPattern::validate)
}

/// Coarse part of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    /// 05:00 - 11:59
    Morning,
    /// 12:00 - 16:59
    Afternoon,
    /// 17:00 - 21:59
    Evening,
    /// 22:00 - 04:59
    Night,
}

impl TimeBucket {
    /// Bucket for a local hour.
    pub fn from_hour(hour: u8) -> Self {
        match hour {
            5..=11 => TimeBucket::Morning,
            12..=16 => TimeBucket::Afternoon,
            17..=21 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    /// Position in the feature one-hot block.
    pub fn index(&self) -> usize {
        match self {
            TimeBucket::Morning => 0,
            TimeBucket::Afternoon => 1,
            TimeBucket::Evening => 2,
            TimeBucket::Night => 3,
        }
    }
}

/// Non-identifying remainder of a [`PatternContext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SanitizedContext {
    /// Part of the day.
    pub time_bucket: Option<TimeBucket>,
    /// Saturday or Sunday.
    pub is_weekend: Option<bool>,
    /// Ambient noise below 45 dB.
    pub is_quiet: Option<bool>,
    /// No companions present.
    pub is_alone: Option<bool>,
    /// Battery below 20 % and not charging.
    pub low_power: Option<bool>,
}

/// A pattern after differential-privacy sanitization.
///
/// Owned by the trainer for a single call; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedPattern {
    /// Keyed pseudonym of the producer id.
    pub id: String,
    /// Category.
    pub pattern_type: PatternType,
    /// Noised strength, clamped to `[0, 1]`.
    pub strength: f64,
    /// Noised frequency, clamped to `>= 0`.
    pub frequency: f64,
    /// Reduced context.
    pub context: SanitizedContext,
}
