//! Per-call federated learning session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{PrivacyConfig, TrainerConfig};
use crate::error::AdaptResult;
use crate::privacy::{user_tag, PrivacyAccountant};

/// Privacy parameters a session was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrivacyParams {
    /// Epsilon consumed by this session.
    pub epsilon: f64,
    /// Budget left for the user after this session.
    pub remaining_budget: f64,
    /// Whether Laplace noise is applied.
    pub noise_enabled: bool,
}

/// Bounded, per-user, per-request learning context.
///
/// Never shared across users or requests; dropped when the call returns.
#[derive(Debug, Clone, Serialize)]
pub struct FederatedSession {
    /// Unique id of this session.
    pub session_id: Uuid,
    #[serde(skip)]
    user_id: String,
    /// Anonymized user tag.
    pub user_tag: String,
    /// When the session was opened.
    pub start_time: DateTime<Utc>,
    /// Base learning rate before strength scaling.
    pub learning_rate: f64,
    /// EWC penalty strength.
    pub regularization_strength: f64,
    /// Epsilon reserved for this session.
    pub privacy_budget: f64,
    /// Full privacy parameters.
    pub privacy_params: PrivacyParams,
}

impl FederatedSession {
    /// Open a session, reserving `session_epsilon` from the user's budget.
    ///
    /// # Errors
    ///
    /// [`AdaptError::PrivacyBudgetExhausted`](crate::error::AdaptError::PrivacyBudgetExhausted)
    /// when the user cannot afford another session.
    pub fn open(
        user_id: &str,
        trainer: &TrainerConfig,
        privacy: &PrivacyConfig,
        accountant: &PrivacyAccountant,
    ) -> AdaptResult<Self> {
        let remaining_budget = accountant.reserve(user_id, privacy.session_epsilon)?;
        let session = FederatedSession {
            session_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            user_tag: user_tag(user_id),
            start_time: Utc::now(),
            learning_rate: trainer.base_learning_rate,
            regularization_strength: trainer.regularization_strength,
            privacy_budget: privacy.session_epsilon,
            privacy_params: PrivacyParams {
                epsilon: privacy.session_epsilon,
                remaining_budget,
                noise_enabled: privacy.noise_enabled,
            },
        };
        tracing::debug!(
            session = %session.session_id,
            user = %session.user_tag,
            epsilon = session.privacy_budget,
            remaining = remaining_budget,
            "Opened federated session"
        );
        Ok(session)
    }

    /// Raw user id, for store keys only.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Milliseconds since the session was opened.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.start_time).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdaptError;

    #[test]
    fn open_reserves_budget() {
        let privacy = PrivacyConfig { session_epsilon: 1.0, total_budget: 1.5, ..Default::default() };
        let acct = PrivacyAccountant::new(privacy.total_budget);
        let s = FederatedSession::open("alice", &TrainerConfig::default(), &privacy, &acct).unwrap();
        assert_eq!(s.privacy_params.remaining_budget, 0.5);
        assert_eq!(s.user_id(), "alice");

        let err = FederatedSession::open("alice", &TrainerConfig::default(), &privacy, &acct).unwrap_err();
        assert!(matches!(err, AdaptError::PrivacyBudgetExhausted { .. }));
    }

    #[test]
    fn serialized_session_hides_raw_id() {
        let privacy = PrivacyConfig::default();
        let acct = PrivacyAccountant::new(privacy.total_budget);
        let s = FederatedSession::open("alice@example.com", &TrainerConfig::default(), &privacy, &acct).unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("alice@example.com"));
        assert!(json.contains(&s.user_tag));
    }
}
