//! Member and check-in records read from the membership store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enrollment status, derived from the cancellation timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrollmentStatus {
    Active,
    Cancelled,
}

impl EnrollmentStatus {
    /// Training label: cancelled members are the positive ("will churn") class
    pub fn churn_label(&self) -> u8 {
        match self {
            EnrollmentStatus::Active => 0,
            EnrollmentStatus::Cancelled => 1,
        }
    }
}

/// A gym member as seen by the pipeline.
///
/// Owned by the CRUD layer; the pipeline only ever writes `risk_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Member identifier (`aluno_id` on the wire)
    pub id: i64,

    /// Display name, used by reports
    pub name: String,

    /// Enrollment timestamp
    pub enrolled_at: Option<DateTime<Utc>>,

    /// Cancellation timestamp, set only for cancelled members
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Current plan price
    pub plan_price: Option<f64>,

    /// Current churn risk score (0.0 - 1.0)
    pub risk_score: f64,
}

impl Member {
    /// Create an active member enrolled at the given time
    pub fn new(id: i64, name: impl Into<String>, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            enrolled_at: Some(enrolled_at),
            cancelled_at: None,
            plan_price: None,
            risk_score: 0.0,
        }
    }

    /// Set the plan price
    pub fn with_plan_price(mut self, price: f64) -> Self {
        self.plan_price = Some(price);
        self
    }

    /// Mark the member as cancelled at the given time
    pub fn cancelled(mut self, at: DateTime<Utc>) -> Self {
        self.cancelled_at = Some(at);
        self
    }

    /// Enrollment status. A cancellation timestamp is the only source of truth,
    /// so "cancelled iff cancellation date set" always holds.
    pub fn status(&self) -> EnrollmentStatus {
        if self.cancelled_at.is_some() {
            EnrollmentStatus::Cancelled
        } else {
            EnrollmentStatus::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == EnrollmentStatus::Active
    }
}

/// A recorded attendance event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinEvent {
    pub member_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl CheckinEvent {
    pub fn new(member_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            member_id,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_follows_cancellation_date() {
        let now = Utc::now();
        let member = Member::new(1, "Ana", now - Duration::days(90));
        assert_eq!(member.status(), EnrollmentStatus::Active);
        assert_eq!(member.status().churn_label(), 0);

        let member = member.cancelled(now);
        assert_eq!(member.status(), EnrollmentStatus::Cancelled);
        assert_eq!(member.status().churn_label(), 1);
        assert!(!member.is_active());
    }
}
