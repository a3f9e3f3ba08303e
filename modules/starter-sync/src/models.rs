use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Notification kind stored for leader assignments
pub const LEADER_ASSIGNMENT_KIND: &str = "leader-assignment";

/// A starter as held by the system of record, keyed by `domain` (e.g. "alice")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Starter {
    pub domain: String,
    pub name: String,
    pub email: String,
    pub department: String,
    pub title: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

/// Search index document for a starter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarterDocument {
    pub domain: String,
    pub name: String,
    pub email: String,
    pub department: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl StarterDocument {
    /// Document id in the index
    pub fn id(&self) -> &str {
        &self.domain
    }
}

impl From<&Starter> for StarterDocument {
    fn from(starter: &Starter) -> Self {
        Self {
            domain: starter.domain.clone(),
            name: starter.name.clone(),
            email: starter.email.clone(),
            department: starter.department.clone(),
            title: starter.title.clone(),
            start_date: starter.start_date,
            updated_at: starter.updated_at,
        }
    }
}

/// Payload of a `notification-leader-assignment` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAssignmentNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub department: String,
    pub leader_domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl LeaderAssignmentNotification {
    pub fn new(department: impl Into<String>, leader_domain: impl Into<String>) -> Self {
        Self {
            id: None,
            department: department.into(),
            leader_domain: leader_domain.into(),
            assigned_by: None,
            message: None,
            created_at: None,
        }
    }

    /// Resolve defaults into the stored record.
    ///
    /// `created_at` falls back to `event_time`, then to now. A missing id is
    /// derived from the department, leader and creation time, so redelivering
    /// the same event yields the same id.
    pub fn into_notification(self, event_time: Option<DateTime<Utc>>) -> Notification {
        let created_at = self.created_at.or(event_time).unwrap_or_else(Utc::now);
        let id = self.id.unwrap_or_else(|| {
            let name = format!(
                "{}:{}:{}:{}",
                LEADER_ASSIGNMENT_KIND,
                self.department,
                self.leader_domain,
                created_at.to_rfc3339()
            );
            Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        });
        let message = self.message.unwrap_or_else(|| {
            format!("You have been assigned as leader of {}", self.department)
        });

        Notification {
            id,
            kind: LEADER_ASSIGNMENT_KIND.to_string(),
            recipient: self.leader_domain,
            department: self.department,
            message,
            assigned_by: self.assigned_by,
            created_at,
        }
    }
}

/// A persisted notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub kind: String,
    pub recipient: String,
    pub department: String,
    pub message: String,
    pub assigned_by: Option<String>,
    pub created_at: DateTime<Utc>,
}
