//! External collaborator records read by the engine. The client directory
//! is managed outside this service; the engine only validates references
//! and defaults the billing currency from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A client directory entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub tax_id: Option<String>,
    /// Preferred billing currency, used as the document default.
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}
