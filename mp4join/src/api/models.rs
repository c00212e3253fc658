//! API request and response models (DTOs).
//!
//! These models define the wire shapes of every endpoint. Domain types stay
//! internal; handlers translate them into these structures.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Query parameters for job creation.
///
/// The part count is kept as a raw string so that malformed values are
/// rejected by the handler with the documented error body instead of a
/// generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateJobParams {
    /// Requested number of parts.
    pub parts: Option<String>,
}

/// Response for job creation.
///
/// # Response Format
///
/// ```json
/// {"success": true, "id": "1d6c43e0-96ba-4247-a1ac-2bc44e70a5cd"}
/// ```
///
/// or, when the caller's quota is exhausted:
///
/// ```json
/// {"success": false, "error": "job quota reached, ..."}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct CreateJobResponse {
    /// Whether a job was allocated
    pub success: bool,
    /// Identifier of the new job, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable refusal reason, present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreateJobResponse {
    /// A successful allocation carrying the new job id.
    pub fn created(id: String) -> Self {
        Self {
            success: true,
            id: Some(id),
            error: None,
        }
    }

    /// A refusal carrying a human-readable reason.
    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            id: None,
            error: Some(error.into()),
        }
    }
}

/// Response for a job status poll.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    /// Current derived status of the job
    pub status: JobStatus,
}

/// Response for job destruction.
#[derive(Debug, Clone, Serialize)]
pub struct DestroyJobResponse {
    /// Always true on a 200; failures use the error body instead
    pub success: bool,
}

impl DestroyJobResponse {
    pub fn destroyed() -> Self {
        Self { success: true }
    }
}

/// Response for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Number of jobs currently tracked by the registry
    pub jobs: usize,
    /// Number of download streams currently active
    pub active_streams: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_response_serialization() {
        let ok = serde_json::to_string(&CreateJobResponse::created("abc".to_string())).unwrap();
        assert!(ok.contains("\"success\":true"));
        assert!(ok.contains("\"id\":\"abc\""));
        assert!(!ok.contains("error"));

        let refused = serde_json::to_string(&CreateJobResponse::refused("quota reached")).unwrap();
        assert!(refused.contains("\"success\":false"));
        assert!(refused.contains("quota reached"));
        assert!(!refused.contains("\"id\""));
    }

    #[test]
    fn test_status_response_serialization() {
        let json = serde_json::to_string(&JobStatusResponse {
            status: JobStatus::Rendering,
        })
        .unwrap();
        assert_eq!(json, "{\"status\":\"rendering\"}");
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            uptime_secs: 3600,
            jobs: 2,
            active_streams: 1,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"uptime_secs\":3600"));
        assert!(json.contains("\"jobs\":2"));
    }
}
