//! Upload job identity, status values and the response codes they surface as.

use serde::Serialize;
use std::fmt;

const JOB_ID_PREFIX: &str = "photo_";

/// Identifier of one upload job, `photo_<id>`.
///
/// The id is derived from the photo row id, which makes it the join key
/// between the durable row, the status store and bus payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Job id for the given photo row
    pub fn for_photo(photo_id: i64) -> Self {
        Self(format!("{JOB_ID_PREFIX}{photo_id}"))
    }

    /// Wrap a caller-supplied id, e.g. one received from a status poll
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Photo id encoded in this job id, if it is well-formed
    pub fn photo_id(&self) -> Option<i64> {
        self.0.strip_prefix(JOB_ID_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of an upload job as recorded in the status store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    /// No status recorded for the job
    NotFound,
    /// Transfer failed and the photo row was deleted
    Failed,
    /// Transfer finished and the photo row carries its URL
    Succeeded,
    /// Transfer started and not yet reconciled
    InProgress,
}

impl UploadStatus {
    /// Integer stored under the job key. `NotFound` is never written and only
    /// exists on the client side.
    pub fn code(self) -> i64 {
        match self {
            UploadStatus::NotFound => -2,
            UploadStatus::Failed => -1,
            UploadStatus::Succeeded => 0,
            UploadStatus::InProgress => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -2 => Some(UploadStatus::NotFound),
            -1 => Some(UploadStatus::Failed),
            0 => Some(UploadStatus::Succeeded),
            1 => Some(UploadStatus::InProgress),
            _ => None,
        }
    }

    /// Whether reconciliation has finished for the job
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Failed | UploadStatus::Succeeded)
    }

    /// Response code a status poll reports for this status
    pub fn response_code(self) -> ResponseCode {
        match self {
            UploadStatus::NotFound => ResponseCode::PhotoNotExist,
            UploadStatus::Failed => ResponseCode::PhotoUploadError,
            UploadStatus::Succeeded => ResponseCode::PhotoUploadSuccess,
            UploadStatus::InProgress => ResponseCode::PhotoAddInProcess,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::NotFound => "NOT_FOUND",
            UploadStatus::Failed => "FAILED",
            UploadStatus::Succeeded => "SUCCEEDED",
            UploadStatus::InProgress => "IN_PROGRESS",
        };
        f.write_str(name)
    }
}

/// Response codes of the photo upload surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    PhotoAlreadyExist,
    PhotoAddInProcess,
    PhotoUploadSuccess,
    PhotoUploadError,
    PhotoNotExist,
    InternalServerError,
}

impl ResponseCode {
    pub fn code(self) -> u16 {
        match self {
            ResponseCode::PhotoAlreadyExist => 4001,
            ResponseCode::PhotoAddInProcess => 4002,
            ResponseCode::PhotoUploadSuccess => 4003,
            ResponseCode::PhotoUploadError => 4004,
            ResponseCode::PhotoNotExist => 4005,
            ResponseCode::InternalServerError => 5001,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ResponseCode::PhotoAlreadyExist => "Photo already exists.",
            ResponseCode::PhotoAddInProcess => "Adding photo is in process.",
            ResponseCode::PhotoUploadSuccess => "Photo upload success.",
            ResponseCode::PhotoUploadError => "Photo upload error.",
            ResponseCode::PhotoNotExist => "Photo does not exist.",
            ResponseCode::InternalServerError => "Internal server error.",
        }
    }
}

/// `{code, data, msg}` envelope returned to API clients
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub data: T,
    pub msg: &'static str,
}

impl<T> ApiResponse<T> {
    pub fn new(code: ResponseCode, data: T) -> Self {
        Self {
            code: code.code(),
            data,
            msg: code.message(),
        }
    }
}

/// Data of a status poll response
#[derive(Debug, Clone, Serialize)]
pub struct StatusPollData {
    pub upload_id: JobId,
}

/// Build the status poll envelope for a job
pub fn status_response(job_id: JobId, status: UploadStatus) -> ApiResponse<StatusPollData> {
    ApiResponse::new(status.response_code(), StatusPollData { upload_id: job_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_format() {
        let job_id = JobId::for_photo(42);
        assert_eq!(job_id.as_str(), "photo_42");
        assert_eq!(job_id.photo_id(), Some(42));
    }

    #[test]
    fn test_job_id_rejects_foreign_keys() {
        assert_eq!(JobId::from_raw("LOGIN_alice").photo_id(), None);
        assert_eq!(JobId::from_raw("photo_abc").photo_id(), None);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(UploadStatus::Failed.code(), -1);
        assert_eq!(UploadStatus::Succeeded.code(), 0);
        assert_eq!(UploadStatus::InProgress.code(), 1);
        assert_eq!(UploadStatus::from_code(1), Some(UploadStatus::InProgress));
        assert_eq!(UploadStatus::from_code(7), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Succeeded.is_terminal());
        assert!(!UploadStatus::InProgress.is_terminal());
        assert!(!UploadStatus::NotFound.is_terminal());
    }

    #[test]
    fn test_status_poll_response() {
        let response = status_response(JobId::for_photo(7), UploadStatus::Failed);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["code"], 4004);
        assert_eq!(json["data"]["upload_id"], "photo_7");
        assert_eq!(json["msg"], "Photo upload error.");
    }

    #[test]
    fn test_each_status_has_distinct_code() {
        let codes: std::collections::HashSet<u16> = [
            UploadStatus::NotFound,
            UploadStatus::Failed,
            UploadStatus::Succeeded,
            UploadStatus::InProgress,
        ]
        .iter()
        .map(|s| s.response_code().code())
        .collect();

        assert_eq!(codes.len(), 4);
    }
}
