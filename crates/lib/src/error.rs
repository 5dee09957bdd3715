//! Error types shared by the service clients and the update pipeline.
//!
//! Clients return [`ServiceError`]; the pipeline wraps it in a [`StageFailure`]
//! tagged with the stage that failed, and [`PipelineError`] separates those from
//! conditions that are explained to the user and are not failures at all.

use std::fmt;

/// Failure talking to an external service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} request failed: {source}")]
    Request {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} api error: {status} {body}")]
    Api {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} returned an unexpected response: {detail}")]
    Malformed {
        service: &'static str,
        detail: String,
    },
    #[error("{service} auth failed: {detail}")]
    Auth {
        service: &'static str,
        detail: String,
    },
}

impl ServiceError {
    pub fn request(service: &'static str, source: reqwest::Error) -> Self {
        Self::Request { service, source }
    }

    pub fn malformed(service: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            service,
            detail: detail.into(),
        }
    }

    pub fn auth(service: &'static str, detail: impl Into<String>) -> Self {
        Self::Auth {
            service,
            detail: detail.into(),
        }
    }

    /// Short class name, used in debug replies.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "RequestError",
            Self::Api { .. } => "ApiError",
            Self::Malformed { .. } => "MalformedResponse",
            Self::Auth { .. } => "AuthError",
        }
    }

    /// Turn a non-success response into [`ServiceError::Api`], or pass it through.
    pub async fn check(
        service: &'static str,
        res: reqwest::Response,
    ) -> Result<reqwest::Response, ServiceError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(Self::Api {
            service,
            status,
            body,
        })
    }
}

/// Named step of the update pipeline. Each has its own timeout; none is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acknowledge,
    Download,
    Ocr,
    Summarize,
    Reply,
    Archive,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acknowledge => "acknowledge",
            Stage::Download => "download",
            Stage::Ocr => "ocr",
            Stage::Summarize => "summarize",
            Stage::Reply => "reply",
            Stage::Archive => "archive",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Service,
}

/// A stage that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },
    #[error("{stage} failed: {source}")]
    Service {
        stage: Stage,
        #[source]
        source: ServiceError,
    },
}

impl StageFailure {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Timeout { stage, .. } | Self::Service { stage, .. } => *stage,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Service { .. } => FailureKind::Service,
        }
    }

    /// Class name of the underlying failure (e.g. `Timeout`, `ApiError`).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "Timeout",
            Self::Service { source, .. } => source.kind_name(),
        }
    }
}

/// A condition explained to the user with a fixed reply; not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserNotice {
    NoImage,
    NoText,
}

/// Why the pipeline stopped before delivering a summary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("user notice: {0:?}")]
    User(UserNotice),
    #[error(transparent)]
    Stage(#[from] StageFailure),
}
