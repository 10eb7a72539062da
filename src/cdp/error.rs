use std::fmt;

/// Optional context carried alongside a [`CdpError`]: the session, target,
/// and method involved, plus a timeout duration where relevant.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ErrorContext {
    pub session_id: Option<String>,
    pub target_id: Option<String>,
    pub method: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl ErrorContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.target_id.is_none()
            && self.method.is_none()
            && self.timeout_ms.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if let Some(s) = &self.session_id {
            parts.push(format!("session={s}"));
        }
        if let Some(t) = &self.target_id {
            parts.push(format!("target={t}"));
        }
        if let Some(m) = &self.method {
            parts.push(format!("method={m}"));
        }
        if let Some(t) = self.timeout_ms {
            parts.push(format!("timeout={t}ms"));
        }
        write!(f, " ({})", parts.join(", "))
    }
}

/// The closed set of error kinds produced at CDP component boundaries.
///
/// `retryable()` is the single source of truth the retry wrapper consults:
/// only `Connection` and `Timeout` are retryable, everything else
/// propagates immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum CdpError {
    /// The WebSocket could not be established, or was lost.
    Connection { detail: String, context: ErrorContext },
    /// A request did not receive a reply within its deadline.
    Timeout { context: ErrorContext },
    /// Chrome returned a CDP error object for a request.
    Protocol {
        code: i64,
        message: String,
        context: ErrorContext,
    },
    /// A session was missing or already disconnected.
    Session { detail: String, context: ErrorContext },
    /// A target was missing.
    Target { detail: String, context: ErrorContext },
    /// The caller violated a precondition (bad argument, unknown index, ...).
    Argument { detail: String, context: ErrorContext },
}

impl CdpError {
    #[must_use]
    pub fn connection(detail: impl Into<String>) -> Self {
        Self::Connection {
            detail: detail.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout {
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn session(detail: impl Into<String>) -> Self {
        Self::Session {
            detail: detail.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn target(detail: impl Into<String>) -> Self {
        Self::Target {
            detail: detail.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn argument(detail: impl Into<String>) -> Self {
        Self::Argument {
            detail: detail.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach context, replacing whatever the variant already carries.
    #[must_use]
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Self::Connection { context, .. }
            | Self::Timeout { context }
            | Self::Protocol { context, .. }
            | Self::Session { context, .. }
            | Self::Target { context, .. }
            | Self::Argument { context, .. } => *context = ctx,
        }
        self
    }

    /// Per spec §4.1: a kind is retryable iff it is `Connection` or `Timeout`.
    /// The retry wrapper in the transport consults only this classification.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Connection { context, .. }
            | Self::Timeout { context }
            | Self::Protocol { context, .. }
            | Self::Session { context, .. }
            | Self::Target { context, .. }
            | Self::Argument { context, .. } => context,
        }
    }
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { detail, context } => {
                write!(f, "CDP connection error: {detail}{context}")
            }
            Self::Timeout { context } => write!(f, "CDP command timed out{context}"),
            Self::Protocol {
                code,
                message,
                context,
            } => write!(f, "CDP protocol error ({code}): {message}{context}"),
            Self::Session { detail, context } => write!(f, "CDP session error: {detail}{context}"),
            Self::Target { detail, context } => write!(f, "CDP target error: {detail}{context}"),
            Self::Argument { detail, context } => {
                write!(f, "CDP argument error: {detail}{context}")
            }
        }
    }
}

impl std::error::Error for CdpError {}

impl From<CdpError> for crate::error::AppError {
    fn from(e: CdpError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            CdpError::Connection { .. } => ExitCode::ConnectionError,
            CdpError::Timeout { .. } => ExitCode::TimeoutError,
            CdpError::Protocol { .. } => ExitCode::ProtocolError,
            CdpError::Session { .. } | CdpError::Target { .. } => ExitCode::TargetError,
            CdpError::Argument { .. } => ExitCode::GeneralError,
        };
        Self {
            message: e.to_string(),
            code,
            custom_json: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connection() {
        let err = CdpError::connection("refused");
        assert_eq!(err.to_string(), "CDP connection error: refused");
    }

    #[test]
    fn display_timeout_with_context() {
        let err = CdpError::timeout().with_context(
            ErrorContext::new()
                .with_session("S1")
                .with_method("Page.navigate")
                .with_timeout_ms(15_000),
        );
        assert_eq!(
            err.to_string(),
            "CDP command timed out (session=S1, method=Page.navigate, timeout=15000ms)"
        );
    }

    #[test]
    fn display_protocol() {
        let err = CdpError::protocol(-32000, "Not found");
        assert_eq!(err.to_string(), "CDP protocol error (-32000): Not found");
    }

    #[test]
    fn retryable_classification() {
        assert!(CdpError::connection("x").retryable());
        assert!(CdpError::timeout().retryable());
        assert!(!CdpError::protocol(-1, "x").retryable());
        assert!(!CdpError::session("x").retryable());
        assert!(!CdpError::target("x").retryable());
        assert!(!CdpError::argument("x").retryable());
    }

    #[test]
    fn empty_context_adds_nothing() {
        let err = CdpError::connection("refused");
        assert_eq!(err.to_string(), "CDP connection error: refused");
    }

    #[test]
    fn app_error_classification() {
        use crate::error::{AppError, ExitCode};
        let app: AppError = CdpError::timeout().into();
        assert_eq!(app.code, ExitCode::TimeoutError);
        let app: AppError = CdpError::argument("bad index").into();
        assert_eq!(app.code, ExitCode::GeneralError);
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: &dyn std::error::Error = &CdpError::timeout();
        assert!(err.source().is_none());
    }
}
