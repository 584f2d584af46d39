//! Argument sanitization, secret redaction, admission control and sandboxed script
//! execution.

pub mod audit;
pub mod executor;
pub mod limits;
pub mod redact;
pub mod result;
pub mod safe_error;
pub mod sanitize;

pub use audit::{AuditEvent, AuditLogger, AuditRecord};
pub use executor::{ScriptExecutor, build_argv, check_declared_parameters};
pub use limits::{
    AdmissionError, AdmissionPermit, ConcurrencyLimiter, ControllerStats, ExecutionController,
    RateLimitStats, RateLimiter, ResourceLimiter, ResourceLimits,
};
pub use redact::{REDACTED, Redactor, redact};
pub use result::{ErrorKind, ExecutionResult, truncate_output};
pub use safe_error::{SafeErrorFormatter, scrub_sensitive_text};
pub use sanitize::{
    ArgumentViolation, SanitizeError, sanitize_for_logging, sanitize_identifier, sanitize_path,
    sanitize_string, validate_arguments,
};
