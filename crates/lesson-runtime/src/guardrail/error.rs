//! Guardrail violations raised to activity code.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardrailViolation {
    #[error("tag not allowed: <{tag}>")]
    TagNotAllowed { tag: String },

    #[error("element is outside the activity container")]
    OutsideContainer,

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("network access to {host} is not allowed")]
    DomainNotAllowed { host: String },

    #[error("network quota exceeded: {limit} call(s) allowed")]
    QuotaExceeded { limit: u32 },

    #[error("event rate exceeded for {event_type}: {limit} per {window_ms}ms")]
    EventRateExceeded {
        event_type: String,
        limit: u32,
        window_ms: u64,
    },

    #[error("resource overuse: {resource} at {observed} (threshold {threshold})")]
    ResourceOveruse {
        resource: String,
        observed: u64,
        threshold: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_descriptive() {
        let err = GuardrailViolation::TagNotAllowed {
            tag: "script".into(),
        };
        assert_eq!(err.to_string(), "tag not allowed: <script>");

        let err = GuardrailViolation::QuotaExceeded { limit: 3 };
        assert!(err.to_string().contains("3 call(s)"));
    }
}
