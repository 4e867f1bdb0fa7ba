//! Identifier generation for sessions, jobs, and request correlation.

use uuid::Uuid;

/// Generates the short, prefixed identifiers used across the core.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        format!("sess-{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn job_id(&self) -> String {
        format!("job-{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn replay_id(&self) -> String {
        format!("replay-{}", Uuid::new_v4().simple())
    }

    /// Opaque correlation id stamped on facade operations for log scraping.
    #[must_use]
    pub fn request_id(&self) -> String {
        format!("req-{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let ids = IdGenerator::new();
        let a = ids.session_id();
        let b = ids.session_id();
        assert!(a.starts_with("sess-"));
        assert_ne!(a, b);
        assert!(ids.job_id().starts_with("job-"));
        assert!(ids.request_id().starts_with("req-"));
    }
}
