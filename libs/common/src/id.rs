use uuid::Uuid;

/// Generates a new opaque session id (UUID v4, hyphenated).
///
/// # Examples
/// ```
/// let sid = relay_common::id::session_id();
/// assert_eq!(sid.len(), 36);
/// ```
pub fn session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_format() {
        let sid = session_id();
        // UUID v4 in hyphenated form: 8-4-4-4-12.
        assert_eq!(sid.len(), 36);
        assert_eq!(sid.matches('-').count(), 4);
    }

    #[test]
    fn uniqueness() {
        let a = session_id();
        let b = session_id();
        assert_ne!(a, b);
    }
}
