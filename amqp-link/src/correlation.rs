//! Correlation-id generation shared by the protocol agents

use uuid::Uuid;

/// Returns a fresh UUID v4 correlation id in its canonical string form
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_canonical() {
        let first = correlation_id();
        let second = correlation_id();
        assert_ne!(first, second);
        assert_eq!(first.len(), 36);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
