//! Run identifier type.

use std::fmt::{self, Display, Formatter};

use uuid::Uuid;

/// Unique identifier for one snippet execution, recorded on its tracing span.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a random run identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct_hyphenated_uuids() {
        let first = RunId::random();
        let second = RunId::random();
        assert_ne!(first, second);

        let text = first.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.matches('-').count(), 4);
    }
}
