//! Content references.
//!
//! Content records (saga templates, triggers, characters, items) are addressed
//! by their reference name. Each kind of reference gets its own newtype so a
//! trigger name can never be passed where an item name is expected.

use serde::{Deserialize, Serialize};

macro_rules! content_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a reference from its name.
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            /// Returns the reference name.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

content_ref!(
    /// Reference to a saga template.
    SagaRef
);

content_ref!(
    /// Reference to a trigger declared by a saga template.
    TriggerRef
);

content_ref!(
    /// Reference to a character content record.
    CharacterRef
);

content_ref!(
    /// Reference to an item content record.
    ItemRef
);

content_ref!(
    /// Reference to a quest content record.
    QuestRef
);

content_ref!(
    /// Reference to a dialogue content record.
    DialogueRef
);
