//! Domain primitive types used across the Berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrowed raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Runtime-assigned identifier of a container.
    ContainerId
}

string_id! {
    /// Caller-supplied identifier of a run, carried on its containers as a label.
    RunId
}

string_id! {
    /// Identifier of a built image (`sha256:...`).
    ImageId
}

impl RunId {
    /// Generates a random run ID.
    pub fn generate() -> Self {
        Self(format!("berth-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Result of pushing one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDigest {
    /// Tag as reported by the daemon.
    pub tag: String,
    /// Content digest of the pushed manifest.
    pub digest: String,
    /// Manifest size in bytes.
    pub size: u64,
}
