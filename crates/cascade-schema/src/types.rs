//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings for backward compatibility.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
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

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Identifier of a hosted site (a project owning 1..N environments).
    SiteId
);
string_newtype!(
    /// Identifier of one deployable environment instance of a site.
    EnvId
);
string_newtype!(
    /// Identifier of a promotion job.
    JobId
);
string_newtype!(
    /// Identifier of an append-only activity record.
    ActivityId
);
string_newtype!(
    /// Identifier of a sanitization profile.
    ProfileId
);
string_newtype!(
    /// A code revision as reported by the VCS adapter.
    RevisionId
);
string_newtype!(
    /// A database snapshot identifier as reported by the sync adapter.
    SnapshotId
);
string_newtype!(
    /// Token identifying the holder of an environment lock (a job id or a
    /// manual-lock token).
    HolderToken
);

/// Generate a short unique id with the given prefix: `{prefix}-{ts}-{hash8}`.
///
/// The hash component mixes the seed with a monotonic counter so ids minted
/// within the same millisecond never collide.
pub fn generate_id(prefix: &str, seed: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let hash = blake3::hash(format!("{seed}:{n}").as_bytes());
    format!("{prefix}-{ts}-{}", &hash.to_hex()[..8])
}
