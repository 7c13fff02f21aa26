//! Strongly-typed identifiers for cacheable computations.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Name of a query whose results are cached (e.g. `commits`).
///
/// Restricted to ASCII alphanumerics, `_`, `-` and `.` so it can appear
/// verbatim inside store keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueryKind(String);

/// Identifier of the entity results are partitioned by (one repository).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal, $check:expr) => {
        impl $t {
            /// Create a validated identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(CoreError::validation(concat!($name, " must not be empty")));
                }
                let check: fn(&str) -> bool = $check;
                if !check(&value) {
                    return Err(CoreError::validation(format!(
                        "{} contains invalid characters: {:?}",
                        $name, value
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(QueryKind, "query kind", |s| s
    .bytes()
    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')));
impl_string_newtype!(EntityId, "entity id", |s| !s.chars().any(char::is_control));

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl EntityId {
    /// Numeric form of the id, when it is an integer (repository ids usually are).
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

/// Identifier of one registered job (one dispatch of a [`CacheKey`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| CoreError::validation(format!("JobId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Which family of store keys a [`CacheKey`] is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Serialized results.
    Result,
    /// Job tracker records.
    Job,
}

impl KeySpace {
    fn segment(self) -> &'static str {
        match self {
            KeySpace::Result => "result",
            KeySpace::Job => "job",
        }
    }
}

/// One cacheable computation unit: a query kind run for a single entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    query_kind: QueryKind,
    entity_id: EntityId,
}

impl CacheKey {
    pub fn new(query_kind: QueryKind, entity_id: EntityId) -> Self {
        Self {
            query_kind,
            entity_id,
        }
    }

    pub fn query_kind(&self) -> &QueryKind {
        &self.query_kind
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Hex SHA-256 over the length-prefixed query kind and entity id.
    ///
    /// Length prefixes keep `("ab", "c")` and `("a", "bc")` apart.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [self.query_kind.as_str(), self.entity_id.as_str()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Deterministic store key, stable across processes and restarts.
    pub fn storage_key(&self, namespace: &str, space: KeySpace) -> String {
        format!(
            "{}:{}:{}:{}",
            namespace,
            space.segment(),
            self.query_kind,
            self.digest()
        )
    }
}

impl core::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.query_kind, self.entity_id)
    }
}
