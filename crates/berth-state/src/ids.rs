//! Typed identifiers for every persisted record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map($name)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                $name(id)
            }
        }
    };
}

record_id!(
    /// Identifies a [`crate::Project`].
    ProjectId
);
record_id!(
    /// Identifies an [`crate::Environment`].
    EnvironmentId
);
record_id!(
    /// Identifies a [`crate::Feature`] (one observed commit).
    FeatureId
);
record_id!(UserId);
record_id!(
    /// Identifies a catalog [`crate::Extension`].
    ExtensionId
);
record_id!(
    /// Identifies one installation of an extension into a project/environment.
    ProjectExtensionId
);
record_id!(
    /// Identifies a [`crate::Release`].
    ReleaseId
);
record_id!(
    /// Identifies one unit of release work.
    ReleaseExtensionId
);
record_id!(SecretId);
record_id!(SecretValueId);
record_id!(ServiceId);
record_id!(ServiceSpecId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = ReleaseId::new();
        let parsed: ReleaseId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_as_plain_uuid_strings() {
        let id = ProjectId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn invalid_id_is_rejected() {
        assert!("not-a-uuid".parse::<FeatureId>().is_err());
    }
}
