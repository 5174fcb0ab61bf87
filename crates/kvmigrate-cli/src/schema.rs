//! The metadata store schema: its buckets, indexes, and migration list.
//!
//! The registry is append-only. New migrations go at the end of
//! [`compose`]; existing entries are never reordered or removed.

use kvmigrate_core::{
    BackfillConfig, BootstrapMigration, Error, Index, IndexMapping, IndexMigration,
    IndexedValue, MigrationError, MigrationRegistry, Tx,
};
use serde::{Deserialize, Serialize};

/// Bucket holding user resource mappings.
pub const URM_BUCKET: &str = "userresourcemappingsv1";

/// Bucket holding the user resource mapping index.
pub const URM_BY_USER_INDEX_BUCKET: &str = "userresourcemappingsbyuserindexv1";

/// Name of the user resource mapping index.
pub const URM_BY_USER_INDEX: &str = "urm_by_user";

/// Buckets created by the initial migration.
pub const METADATA_BUCKETS: &[&str] = &[
    "authorizationsv1",
    "authorizationindexv1",
    "bucketsv1",
    "bucketindexv1",
    "dashboardsv2",
    "labelsv1",
    "labelindexv1",
    "onboardingv1",
    "organizationsv1",
    "organizationindexv1",
    "sessionsv1",
    "tasksv1",
    URM_BUCKET,
    "usersv1",
    "userindexv1",
    "userspasswordv1",
];

/// Which side of a mapping a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    /// Full control over the resource.
    Owner,
    /// Read access to the resource.
    Member,
}

/// Grants a user access to a resource. Stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResourceMapping {
    /// Resource the user is mapped to.
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    /// Kind of resource, e.g. `buckets` or `orgs`.
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    /// User being mapped.
    #[serde(rename = "userID")]
    pub user_id: String,
    /// Role of the user.
    #[serde(rename = "userType")]
    pub user_type: UserType,
}

impl UserResourceMapping {
    /// Primary key: resource id followed by user id.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.resource_id.len() + self.user_id.len());
        key.extend_from_slice(self.resource_id.as_bytes());
        key.extend_from_slice(self.user_id.as_bytes());
        key
    }

    /// Encode as stored JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode stored JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Index of user resource mappings by user id.
///
/// Entries are keyed by user id and carry the mapped resource id.
pub fn urm_by_user_index() -> Index {
    Index::new(IndexMapping::new(
        URM_BY_USER_INDEX,
        URM_BUCKET,
        URM_BY_USER_INDEX_BUCKET,
        |_, value| {
            let urm = UserResourceMapping::from_json(value)?;
            Ok(Some(IndexedValue::new(urm.user_id, urm.resource_id)))
        },
    ))
}

/// Store a mapping and index it in the same transaction.
pub fn put_mapping(tx: &mut Tx<'_>, urm: &UserResourceMapping) -> Result<(), Error> {
    urm_by_user_index().write_primary(tx, &urm.key(), &urm.to_json()?)
}

/// The ordered migrations building the metadata store.
pub fn compose(backfill: BackfillConfig) -> Result<MigrationRegistry, MigrationError> {
    MigrationRegistry::builder()
        // bucket layout of the first release
        .add(BootstrapMigration::new(
            "initial migration",
            METADATA_BUCKETS.iter().copied(),
        ))
        .add(IndexMigration::new(
            "add index user resource mappings by user id",
            urm_by_user_index(),
            backfill.with_cleanup(true),
        ))
        .build()
}
