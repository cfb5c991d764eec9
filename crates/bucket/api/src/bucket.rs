use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, CustomResource)]
#[kube(
    group = "bucket.ulagbulag.io",
    version = "v1",
    kind = "Bucket",
    root = "BucketCrd",
    namespaced,
    shortname = "bkt",
    printcolumn = r#"{
        "name": "bucket",
        "type": "string",
        "description": "remote bucket name",
        "jsonPath": ".spec.bucketName"
    }"#,
    printcolumn = r#"{
        "name": "region",
        "type": "string",
        "description": "remote bucket region",
        "jsonPath": ".spec.region"
    }"#,
    printcolumn = r#"{
        "name": "force-delete",
        "type": "boolean",
        "description": "whether the remote bucket is purged on deletion",
        "jsonPath": ".spec.forceDelete"
    }"#,
    printcolumn = r#"{
        "name": "created-at",
        "type": "date",
        "description": "created time",
        "jsonPath": ".metadata.creationTimestamp"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    /// Purge and delete the remote bucket when this resource is deleted.
    #[serde(default)]
    pub force_delete: bool,
}

impl BucketSpec {
    pub fn region(&self) -> Option<&str> {
        Some(self.region.as_str()).filter(|region| !region.is_empty())
    }
}
