//! The `DiskNaming` custom resource: maps a human-readable disk name to a
//! PVC id within a project namespace (§3, §4.A).

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug)]
#[kube(
    group = "neuromation.io",
    version = "v1",
    kind = "DiskNaming",
    plural = "disknamings",
    singular = "disknaming",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DiskNamingSpec {
    pub disk_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn crd_api_coordinates() {
        assert_eq!(DiskNaming::group(&()), "neuromation.io");
        assert_eq!(DiskNaming::version(&()), "v1");
        assert_eq!(DiskNaming::kind(&()), "DiskNaming");
        assert_eq!(DiskNaming::plural(&()), "disknamings");
    }
}
