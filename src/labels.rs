//! Label/annotation key tables for the dual `neuromation.io` / `apolo.us`
//! vocabularies. Readers accept either key; writers write both (invariant 3
//! in the data model).

/// A paired legacy/current key. Iterated by both the mutation and parsing
/// paths so the two vocabularies never drift out of sync.
#[derive(Debug, Clone, Copy)]
pub struct KeyPair {
    pub legacy: &'static str,
    pub current: &'static str,
}

impl KeyPair {
    const fn new(legacy: &'static str, current: &'static str) -> Self {
        Self { legacy, current }
    }

    /// Read an entry from a label/annotation map, preferring the current key
    /// but falling back to the legacy one.
    pub fn read<'a>(
        &self,
        map: &'a std::collections::BTreeMap<String, String>,
    ) -> Option<&'a str> {
        map.get(self.current)
            .or_else(|| map.get(self.legacy))
            .map(String::as_str)
    }

    /// Write both keys with the same value into a label/annotation map.
    pub fn write(&self, map: &mut std::collections::BTreeMap<String, String>, value: impl Into<String>) {
        let value = value.into();
        map.insert(self.legacy.to_string(), value.clone());
        map.insert(self.current.to_string(), value);
    }

    /// True if either key is present in the map.
    pub fn is_present(&self, map: &std::collections::BTreeMap<String, String>) -> bool {
        map.contains_key(self.legacy) || map.contains_key(self.current)
    }
}

pub const MARK: KeyPair = KeyPair::new("platform.neuromation.io/disk-api-pvc", "platform.apolo.us/disk");
pub const DELETED_MARK: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-pvc-deleted",
    "platform.apolo.us/disk-deleted",
);
pub const ORG: KeyPair = KeyPair::new("platform.neuromation.io/disk-api-org-name", "platform.apolo.us/org");
pub const PROJECT: KeyPair = KeyPair::new("platform.neuromation.io/project", "platform.apolo.us/project");
pub const USER: KeyPair = KeyPair::new("platform.neuromation.io/user", "platform.apolo.us/user");

pub const NAME: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-disk-name",
    "platform.apolo.us/name",
);
pub const CREATED_AT: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-created-at",
    "platform.apolo.us/created-at",
);
pub const LAST_USAGE: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-last-usage",
    "platform.apolo.us/last-usage",
);
pub const LIFE_SPAN: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-life-span",
    "platform.apolo.us/life-span",
);
pub const USED_BYTES: KeyPair = KeyPair::new(
    "platform.neuromation.io/disk-api-used-bytes",
    "platform.apolo.us/used-bytes",
);

/// Not part of the dual vocabulary: single annotation that requests disk
/// volume injection into a pod (§4.D).
pub const INJECT_DISK_ANNOTATION: &str = "platform.apolo.us/inject-disk";

/// vcluster host-side alias annotation; when present it overrides the
/// PVC name as the disk id (§4.C PVC -> Disk mapping rules).
pub const VCLUSTER_OBJECT_NAME_ANNOTATION: &str = "vcluster.loft.sh/object-name";

/// Slash is not a valid label value character; owners are stored with `/`
/// replaced by `--`.
pub fn owner_to_label_value(owner: &str) -> String {
    owner.replace('/', "--")
}

pub fn owner_from_label_value(value: &str) -> String {
    value.replace("--", "/")
}

/// Normalizes the absent-org sentinel. Always recorded, never omitted
/// (Open Question fixed in favor of always-present org label, §9).
pub const NO_ORG_SENTINEL: &str = "no-org";

pub fn normalize_org(org: Option<&str>) -> String {
    match org {
        Some(o) if !o.is_empty() && o != "NO_ORG" => o.to_string(),
        _ => NO_ORG_SENTINEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_sets_both_keys() {
        let mut map = std::collections::BTreeMap::new();
        MARK.write(&mut map, "true");
        assert_eq!(map.get(MARK.legacy).map(String::as_str), Some("true"));
        assert_eq!(map.get(MARK.current).map(String::as_str), Some("true"));
    }

    #[test]
    fn read_prefers_current_falls_back_to_legacy() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(ORG.legacy.to_string(), "acme".to_string());
        assert_eq!(ORG.read(&map), Some("acme"));
        map.insert(ORG.current.to_string(), "acme-current".to_string());
        assert_eq!(ORG.read(&map), Some("acme-current"));
    }

    #[test]
    fn owner_roundtrip_slash() {
        let owner = "alice/sub";
        let stored = owner_to_label_value(owner);
        assert_eq!(stored, "alice--sub");
        assert_eq!(owner_from_label_value(&stored), owner);
    }

    #[test]
    fn normalize_org_defaults_to_sentinel() {
        assert_eq!(normalize_org(None), "no-org");
        assert_eq!(normalize_org(Some("NO_ORG")), "no-org");
        assert_eq!(normalize_org(Some("")), "no-org");
        assert_eq!(normalize_org(Some("acme")), "acme");
    }
}
