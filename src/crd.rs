use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_SCAN_ATTEMPTS: usize = 10;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "shipwright.io", version = "v1beta1", kind = "Image", plural = "images")]
#[kube(namespaced, status = "ImageStatus")]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hash_references: Vec<HashReference>,
}

/// A content addressed reference the image operator resolved for an Image.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HashReference {
    pub image_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
}

impl Image {
    pub fn hash_references(&self) -> &[HashReference] {
        self.status
            .as_ref()
            .map(|s| s.hash_references.as_slice())
            .unwrap_or_default()
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "ImageScan",
    plural = "imagescans",
    status = "ImageScanStatus",
    derive = "PartialEq"
)]
pub struct ImageScanSpec {}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanStatus {
    /// Most recent first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ImageRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Failure {
    pub when: DateTime<Utc>,
    pub error: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Vulnerability {
    pub id: String,
    pub severity: String,
    pub description: String,
}

/// Points from an ImageScan back to an Image that referenced its digest.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ImageRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ImageRef {
    pub fn from_image(image: &Image) -> Self {
        Self {
            namespace: image.namespace().unwrap_or_default(),
            name: image.name_any(),
            uid: image.meta().uid.clone().unwrap_or_default(),
        }
    }
}

impl ImageScan {
    /// A bare record for a digest that has never been seen before.
    pub fn for_digest(name: &str) -> Self {
        let mut scan = ImageScan::new(name, ImageScanSpec::default());
        scan.status = Some(ImageScanStatus::default());
        scan
    }

    fn status_mut(&mut self) -> &mut ImageScanStatus {
        self.status.get_or_insert_with(ImageScanStatus::default)
    }

    pub fn failures(&self) -> &[Failure] {
        self.status
            .as_ref()
            .map(|s| s.failures.as_slice())
            .unwrap_or_default()
    }

    pub fn references(&self) -> &[ImageRef] {
        self.status
            .as_ref()
            .map(|s| s.references.as_slice())
            .unwrap_or_default()
    }

    /// Whether a scan has completed successfully. Executed records are never scanned again.
    pub fn executed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.finished_at.is_some())
    }

    /// Whether the attempt budget is spent. Such a record is abandoned for good.
    pub fn has_failed(&self, max_attempts: usize) -> bool {
        self.failures().len() >= max_attempts
    }

    /// Records a failed attempt, dropping the oldest entries beyond `max_attempts`.
    pub fn prepend_failure(&mut self, error: impl Into<String>, max_attempts: usize) {
        let failure = Failure {
            when: Utc::now(),
            error: error.into(),
        };
        let failures = &mut self.status_mut().failures;
        failures.insert(0, failure);
        failures.truncate(max_attempts);
    }

    pub fn set_result(&mut self, vulnerabilities: Vec<Vulnerability>) {
        let status = self.status_mut();
        status.finished_at = Some(Utc::now());
        status.vulnerabilities = vulnerabilities;
    }

    /// Adds the reference unless one with the same UID exists. Returns true if it was added.
    pub fn add_reference(&mut self, reference: ImageRef) -> bool {
        if self.has_reference(&reference.uid) {
            return false;
        }
        self.status_mut().references.push(reference);
        true
    }

    pub fn delete_reference(&mut self, reference: &ImageRef) {
        self.status_mut()
            .references
            .retain(|r| r.uid != reference.uid);
    }

    pub fn has_reference(&self, uid: &str) -> bool {
        self.references().iter().any(|r| r.uid == uid)
    }

    pub fn has_references(&self) -> bool {
        !self.references().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(name: &str, uid: &str) -> ImageRef {
        ImageRef {
            namespace: "ns".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    #[test]
    fn test_prepend_failure_keeps_most_recent_first() {
        let mut scan = ImageScan::for_digest("abc");
        scan.prepend_failure("first", 10);
        scan.prepend_failure("second", 10);
        let errors: Vec<&str> = scan.failures().iter().map(|f| f.error.as_str()).collect();
        assert_eq!(errors, vec!["second", "first"]);
    }

    #[test]
    fn test_prepend_failure_evicts_oldest_beyond_cap() {
        let mut scan = ImageScan::for_digest("abc");
        for i in 0..=3 {
            scan.prepend_failure(format!("attempt {}", i), 3);
        }
        let errors: Vec<&str> = scan.failures().iter().map(|f| f.error.as_str()).collect();
        assert_eq!(errors, vec!["attempt 3", "attempt 2", "attempt 1"]);
    }

    #[test]
    fn test_has_failed_at_cap() {
        let mut scan = ImageScan::for_digest("abc");
        for _ in 0..DEFAULT_MAX_SCAN_ATTEMPTS - 1 {
            scan.prepend_failure("boom", DEFAULT_MAX_SCAN_ATTEMPTS);
        }
        assert!(!scan.has_failed(DEFAULT_MAX_SCAN_ATTEMPTS));
        scan.prepend_failure("boom", DEFAULT_MAX_SCAN_ATTEMPTS);
        assert!(scan.has_failed(DEFAULT_MAX_SCAN_ATTEMPTS));
        assert!(!scan.executed());
    }

    #[test]
    fn test_set_result_marks_executed() {
        let mut scan = ImageScan::for_digest("abc");
        assert!(!scan.executed());
        scan.set_result(vec![Vulnerability {
            id: "CVE-1".to_string(),
            severity: "HIGH".to_string(),
            description: "x".to_string(),
        }]);
        assert!(scan.executed());
        assert_eq!(scan.status.unwrap().vulnerabilities.len(), 1);
    }

    #[test]
    fn test_references_are_deduplicated_by_uid() {
        let mut scan = ImageScan::for_digest("abc");
        assert!(scan.add_reference(reference("a", "uid1")));
        assert!(!scan.add_reference(reference("renamed", "uid1")));
        assert!(scan.add_reference(reference("b", "uid2")));
        assert_eq!(scan.references().len(), 2);

        scan.delete_reference(&reference("a", "uid1"));
        assert!(!scan.has_reference("uid1"));
        assert!(scan.has_reference("uid2"));
        scan.delete_reference(&reference("b", "uid2"));
        assert!(!scan.has_references());
    }

    #[test]
    fn test_status_wire_format() {
        let mut scan = ImageScan::for_digest("abc");
        scan.add_reference(reference("a", "uid1"));
        let json = serde_json::to_value(&scan).unwrap();
        assert_eq!(json["metadata"]["name"], "abc");
        assert!(json["metadata"].get("namespace").is_none());
        assert_eq!(json["status"]["references"][0]["uid"], "uid1");
        assert!(json["status"].get("finishedAt").is_none());
        assert!(json["status"].get("failures").is_none());
    }

    #[test]
    fn test_image_hash_references_from_json() {
        let image: Image = serde_json::from_value(serde_json::json!({
            "apiVersion": "shipwright.io/v1beta1",
            "kind": "Image",
            "metadata": {"name": "a", "namespace": "ns", "uid": "uid1"},
            "spec": {"insecure": true},
            "status": {"hashReferences": [{"imageReference": "quay.io/r/i@sha256:abc"}]}
        }))
        .unwrap();
        assert!(image.spec.insecure);
        assert_eq!(image.hash_references().len(), 1);
        assert_eq!(ImageRef::from_image(&image), reference("a", "uid1"));
    }
}
