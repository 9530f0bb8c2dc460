//! Host-side naming of objects mirrored out of a virtual cluster.

use crate::labels::{TRANSLATED_CLUSTER, TRANSLATED_NAME, TRANSLATED_NAMESPACE};
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};

pub const MAX_NAME_LENGTH: usize = 63;

/// Joins `parts` with "-". Names over the length limit are cut and given a
/// short digest of the full name, so distinct inputs stay distinct.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.chars().count() <= MAX_NAME_LENGTH {
        return full;
    }
    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let chars: Vec<char> = full.chars().collect();
    // a cut name must still end in an alphanumeric
    let (keep, hash) = match chars[56] {
        c if c.is_ascii_lowercase() || c.is_ascii_digit() => (57, 5),
        _ => (56, 6),
    };
    let head: String = chars[..keep].iter().collect();
    format!("{}-{}", head, &digest[..hash])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translator {
    cluster_name: String,
    cluster_namespace: String,
}

impl Translator {
    pub fn new(cluster_name: &str, cluster_namespace: &str) -> Self {
        Translator {
            cluster_name: cluster_name.to_string(),
            cluster_namespace: cluster_namespace.to_string(),
        }
    }

    pub fn cluster_namespace(&self) -> &str {
        &self.cluster_namespace
    }

    pub fn translate_name(&self, namespace: &str, name: &str) -> String {
        let prefix = format!("{}-{}-{}", name, namespace, self.cluster_name);
        // "+" cannot appear in object names, so the key is unambiguous
        let key = format!("{}+{}+{}", name, namespace, self.cluster_name);
        safe_concat_name(&[&prefix, &hex::encode(key)])
    }

    /// Moves `meta` into the host namespace under its translated name,
    /// remembering where it came from.
    pub fn translate_to(&self, meta: &mut ObjectMeta) {
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();

        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(TRANSLATED_NAME.to_string(), name.clone());
        annotations.insert(TRANSLATED_NAMESPACE.to_string(), namespace.clone());
        meta.labels
            .get_or_insert_with(Default::default)
            .insert(TRANSLATED_CLUSTER.to_string(), self.cluster_name.clone());

        meta.name = Some(self.translate_name(&namespace, &name));
        meta.namespace = Some(self.cluster_namespace.clone());
        clear_server_fields(meta);
    }

    /// Inverse of `translate_to`. Returns false when `meta` carries no
    /// record of a virtual origin.
    pub fn translate_from(&self, meta: &mut ObjectMeta) -> bool {
        let annotations = meta.annotations.get_or_insert_with(Default::default);
        let name = match annotations.remove(TRANSLATED_NAME) {
            Some(name) => name,
            None => return false,
        };
        let namespace = annotations.remove(TRANSLATED_NAMESPACE);
        if let Some(labels) = meta.labels.as_mut() {
            labels.remove(TRANSLATED_CLUSTER);
        }
        meta.name = Some(name);
        if namespace.is_some() {
            meta.namespace = namespace;
        }
        clear_server_fields(meta);
        true
    }
}

/// Drops the fields the destination API server assigns itself.
pub fn clear_server_fields(meta: &mut ObjectMeta) {
    meta.resource_version = None;
    meta.uid = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.managed_fields = None;
    meta.creation_timestamp = None;
    meta.generation = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn short_names_are_joined_verbatim() {
        assert_eq!(safe_concat_name(&["a", "b"]), "a-b");
    }

    #[test]
    fn long_names_are_bounded_and_distinct() {
        let tr = Translator::new("alice", "k3k-alice");
        let a = tr.translate_name("production", "website");
        let b = tr.translate_name("production", "website2");
        assert_eq!(a, tr.translate_name("production", "website"));
        assert_ne!(a, b);
        assert_eq!(a.len(), MAX_NAME_LENGTH);
        assert!(a.starts_with("website-production-alice-"));
        assert_ne!(a, Translator::new("bob", "k3k-bob").translate_name("production", "website"));
        // short enough to keep the full hex key
        assert_eq!(
            tr.translate_name("default", "web"),
            format!("web-default-alice-{}", hex::encode("web+default+alice"))
        );
    }

    #[test]
    fn cut_never_ends_on_a_separator() {
        // position 56 is a "-" here
        let name = format!("{}-{}", "a".repeat(56), "b".repeat(20));
        let cut = safe_concat_name(&[&name]);
        assert_eq!(cut.len(), MAX_NAME_LENGTH);
        assert!(cut.starts_with(&"a".repeat(56)));
        assert_eq!(&cut[56..57], "-");
        assert_ne!(&cut[55..56], "-");
    }

    #[test]
    fn translation_round_trips_metadata() {
        let tr = Translator::new("alice", "k3k-alice");
        let mut meta = ObjectMeta {
            name: Some("web".into()),
            namespace: Some("shop".into()),
            resource_version: Some("12".into()),
            uid: Some("u".into()),
            annotations: Some(BTreeMap::from([("keep".to_string(), "1".to_string())])),
            ..ObjectMeta::default()
        };
        tr.translate_to(&mut meta);
        assert_eq!(meta.name, Some(tr.translate_name("shop", "web")));
        assert_eq!(meta.namespace.as_deref(), Some("k3k-alice"));
        assert_eq!(meta.resource_version, None);
        assert_eq!(meta.labels.as_ref().unwrap()[TRANSLATED_CLUSTER], "alice");
        assert_eq!(meta.annotations.as_ref().unwrap()[TRANSLATED_NAMESPACE], "shop");

        assert!(tr.translate_from(&mut meta));
        assert_eq!(meta.name.as_deref(), Some("web"));
        assert_eq!(meta.namespace.as_deref(), Some("shop"));
        assert_eq!(
            meta.annotations,
            Some(BTreeMap::from([("keep".to_string(), "1".to_string())]))
        );
        assert!(!tr.translate_from(&mut meta));
    }
}
