use std::collections::BTreeMap;

/// Annotation key marking a layer as the lazy-loading filesystem bootstrap
/// (the metadata blob this crate exists to fetch).
pub const METADATA_LAYER_ANNOTATION: &str = "containerd.io/snapshot/nydus-bootstrap";

/// Returns `true` when the annotations identify a metadata (bootstrap) layer.
pub fn is_metadata_layer(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(METADATA_LAYER_ANNOTATION)
        .is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_present() {
        let mut annos = BTreeMap::new();
        annos.insert(METADATA_LAYER_ANNOTATION.to_string(), "true".to_string());
        assert!(is_metadata_layer(&annos));
    }

    #[test]
    fn marker_wrong_value() {
        let mut annos = BTreeMap::new();
        annos.insert(METADATA_LAYER_ANNOTATION.to_string(), "false".to_string());
        assert!(!is_metadata_layer(&annos));
    }

    #[test]
    fn marker_absent() {
        assert!(!is_metadata_layer(&BTreeMap::new()));
    }
}
