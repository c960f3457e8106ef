//! Event filters for the coordinator's watch streams.
//!
//! A reconcile walks the whole fleet, so the watches must stay quiet: the only mutations that
//! can move the state machine are transitions of the two handshake annotations, object
//! creation/deletion, and pool config changes. Everything else (label churn, spec edits,
//! unrelated annotations, status updates) is dropped here before it reaches the work queue.
//!
//! The watcher API does not hand us old/new object pairs, so each filter keeps the last value it
//! saw per object and compares against that. This also covers the present↔absent transitions
//! that a plain value comparison would miss.

use models::constants::{NODE_DRAIN_ANNOTATION, NODE_STATE_DRAIN_ANNOTATION_CURRENT};

use kube::runtime::watcher;
use kube::ResourceExt;
use std::collections::HashMap;

/// Accepts only changes of a single annotation's value, keyed by object name.
pub struct AnnotationTransitions {
    annotation: &'static str,
    /// Whether first sight of an object without the annotation is itself relevant.
    accept_bare_create: bool,
    last_seen: HashMap<String, Option<String>>,
}

impl AnnotationTransitions {
    /// Filter for Node events: only request-annotation transitions matter, and a node created
    /// without a request has asked for nothing yet.
    pub fn for_drain_requests() -> Self {
        Self::new(NODE_DRAIN_ANNOTATION, false)
    }

    /// Filter for node state events: creation is always relevant because the coordinator must
    /// initialize the grant annotation.
    pub fn for_drain_grants() -> Self {
        Self::new(NODE_STATE_DRAIN_ANNOTATION_CURRENT, true)
    }

    fn new(annotation: &'static str, accept_bare_create: bool) -> Self {
        AnnotationTransitions {
            annotation,
            accept_bare_create,
            last_seen: HashMap::new(),
        }
    }

    /// Feeds one watcher event through the filter, returning the node keys to reconcile.
    pub fn observe<K: ResourceExt>(&mut self, event: &watcher::Event<K>) -> Vec<String> {
        match event {
            watcher::Event::Applied(object) => self.observe_applied(object).into_iter().collect(),
            watcher::Event::Deleted(object) => {
                let name = object.name_any();
                self.last_seen.remove(&name);
                vec![name]
            }
            // A restarted watch re-lists the world: unchanged objects stay silent, new and
            // changed ones fire, and objects that vanished while we were not watching are
            // reconciled so their bookkeeping unwinds.
            watcher::Event::Restarted(objects) => {
                let mut previous = std::mem::take(&mut self.last_seen);
                let mut keys = Vec::new();
                for object in objects {
                    let name = object.name_any();
                    let value = self.annotation_value(object);
                    match previous.remove(&name) {
                        None => {
                            if self.accept_bare_create || value.is_some() {
                                keys.push(name.clone());
                            }
                        }
                        Some(last) => {
                            if last != value {
                                keys.push(name.clone());
                            }
                        }
                    }
                    self.last_seen.insert(name, value);
                }
                keys.extend(previous.into_keys());
                keys
            }
        }
    }

    /// Names of every object currently tracked by this filter.
    pub fn known_keys(&self) -> Vec<String> {
        self.last_seen.keys().cloned().collect()
    }

    fn observe_applied<K: ResourceExt>(&mut self, object: &K) -> Option<String> {
        let name = object.name_any();
        let value = self.annotation_value(object);
        match self.last_seen.insert(name.clone(), value.clone()) {
            // First sight of the object.
            None => (self.accept_bare_create || value.is_some()).then_some(name),
            Some(last) => (last != value).then_some(name),
        }
    }

    fn annotation_value<K: ResourceExt>(&self, object: &K) -> Option<String> {
        object.annotations().get(self.annotation).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(name: &str, annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect::<BTreeMap<String, String>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn bare_node_creation_is_silent() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        let keys = filter.observe(&watcher::Event::Applied(node("node1", &[])));
        assert!(keys.is_empty());
    }

    #[test]
    fn annotated_node_creation_fires() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        let keys = filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));
        assert_eq!(keys, vec!["node1".to_string()]);
    }

    #[test]
    fn unrelated_mutations_are_silent() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));

        // Same request value, different unrelated annotation: no reconcile.
        let keys = filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle"), ("some-annotation", "fake")],
        )));
        assert!(keys.is_empty());
    }

    #[test]
    fn request_value_transitions_fire() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));

        let keys = filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Drain_Required")],
        )));
        assert_eq!(keys, vec!["node1".to_string()]);

        // Removal of the annotation is a transition too.
        let keys = filter.observe(&watcher::Event::Applied(node("node1", &[])));
        assert_eq!(keys, vec!["node1".to_string()]);
    }

    #[test]
    fn deletion_fires_and_forgets() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));

        let keys = filter.observe(&watcher::Event::Deleted(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));
        assert_eq!(keys, vec!["node1".to_string()]);

        // Recreated without the annotation: back to the bare-create rule.
        let keys = filter.observe(&watcher::Event::Applied(node("node1", &[])));
        assert!(keys.is_empty());
    }

    #[test]
    fn bare_node_state_creation_fires() {
        let mut filter = AnnotationTransitions::for_drain_grants();
        let keys = filter.observe(&watcher::Event::Applied(node("node1", &[])));
        assert_eq!(keys, vec!["node1".to_string()]);
    }

    #[test]
    fn restart_fires_only_for_changes() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        filter.observe(&watcher::Event::Applied(node(
            "node1",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));
        filter.observe(&watcher::Event::Applied(node(
            "node2",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));

        // node1 unchanged, node2 gone, node3 new with an annotation.
        let mut keys = filter.observe(&watcher::Event::Restarted(vec![
            node("node1", &[(NODE_DRAIN_ANNOTATION, "Idle")]),
            node("node3", &[(NODE_DRAIN_ANNOTATION, "Drain_Required")]),
        ]));
        keys.sort();
        assert_eq!(keys, vec!["node2".to_string(), "node3".to_string()]);
    }

    #[test]
    fn known_keys_tracks_the_fleet() {
        let mut filter = AnnotationTransitions::for_drain_requests();
        filter.observe(&watcher::Event::Applied(node("node1", &[])));
        filter.observe(&watcher::Event::Applied(node(
            "node2",
            &[(NODE_DRAIN_ANNOTATION, "Idle")],
        )));
        let mut keys = filter.known_keys();
        keys.sort();
        assert_eq!(keys, vec!["node1".to_string(), "node2".to_string()]);
    }
}
