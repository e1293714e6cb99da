//! Integration tests for connector registration, stale references and
//! journal cleanup across round-trips.
//!
//! These tests drive a `Session` the way the request dispatcher and the UI
//! tree do:
//! - Registering and removing connectors inside round-trips
//! - Resolving client references as found, stale or unknown
//! - Purging the journal once the client acknowledges a round-trip
//! - Bounded journal growth under bulk removal and sustained churn

use std::sync::Arc;

use uisync::{
    BulkRemoval, Connector, ConnectorRegistry, Lookup, RegistryError, Session, SessionConfig,
    SessionError,
};

#[derive(Debug)]
struct Widget {
    id: String,
}

impl Connector for Widget {
    fn connector_id(&self) -> &str {
        &self.id
    }
}

fn widget(id: impl Into<String>) -> Arc<Widget> {
    Arc::new(Widget { id: id.into() })
}

/// A parent with a flat list of children, standing in for a layout.
struct Layout {
    node: Arc<Widget>,
    children: Vec<Arc<Widget>>,
}

impl Layout {
    fn attach(registry: &mut ConnectorRegistry<Widget>, children: usize) -> Self {
        let node = widget(registry.next_connector_id());
        registry.register(Arc::clone(&node)).unwrap();
        let children = (0..children)
            .map(|_| {
                let child = widget(registry.next_connector_id());
                registry.register(Arc::clone(&child)).unwrap();
                child
            })
            .collect();
        Self { node, children }
    }

    fn remove_all_children(&mut self, registry: &mut ConnectorRegistry<Widget>) -> BulkRemoval {
        let children = std::mem::take(&mut self.children);
        registry.unregister_bulk(children.iter().map(|c| c.as_ref()))
    }
}

#[test]
fn unregister_does_not_use_infinite_memory() {
    let session: Session<Widget> = Session::new(SessionConfig::default());
    let guard = session.lock();
    let mut registry = guard.state().unwrap();

    let mut layout = Layout::attach(&mut registry, 100_000);
    assert_eq!(registry.len(), 100_001);

    let removal = layout.remove_all_children(&mut registry);
    assert_eq!(removal.removed, 100_000);
    assert_eq!(registry.len(), 1);
    assert!(registry.is_registered(&layout.node.id));

    let sync_id = registry.sync_id();
    assert_eq!(registry.journal().bucket_count(), 1);
    assert_eq!(registry.journal().bucket_sizes(), vec![(sync_id, 100)]);

    registry.cleanup(123);
    assert_eq!(registry.journal().bucket_count(), 0);
    assert!(registry.journal().is_empty());
}

#[test]
fn bulk_removal_cleanup_at_exact_sync_id() {
    let session: Session<Widget> = Session::default();
    let mut layout = session
        .round_trip(None, |registry| Ok(Layout::attach(registry, 500)))
        .unwrap()
        .value;

    let removal = session
        .round_trip(None, |registry| Ok(layout.remove_all_children(registry)))
        .unwrap();
    assert_eq!(removal.value.journaled, 100);

    let before = session
        .with_state(|registry| registry.journal().bucket_sizes())
        .unwrap();
    assert_eq!(before, vec![(removal.sync_id, 100)]);

    session
        .with_state(|registry| registry.cleanup(removal.sync_id))
        .unwrap();
    let after = session
        .with_state(|registry| registry.journal().bucket_count())
        .unwrap();
    assert_eq!(after, 0);
}

#[test]
fn page_size_comes_from_config() {
    let config = SessionConfig::from_toml_str("journal_page_size = 10").unwrap();
    let session: Session<Widget> = Session::new(config);
    let journaled = session
        .with_state(|registry| {
            let mut layout = Layout::attach(registry, 50);
            layout.remove_all_children(registry).journaled
        })
        .unwrap();
    assert_eq!(journaled, 10);
}

#[test]
fn stale_reference_survives_until_acknowledged() {
    let session: Session<Widget> = Session::default();
    let button = widget("button");

    let attached = session
        .round_trip(None, |registry| Ok(registry.register(Arc::clone(&button))?))
        .unwrap();
    let removed = session
        .round_trip(Some(attached.sync_id), |registry| {
            registry.unregister(&button);
            Ok(())
        })
        .unwrap();

    // A click sent before the client saw the removal.
    let resolved = session
        .round_trip(Some(attached.sync_id), |registry| {
            Ok(registry.resolve("button")?)
        })
        .unwrap();
    assert!(resolved.value.is_none());

    // Once the removal round-trip is acknowledged the id is forgotten.
    let err = session
        .round_trip(Some(removed.sync_id), |registry| {
            Ok(registry.resolve("button")?)
        })
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Registry(RegistryError::UnknownConnector(ref id)) if id == "button"
    ));
}

#[test]
fn lookup_is_stale_for_any_threshold_below_removal() {
    let session: Session<Widget> = Session::default();
    let node = widget("n");
    for _ in 0..5 {
        session.round_trip(None, |_| Ok(())).unwrap();
    }
    let removed_at = session
        .round_trip(None, |registry| {
            registry.register(Arc::clone(&node))?;
            registry.unregister(&node);
            Ok(())
        })
        .unwrap()
        .sync_id;

    let stale_after_cleanup = |threshold| {
        session
            .with_state(|registry| {
                registry.cleanup(threshold);
                registry.lookup("n").is_stale()
            })
            .unwrap()
    };
    for threshold in 0..removed_at {
        assert!(stale_after_cleanup(threshold), "purged too early at {threshold}");
    }
    assert!(!stale_after_cleanup(removed_at));
}

#[test]
fn registry_and_journal_are_disjoint() {
    let session: Session<Widget> = Session::default();
    session
        .with_state(|registry| {
            let kept: Vec<_> = (0..20).map(|i| widget(format!("k{i}"))).collect();
            let dropped: Vec<_> = (0..20).map(|i| widget(format!("d{i}"))).collect();
            for w in kept.iter().chain(&dropped) {
                registry.register(Arc::clone(w)).unwrap();
            }
            for w in &dropped {
                registry.unregister(w);
            }
            for id in registry.registered_ids() {
                assert!(!registry.journal().contains(id));
            }
            for w in &dropped {
                assert!(registry.lookup(&w.id).is_stale());
                assert!(matches!(
                    registry.register(Arc::clone(w)),
                    Err(RegistryError::DuplicateId(_))
                ));
            }
            assert_eq!(registry.len(), 20);
            assert_eq!(registry.journal().len(), 20);
        })
        .unwrap();
}

#[test]
fn sustained_churn_stays_bounded_with_acknowledgements() {
    let session: Session<Widget> = Session::default();
    let mut live: Vec<Arc<Widget>> = Vec::new();
    let mut acknowledged = None;
    let mut peak = 0;

    for _ in 0..200 {
        let trip = session
            .round_trip(acknowledged, |registry| {
                for w in live.drain(..) {
                    registry.unregister(&w);
                }
                for _ in 0..25 {
                    let w = widget(registry.next_connector_id());
                    registry.register(Arc::clone(&w))?;
                    live.push(w);
                }
                Ok(registry.journal().len())
            })
            .unwrap();
        peak = peak.max(trip.value);
        // The client lags one round-trip behind.
        acknowledged = trip.sync_id.checked_sub(1);
    }

    assert!(peak <= 50, "journal grew to {peak} ids");
    let buckets = session
        .with_state(|registry| registry.journal().bucket_count())
        .unwrap();
    assert!(buckets <= 2);
}

#[test]
fn dirty_connectors_reported_once_per_response() {
    let session: Session<Widget> = Session::default();
    let a = widget("a");
    let b = widget("b");
    let first = session
        .round_trip(None, |registry| {
            registry.register(Arc::clone(&a))?;
            registry.register(Arc::clone(&b))?;
            registry.mark_dirty("b");
            registry.mark_dirty("a");
            Ok(registry
                .take_dirty()
                .iter()
                .map(|w| w.id.clone())
                .collect::<Vec<_>>())
        })
        .unwrap();
    assert_eq!(first.value, vec!["a", "b"]);

    let second = session
        .round_trip(None, |registry| Ok(registry.take_dirty().len()))
        .unwrap();
    assert_eq!(second.value, 0);
}

#[test]
fn found_lookup_returns_the_registered_object() {
    let session: Session<Widget> = Session::default();
    let w = widget("w");
    session
        .with_state(|registry| {
            registry.register(Arc::clone(&w)).unwrap();
            match registry.lookup("w") {
                Lookup::Found(found) => assert!(Arc::ptr_eq(&found, &w)),
                Lookup::Stale => panic!("expected Found, got Stale"),
                Lookup::Unknown => panic!("expected Found, got Unknown"),
            }
        })
        .unwrap();
}
