use super::*;
use ahash::AHashSet;
use maplit::btreeset;
use npm_dataplane_core::{Error, IpSetMetadata, Op, PodUpdate};
use pretty_assertions::assert_eq;
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn set(name: &str) -> IpSetMetadata {
    IpSetMetadata::set(name)
}

fn list(name: &str) -> IpSetMetadata {
    IpSetMetadata::list(name)
}

fn members(store: &IpSetStore, name: &str) -> Vec<(IpAddr, String)> {
    store
        .get(name)
        .expect("set must exist")
        .members
        .into_iter()
        .collect()
}

fn applied(mut store: IpSetStore) -> IpSetStore {
    let plan = store.plan(&AHashSet::new());
    store.commit(plan);
    store
}

#[test]
fn create_then_delete_before_apply_collapses() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));
    assert_eq!(store.pending_len(), 2);

    store.delete(&set("ns-a-pods"));
    store.delete(&list("all-namespaces"));
    assert_eq!(store.pending_len(), 0);
    assert!(store.is_empty());
    assert!(store.plan(&AHashSet::new()).is_empty());
}

#[test]
fn create_is_idempotent_and_rejects_kind_conflicts() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();

    store.create(&set("ns-a-pods"));
    store.create(&list("ns-a-pods"));

    let view = store.get("ns-a-pods").unwrap();
    assert_eq!(view.metadata, set("ns-a-pods"));
    assert_eq!(view.members.len(), 1);
}

#[test]
fn remove_after_add_restores_membership() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.4"), "ns-a/pod-0")
        .unwrap();
    let before = members(&store, "ns-a-pods");

    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    store
        .remove_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();

    assert_eq!(members(&store, "ns-a-pods"), before);
}

#[test]
fn removal_by_a_previous_owner_is_ignored() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    // The IP is reassigned before the first pod's deletion is observed.
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-2")
        .unwrap();
    store
        .remove_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();

    assert_eq!(
        members(&store, "ns-a-pods"),
        vec![(ip("10.0.0.5"), "ns-a/pod-2".to_string())]
    );

    // Members without a pod key may be removed by anyone.
    store
        .remove_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "")
        .unwrap();
    assert!(members(&store, "ns-a-pods").is_empty());
}

#[test]
fn unknown_sets_are_rejected_without_partial_mutation() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));

    let err = store
        .add_ip(
            &[set("ns-a-pods"), set("ns-b-pods")],
            ip("10.0.0.5"),
            "ns-a/pod-1",
        )
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSet(ref name) if name == "ns-b-pods"));
    assert!(members(&store, "ns-a-pods").is_empty());

    // Lists cannot hold IPs.
    let err = store
        .add_ip(&[list("all-namespaces")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSet(ref name) if name == "all-namespaces"));

    // A set cannot be used as a list.
    let err = store
        .add_to_list(&list("ns-a-pods"), &[set("ns-a-pods")])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSet(ref name) if name == "ns-a-pods"));

    let err = store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods"), set("ns-b-pods")])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSet(ref name) if name == "ns-b-pods"));
    assert!(store.get("all-namespaces").unwrap().sets.is_empty());
    assert_eq!(store.reference_count("ns-a-pods"), 0);
}

#[test]
fn lists_may_nest_without_cycles() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("outer"));
    store.create(&list("middle"));
    store.create(&list("inner"));

    store.add_to_list(&list("inner"), &[set("ns-a-pods")]).unwrap();
    store.add_to_list(&list("middle"), &[list("inner")]).unwrap();
    store.add_to_list(&list("outer"), &[list("middle")]).unwrap();

    let err = store
        .add_to_list(&list("inner"), &[list("outer")])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Cycle { ref list, ref set } if list == "inner" && set == "outer"
    ));

    let err = store
        .add_to_list(&list("outer"), &[list("outer")])
        .unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));

    assert_eq!(
        store.get("inner").unwrap().sets,
        btreeset! {"ns-a-pods".to_string()}
    );
}

#[test]
fn referenced_sets_are_not_deleted() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&set("ns-b-pods"));
    store.create(&list("all-namespaces"));
    store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods")])
        .unwrap();
    store.add_reference("ns-b-pods", Referrer::Policy("allow-b".to_string()));

    store.delete(&set("ns-a-pods"));
    store.delete(&set("ns-b-pods"));
    assert_eq!(store.names(), vec!["all-namespaces", "ns-a-pods", "ns-b-pods"]);
    assert_eq!(store.reference_count("ns-a-pods"), 1);

    // Deleting the list releases its references.
    store.delete(&list("all-namespaces"));
    assert_eq!(store.reference_count("ns-a-pods"), 0);
    store.delete(&set("ns-a-pods"));
    assert_eq!(store.names(), vec!["ns-b-pods"]);

    store.release_reference("ns-b-pods", &Referrer::Policy("allow-b".to_string()));
    store.delete(&set("ns-b-pods"));
    assert!(store.is_empty());
}

#[test]
fn plans_creates_then_deltas() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods")])
        .unwrap();

    let plan = store.plan(&AHashSet::new());
    assert_eq!(
        plan.creates,
        vec![
            Op::CreateSet {
                set: list("all-namespaces")
            },
            Op::CreateSet {
                set: set("ns-a-pods")
            },
        ]
    );
    assert_eq!(
        plan.member_adds,
        vec![Op::AddMembers {
            set: "ns-a-pods".to_string(),
            members: vec![ip("10.0.0.5")],
        }]
    );
    assert_eq!(
        plan.reference_adds,
        vec![Op::AddReferences {
            list: "all-namespaces".to_string(),
            sets: vec!["ns-a-pods".to_string()],
        }]
    );
    assert!(plan.deletes.is_empty());
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
    assert!(!store.get("ns-a-pods").unwrap().dirty);

    // Only the membership delta is planned.
    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.6"), "ns-a/pod-2")
        .unwrap();
    store
        .remove_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    assert!(store.get("ns-a-pods").unwrap().dirty);
    let plan = store.plan(&AHashSet::new());
    assert!(plan.creates.is_empty());
    assert_eq!(
        plan.member_adds,
        vec![Op::AddMembers {
            set: "ns-a-pods".to_string(),
            members: vec![ip("10.0.0.6")],
        }]
    );
    assert_eq!(
        plan.member_removes,
        vec![Op::RemoveMembers {
            set: "ns-a-pods".to_string(),
            members: vec![ip("10.0.0.5")],
        }]
    );
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
}

#[test]
fn net_zero_changes_plan_nothing() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    let mut store = applied(store);

    store
        .add_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    store
        .remove_ip(&[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    assert_eq!(store.pending_len(), 1);

    let plan = store.plan(&AHashSet::new());
    assert!(plan.is_empty());
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
}

#[test]
fn plans_deletions_after_reference_removals() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));
    store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods")])
        .unwrap();
    let mut store = applied(store);

    store.delete(&list("all-namespaces"));
    store.delete(&set("ns-a-pods"));
    assert_eq!(store.pending_len(), 2);

    let plan = store.plan(&AHashSet::new());
    assert_eq!(
        plan.reference_removes,
        vec![Op::RemoveReferences {
            list: "all-namespaces".to_string(),
            sets: vec!["ns-a-pods".to_string()],
        }]
    );
    assert_eq!(
        plan.deletes,
        vec![
            Op::DeleteSet {
                set: list("all-namespaces")
            },
            Op::DeleteSet {
                set: set("ns-a-pods")
            },
        ]
    );
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
    assert_eq!(store.host_len(), 0);
}

#[test]
fn deletions_of_sets_still_referenced_on_the_host_are_deferred() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));
    store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods")])
        .unwrap();
    let mut store = applied(store);

    store.delete(&list("all-namespaces"));
    store.delete(&set("ns-a-pods"));

    // A rule that remains installed references the list, and so transitively its members.
    let retained = ["all-namespaces".to_string()].into_iter().collect();
    let plan = store.plan(&retained);
    assert!(plan.is_empty());
    store.commit(plan);
    assert!(store.is_pending("all-namespaces"));
    assert!(store.is_pending("ns-a-pods"));

    let plan = store.plan(&AHashSet::new());
    assert_eq!(plan.deletes.len(), 2);
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
}

#[test]
fn recreating_a_set_with_another_kind_replaces_it_over_two_plans() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a"));
    let mut store = applied(store);

    store.delete(&set("ns-a"));
    store.create(&list("ns-a"));
    assert!(!store.is_ready(&list("ns-a")));

    let plan = store.plan(&AHashSet::new());
    assert!(plan.creates.is_empty());
    assert_eq!(plan.deletes, vec![Op::DeleteSet { set: set("ns-a") }]);
    store.commit(plan);
    assert!(store.is_ready(&list("ns-a")));

    let plan = store.plan(&AHashSet::new());
    assert_eq!(plan.creates, vec![Op::CreateSet { set: list("ns-a") }]);
    store.commit(plan);
    assert_eq!(store.pending_len(), 0);
}

#[test]
fn teardown_removes_everything_on_the_host() {
    let mut store = IpSetStore::default();
    store.create(&set("ns-a-pods"));
    store.create(&list("all-namespaces"));
    store
        .add_to_list(&list("all-namespaces"), &[set("ns-a-pods")])
        .unwrap();
    let store = applied(store);

    let plan = store.plan_teardown();
    assert_eq!(plan.reference_removes.len(), 1);
    assert_eq!(
        plan.deletes,
        vec![
            Op::DeleteSet {
                set: list("all-namespaces")
            },
            Op::DeleteSet {
                set: set("ns-a-pods")
            },
        ]
    );
}

#[test]
fn pod_ip_changes_retract_the_prior_ip() {
    let mut store = IpSetStore::default();
    let mut pods = PodTracker::default();
    store.create(&set("ns-a-pods"));
    store.create(&set("app-web"));

    pods.update_pod(
        &mut store,
        PodUpdate {
            pod_key: "ns-a/pod-1".to_string(),
            ip: ip("10.0.0.5"),
            sets: vec![set("ns-a-pods"), set("app-web")],
        },
    )
    .unwrap();
    pods.update_pod(
        &mut store,
        PodUpdate {
            pod_key: "ns-a/pod-1".to_string(),
            ip: ip("10.0.0.9"),
            sets: vec![set("ns-a-pods")],
        },
    )
    .unwrap();

    assert_eq!(
        members(&store, "ns-a-pods"),
        vec![(ip("10.0.0.9"), "ns-a/pod-1".to_string())]
    );
    assert!(members(&store, "app-web").is_empty());
    assert_eq!(
        pods.get("ns-a/pod-1"),
        Some(&PodMembership {
            ip: ip("10.0.0.9"),
            sets: btreeset! {"ns-a-pods".to_string()},
        })
    );
}

#[test]
fn pod_label_changes_leave_deselected_sets() {
    let mut store = IpSetStore::default();
    let mut pods = PodTracker::default();
    store.create(&set("app-web"));
    store.create(&set("app-api"));

    let update = |sets| PodUpdate {
        pod_key: "ns-a/pod-1".to_string(),
        ip: ip("10.0.0.5"),
        sets,
    };
    pods.update_pod(&mut store, update(vec![set("app-web")]))
        .unwrap();
    pods.update_pod(&mut store, update(vec![set("app-api")]))
        .unwrap();

    assert!(members(&store, "app-web").is_empty());
    assert_eq!(members(&store, "app-api").len(), 1);

    let err = pods
        .update_pod(&mut store, update(vec![set("app-db")]))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSet(ref name) if name == "app-db"));
    assert_eq!(members(&store, "app-api").len(), 1);
}

#[test]
fn tracked_adds_retract_a_stale_ip() {
    let mut store = IpSetStore::default();
    let mut pods = PodTracker::default();
    store.create(&set("ns-a-pods"));
    store.create(&set("app-web"));

    pods.add_to_sets(&mut store, &[set("ns-a-pods"), set("app-web")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();
    pods.add_to_sets(&mut store, &[set("ns-a-pods")], ip("10.0.0.7"), "ns-a/pod-1")
        .unwrap();
    assert_eq!(
        members(&store, "ns-a-pods"),
        vec![(ip("10.0.0.7"), "ns-a/pod-1".to_string())]
    );
    assert!(members(&store, "app-web").is_empty());

    pods.remove_from_sets(&mut store, &[set("ns-a-pods")], ip("10.0.0.7"), "ns-a/pod-1")
        .unwrap();
    assert!(pods.is_empty());
    assert!(members(&store, "ns-a-pods").is_empty());
}

#[test]
fn deleting_a_pod_retracts_its_ip() {
    let mut store = IpSetStore::default();
    let mut pods = PodTracker::default();
    store.create(&set("ns-a-pods"));
    pods.add_to_sets(&mut store, &[set("ns-a-pods")], ip("10.0.0.5"), "ns-a/pod-1")
        .unwrap();

    pods.delete_pod(&mut store, "ns-a/pod-1");
    pods.delete_pod(&mut store, "ns-a/pod-1");
    assert!(pods.is_empty());
    assert!(members(&store, "ns-a-pods").is_empty());
}
