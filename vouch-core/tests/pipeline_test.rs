//! End-to-end tests of the fetch/import pipeline.

mod common;

use common::{deliver, identity_file, test_kernel, uri};
use vouch_model::FetchState;

#[test]
fn two_hop_propagation_through_the_pipeline() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();

    let a_uri = uri(10, 0);
    let a = t.kernel.add_identity(&a_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), a.id(), 100, "seed").unwrap();

    // A's fetched trust list names B, which does not exist yet.
    let b_uri = uri(20, 3);
    deliver(
        &t.kernel,
        a_uri.with_edition(1),
        identity_file(Some("alice"), true, &[(b_uri, 50, "met her")]),
    );
    t.kernel.process_imports_now();

    let a_after = t.kernel.identity(a.id()).unwrap();
    assert_eq!(a_after.edition(), 1);
    assert_eq!(a_after.fetch_state(), FetchState::Fetched);
    assert_eq!(a_after.nickname(), Some("alice"));

    // B was created as a stub, with the published edition as a hint.
    let b = t.kernel.identity(b_uri.id()).unwrap();
    assert_eq!(b.nickname(), None);
    assert_eq!(b.fetch_state(), FetchState::NotFetched);
    assert_eq!(b.edition_hint(), 3);

    let score_a = t.kernel.score(owner.id(), a.id()).unwrap();
    assert_eq!(score_a.rank(), 1);
    assert_eq!(score_a.capacity(), 40);

    let score_b = t.kernel.score(owner.id(), b.id()).unwrap();
    assert_eq!(score_b.rank(), 2);
    assert_eq!(score_b.capacity(), 16);
    assert_eq!(score_b.value(), 50 * 40 / 100);

    // B is now worth fetching, starting past its hint.
    let started = t.fetcher.started.lock().unwrap();
    let for_b: Vec<_> = started.iter().filter(|u| u.id() == b.id()).collect();
    assert!(!for_b.is_empty());
    assert_eq!(for_b.last().unwrap().edition(), 4);
}

#[test]
fn newer_edition_supersedes_older_in_the_queue() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 100, "").unwrap();

    deliver(
        &t.kernel,
        x_uri.with_edition(5),
        identity_file(Some("five"), true, &[]),
    );
    deliver(
        &t.kernel,
        x_uri.with_edition(6),
        identity_file(Some("six"), true, &[]),
    );
    t.kernel.process_imports_now();

    // Only edition 6 was imported.
    let x_after = t.kernel.identity(x.id()).unwrap();
    assert_eq!(x_after.edition(), 6);
    assert_eq!(x_after.nickname(), Some("six"));

    let stats = t.kernel.stats().queue;
    assert_eq!(stats.deduplicated, 1);
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.failed, 0);
}

#[test]
fn parse_failure_marks_and_advances_without_halting() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let y_uri = uri(11, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    let y = t.kernel.add_identity(&y_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 50, "").unwrap();
    t.kernel.set_trust(owner.id(), y.id(), 50, "").unwrap();

    deliver(&t.kernel, x_uri.with_edition(2), b"<garbage>".to_vec());
    deliver(
        &t.kernel,
        y_uri.with_edition(1),
        identity_file(Some("fine"), true, &[]),
    );
    t.kernel.process_imports_now();

    // The bad edition is marked and retired so it is not fetched again.
    let x_after = t.kernel.identity(x.id()).unwrap();
    assert_eq!(x_after.fetch_state(), FetchState::ParsingFailed);
    assert_eq!(x_after.edition(), 2);

    // The importer carried on with the next file.
    let y_after = t.kernel.identity(y.id()).unwrap();
    assert_eq!(y_after.fetch_state(), FetchState::Fetched);

    let stats = t.kernel.stats().queue;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.finished, 1);
}

#[test]
fn importing_the_same_edition_twice_is_a_noop() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 100, "").unwrap();

    let payload = identity_file(Some("alice"), true, &[(uri(20, 0), 30, "")]);
    deliver(&t.kernel, x_uri.with_edition(1), payload.clone());
    t.kernel.process_imports_now();
    let first = t.kernel.identity(x.id()).unwrap();
    let trust_first = t.kernel.trust(x.id(), uri(20, 0).id()).unwrap();

    deliver(&t.kernel, x_uri.with_edition(1), payload);
    t.kernel.process_imports_now();
    let second = t.kernel.identity(x.id()).unwrap();
    let trust_second = t.kernel.trust(x.id(), uri(20, 0).id()).unwrap();

    // Unchanged, including the version ids: no events were produced.
    assert_eq!(first, second);
    assert_eq!(first.version_id(), second.version_id());
    assert_eq!(trust_first.version_id(), trust_second.version_id());
    assert_eq!(t.kernel.stats().queue.finished, 2);
}

#[test]
fn stale_trusts_are_deleted_on_newer_edition() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 100, "").unwrap();

    let b_uri = uri(20, 0);
    let c_uri = uri(30, 0);
    deliver(
        &t.kernel,
        x_uri.with_edition(1),
        identity_file(None, true, &[(b_uri, 40, ""), (c_uri, 60, "")]),
    );
    t.kernel.process_imports_now();
    assert_eq!(t.kernel.given_trusts(x.id()).len(), 2);
    assert!(t.kernel.score(owner.id(), b_uri.id()).is_ok());

    // Edition 2 drops B and changes C's value.
    deliver(
        &t.kernel,
        x_uri.with_edition(2),
        identity_file(None, true, &[(c_uri, -20, "changed my mind")]),
    );
    t.kernel.process_imports_now();

    let given = t.kernel.given_trusts(x.id());
    assert_eq!(given.len(), 1);
    assert_eq!(given[0].trustee(), c_uri.id());
    assert_eq!(given[0].value(), -20);
    assert_eq!(given[0].truster_edition(), 2);

    // B fell out of the trust tree with the deleted edge.
    assert!(t.kernel.score(owner.id(), b_uri.id()).is_err());
}

#[test]
fn conflicting_nickname_rejects_the_import() {
    let t = test_kernel();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 100, "").unwrap();

    deliver(
        &t.kernel,
        x_uri.with_edition(1),
        identity_file(Some("first"), true, &[]),
    );
    t.kernel.process_imports_now();

    deliver(
        &t.kernel,
        x_uri.with_edition(2),
        identity_file(Some("other"), true, &[]),
    );
    t.kernel.process_imports_now();

    // The import was rejected wholesale: nickname and edition unchanged.
    let x_after = t.kernel.identity(x.id()).unwrap();
    assert_eq!(x_after.nickname(), Some("first"));
    assert_eq!(x_after.edition(), 1);
    assert_eq!(t.kernel.stats().queue.failed, 1);
}

#[test]
fn unknown_identity_files_are_not_imported() {
    let t = test_kernel();
    deliver(
        &t.kernel,
        uri(99, 1),
        identity_file(Some("stranger"), true, &[]),
    );
    t.kernel.process_imports_now();
    assert!(t.kernel.identity(uri(99, 1).id()).is_err());
    assert_eq!(t.kernel.stats().queue.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn background_job_drains_the_queue_after_the_delay() {
    let t = test_kernel();
    t.kernel.start().unwrap();
    let owner = t.kernel.create_own_identity("owner", true).unwrap();
    let x_uri = uri(10, 0);
    let x = t.kernel.add_identity(&x_uri.to_string()).unwrap();
    t.kernel.set_trust(owner.id(), x.id(), 100, "").unwrap();

    deliver(
        &t.kernel,
        x_uri.with_edition(1),
        identity_file(Some("alice"), true, &[]),
    );
    assert_eq!(t.kernel.import_queue().len(), 1);

    // Nothing happens before the coalescing delay has passed.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(t.kernel.import_queue().len(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(t.kernel.import_queue().len(), 0);
    assert_eq!(
        t.kernel.identity(x.id()).unwrap().fetch_state(),
        FetchState::Fetched
    );

    t.kernel.stop().await;
}
