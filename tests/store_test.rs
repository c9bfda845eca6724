//! Lease protocol behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use hatym_rs::model::*;
use hatym_rs::store::{AssignmentStore, ManualClock, MemoryStore};

fn ttl() -> Duration {
    Duration::minutes(30)
}

fn page(n: i64) -> PageNumber {
    PageNumber::new(n).unwrap()
}

fn store_with_clock() -> (Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    (store, clock)
}

fn assigned_pages(rows: &[ClaimRow]) -> Vec<u16> {
    rows.iter()
        .filter(|r| r.status == ClaimStatus::Assigned)
        .filter_map(|r| r.page_number.map(PageNumber::get))
        .collect()
}

async fn claim_one(
    store: &MemoryStore,
    session_id: SessionId,
    participant: &ParticipantId,
) -> (PageNumber, LeaseToken) {
    let rows = store
        .claim_next_page(session_id, participant, ttl(), 1)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ClaimStatus::Assigned);
    (
        rows[0].page_number.unwrap(),
        rows[0].lease_token.clone().unwrap(),
    )
}

#[tokio::test]
async fn new_session_has_every_page_available() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();

    let pages = store.list_pages(session_id).await.unwrap();
    assert_eq!(pages.len(), usize::from(TOTAL_PAGES));
    assert!(pages.iter().all(|p| p.status == PageStatus::Available));
    assert_eq!(pages.first().unwrap().page_number, PageNumber::FIRST);
    assert_eq!(pages.last().unwrap().page_number, PageNumber::LAST);

    let session = store.get_session(session_id).await.unwrap();
    assert!(session.active);
    assert_eq!(session.completed_count, 0);
    assert!(!session.is_finished());
}

#[tokio::test]
async fn new_session_supersedes_the_active_one() {
    let (store, clock) = store_with_clock();
    let first = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    claim_one(&store, first, &alice).await;

    clock.advance(Duration::seconds(1));
    let second = store.create_session().await.unwrap();

    let latest = store.latest_active_session().await.unwrap().unwrap();
    assert_eq!(latest.id, second);
    assert!(!store.get_session(first).await.unwrap().active);

    // The old session keeps its state.
    let old = store.get_page(first, PageNumber::FIRST).await.unwrap();
    assert_eq!(old.status, PageStatus::Assigned);
}

#[tokio::test]
async fn unknown_session_is_an_error() {
    let store = MemoryStore::new();
    let err = store
        .claim_next_page(SessionId::new(), &ParticipantId::generate(), ttl(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, hatym_rs::error::Error::SessionNotFound(_)));
    assert!(store.subscribe(SessionId::new()).await.is_err());
}

#[tokio::test]
async fn claims_lowest_available_page_first() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();

    for expected in 1..=3 {
        let (page_number, _) = claim_one(&store, session_id, &ParticipantId::generate()).await;
        assert_eq!(page_number.get(), expected);
    }
}

#[tokio::test]
async fn repeat_claim_resumes_the_same_lease() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();

    let (first_page, first_token) = claim_one(&store, session_id, &alice).await;
    let (again_page, again_token) = claim_one(&store, session_id, &alice).await;

    assert_eq!(first_page, again_page);
    assert_eq!(first_token, again_token);

    let assigned = store
        .list_pages(session_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.status == PageStatus::Assigned)
        .count();
    assert_eq!(assigned, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_share_a_page() {
    let store = Arc::new(MemoryStore::new());
    let session_id = store.create_session().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let participant = ParticipantId::generate();
            store
                .claim_next_page(session_id, &participant, ttl(), 2)
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let rows = handle.await.unwrap();
        for n in assigned_pages(&rows) {
            assert!(seen.insert(n), "page {n} handed out twice");
        }
    }
    assert_eq!(seen.len(), 128);
    assert_eq!(seen.iter().max(), Some(&128));
}

#[tokio::test]
async fn completion_requires_holder_and_current_token() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let mallory = ParticipantId::generate();
    let (page_number, token) = claim_one(&store, session_id, &alice).await;

    let wrong_token = store
        .complete_page(session_id, page_number, &alice, &LeaseToken::generate())
        .await
        .unwrap();
    assert_eq!(wrong_token.status, CompleteStatus::Rejected);

    let wrong_holder = store
        .complete_page(session_id, page_number, &mallory, &token)
        .await
        .unwrap();
    assert_eq!(wrong_holder.status, CompleteStatus::Rejected);

    let page = store.get_page(session_id, page_number).await.unwrap();
    assert_eq!(page.status, PageStatus::Assigned);

    let ok = store
        .complete_page(session_id, page_number, &alice, &token)
        .await
        .unwrap();
    assert!(ok.is_completed());
    assert_eq!(ok.completed_count, 1);
    assert!(!ok.finished);
}

#[tokio::test]
async fn completion_happens_exactly_once() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let (page_number, token) = claim_one(&store, session_id, &alice).await;

    let first = store
        .complete_page(session_id, page_number, &alice, &token)
        .await
        .unwrap();
    let second = store
        .complete_page(session_id, page_number, &alice, &token)
        .await
        .unwrap();

    assert!(first.is_completed());
    assert_eq!(second.status, CompleteStatus::Rejected);
    assert_eq!(second.completed_count, 1);

    let page = store.get_page(session_id, page_number).await.unwrap();
    assert_eq!(page.status, PageStatus::Completed);
    assert!(page.lease_token.is_none());
    assert!(page.completed_at.is_some());
    page.check_invariants().unwrap();
}

#[tokio::test]
async fn lease_is_reclaimed_only_after_ttl_has_fully_passed() {
    let (store, clock) = store_with_clock();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    claim_one(&store, session_id, &alice).await;

    clock.advance(ttl());
    let released = store
        .release_expired_assignments(session_id, ttl())
        .await
        .unwrap();
    assert_eq!(released, 0, "exactly ttl old is still live");

    clock.advance(Duration::seconds(1));
    let released = store
        .release_expired_assignments(session_id, ttl())
        .await
        .unwrap();
    assert_eq!(released, 1);

    let page = store.get_page(session_id, PageNumber::FIRST).await.unwrap();
    assert_eq!(page.status, PageStatus::Available);
    page.check_invariants().unwrap();
}

#[tokio::test]
async fn completed_page_is_never_reclaimed() {
    let (store, clock) = store_with_clock();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let (number, token) = claim_one(&store, session_id, &alice).await;
    store
        .complete_page(session_id, number, &alice, &token)
        .await
        .unwrap();

    clock.advance(Duration::minutes(45));
    let released = store
        .release_expired_assignments(session_id, ttl())
        .await
        .unwrap();
    assert_eq!(released, 0);

    let page = store.get_page(session_id, number).await.unwrap();
    assert_eq!(page.status, PageStatus::Completed);
    assert_eq!(page.holder.as_ref(), Some(&alice));
    assert_eq!(store.get_session(session_id).await.unwrap().completed_count, 1);
}

#[tokio::test]
async fn abandoned_page_goes_to_the_next_participant() {
    // Alice claims and walks away; Bob is handed the same page after expiry
    // and Alice's old token no longer works.
    let (store, clock) = store_with_clock();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let bob = ParticipantId::generate();

    let (alice_page, alice_token) = claim_one(&store, session_id, &alice).await;
    clock.advance(ttl() + Duration::minutes(1));
    store
        .release_expired_assignments(session_id, ttl())
        .await
        .unwrap();

    let (bob_page, bob_token) = claim_one(&store, session_id, &bob).await;
    assert_eq!(alice_page, bob_page);
    assert_ne!(alice_token, bob_token);

    let late = store
        .complete_page(session_id, alice_page, &alice, &alice_token)
        .await
        .unwrap();
    assert_eq!(late.status, CompleteStatus::Rejected);

    let done = store
        .complete_page(session_id, bob_page, &bob, &bob_token)
        .await
        .unwrap();
    assert!(done.is_completed());
}

#[tokio::test]
async fn own_lapsed_lease_is_surrendered_on_next_claim() {
    let (store, clock) = store_with_clock();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let bob = ParticipantId::generate();

    let (first, first_token) = claim_one(&store, session_id, &alice).await;
    claim_one(&store, session_id, &bob).await;
    clock.advance(ttl() + Duration::seconds(1));

    // No sweep ran. Alice's own stale lease goes back and she gets the lowest
    // available page, which is the one she just surrendered.
    let (next, next_token) = claim_one(&store, session_id, &alice).await;
    assert_eq!(next, first);
    assert_ne!(next_token, first_token);
}

#[tokio::test]
async fn multi_claim_respects_the_cap() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();

    let rows = store
        .claim_next_page(session_id, &alice, ttl(), 3)
        .await
        .unwrap();
    assert_eq!(assigned_pages(&rows), vec![1, 2, 3]);

    // Finish page 2, then come back: 1 and 3 resume, 2 is listed completed,
    // and nothing new is handed out.
    let token = rows[1].lease_token.clone().unwrap();
    store
        .complete_page(session_id, page(2), &alice, &token)
        .await
        .unwrap();

    let rows = store
        .claim_next_page(session_id, &alice, ttl(), 3)
        .await
        .unwrap();
    let statuses: Vec<_> = rows.iter().map(|r| (r.page_number.unwrap().get(), r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, ClaimStatus::Assigned),
            (3, ClaimStatus::Assigned),
            (2, ClaimStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn cap_used_up_reports_limit_reached() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();

    let (page_number, token) = claim_one(&store, session_id, &alice).await;
    store
        .complete_page(session_id, page_number, &alice, &token)
        .await
        .unwrap();

    let rows = store
        .claim_next_page(session_id, &alice, ttl(), 1)
        .await
        .unwrap();
    assert_eq!(rows, vec![ClaimRow::limit_reached()]);

    // A higher cap lets the same participant continue.
    let rows = store
        .claim_next_page(session_id, &alice, ttl(), 2)
        .await
        .unwrap();
    assert_eq!(assigned_pages(&rows), vec![2]);
    assert_eq!(rows.last().unwrap().status, ClaimStatus::Completed);
}

#[tokio::test]
async fn pool_exhaustion_reports_finished() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let greedy = ParticipantId::generate();

    let rows = store
        .claim_next_page(session_id, &greedy, ttl(), u32::from(TOTAL_PAGES))
        .await
        .unwrap();
    assert_eq!(rows.len(), usize::from(TOTAL_PAGES));

    let rows = store
        .claim_next_page(session_id, &ParticipantId::generate(), ttl(), 1)
        .await
        .unwrap();
    assert_eq!(rows, vec![ClaimRow::finished()]);
}

#[tokio::test]
async fn last_completion_finishes_the_session() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let reader = ParticipantId::generate();

    let rows = store
        .claim_next_page(session_id, &reader, ttl(), u32::from(TOTAL_PAGES))
        .await
        .unwrap();

    let mut last = None;
    for row in rows {
        let result = store
            .complete_page(
                session_id,
                row.page_number.unwrap(),
                &reader,
                row.lease_token.as_ref().unwrap(),
            )
            .await
            .unwrap();
        assert!(result.is_completed());
        last = Some(result);
    }

    let last = last.unwrap();
    assert_eq!(last.completed_count, u32::from(TOTAL_PAGES));
    assert!(last.finished);

    let session = store.get_session(session_id).await.unwrap();
    assert!(session.is_finished());
    assert!(!session.active);
    assert!(store.latest_active_session().await.unwrap().is_none());
}

#[tokio::test]
async fn subscribe_streams_transitions_of_one_session() {
    let (store, clock) = store_with_clock();
    let session_id = store.create_session().await.unwrap();
    let other = store.create_session().await.unwrap();
    let mut events = store.subscribe(session_id).await.unwrap();

    let alice = ParticipantId::generate();
    claim_one(&store, other, &alice).await;
    let (page_number, token) = claim_one(&store, session_id, &alice).await;
    store
        .complete_page(session_id, page_number, &alice, &token)
        .await
        .unwrap();
    let bob = ParticipantId::generate();
    claim_one(&store, session_id, &bob).await;
    clock.advance(ttl() + Duration::seconds(1));
    store
        .release_expired_assignments(session_id, ttl())
        .await
        .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.session_id, session_id);
        statuses.push((event.kind.page_number().get(), event.kind.status()));
    }
    assert_eq!(
        statuses,
        vec![
            (1, PageStatus::Assigned),
            (1, PageStatus::Completed),
            (2, PageStatus::Assigned),
            (2, PageStatus::Available),
        ]
    );
}

#[tokio::test]
async fn listed_pages_never_expose_tokens() {
    let store = MemoryStore::new();
    let session_id = store.create_session().await.unwrap();
    let alice = ParticipantId::generate();
    let (_, token) = claim_one(&store, session_id, &alice).await;

    let listing = serde_json::to_string(&store.list_pages(session_id).await.unwrap()).unwrap();
    assert!(!listing.contains(token.expose()));
    assert!(!format!("{token:?}").contains(token.expose()));
}
