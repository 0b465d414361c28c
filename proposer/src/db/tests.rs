use anyhow::Result;

use super::{ProofStore, RequestStatus, RequestType, StoreError};

async fn store() -> ProofStore {
    ProofStore::new("sqlite::memory:").await.expect("in-memory store")
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;

    let req = db.fetch_request(id).await?;
    assert_eq!(req.req_type, RequestType::Span);
    assert_eq!(req.start_block, 1001);
    assert_eq!(req.end_block, 1100);
    assert_eq!(req.status, RequestStatus::Unrequested);
    assert_eq!(req.prover_request_id, None);
    assert_eq!(req.proof, None);
    Ok(())
}

#[tokio::test]
async fn rejects_overlapping_spans() -> Result<()> {
    let db = store().await;
    db.new_entry(RequestType::Span, 1001, 1100).await?;

    // Exact duplicate, partial overlap on either side, containment.
    for (start, end) in [(1001, 1100), (1050, 1150), (950, 1001), (1010, 1020)] {
        let err = db.new_entry(RequestType::Span, start, end).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }), "[{start}, {end}] not rejected");
    }

    // Adjacent ranges and other types are fine.
    db.new_entry(RequestType::Span, 1101, 1200).await?;
    db.new_entry(RequestType::Aggregation, 1001, 1200).await?;
    Ok(())
}

#[tokio::test]
async fn failed_span_no_longer_blocks_its_range() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;
    db.update_status(id, RequestStatus::Requested).await?;
    db.update_status(id, RequestStatus::Failed).await?;

    db.new_entry(RequestType::Span, 1001, 1050).await?;
    db.new_entry(RequestType::Span, 1051, 1100).await?;
    Ok(())
}

#[tokio::test]
async fn unrequested_entries_are_ordered() -> Result<()> {
    let db = store().await;
    db.new_entry(RequestType::Span, 1201, 1300).await?;
    db.new_entry(RequestType::Span, 1001, 1100).await?;
    db.new_entry(RequestType::Span, 1101, 1200).await?;

    let starts: Vec<i64> =
        db.get_all_unrequested().await?.iter().map(|r| r.start_block).collect();
    assert_eq!(starts, vec![1001, 1101, 1201]);
    Ok(())
}

#[tokio::test]
async fn status_only_moves_forward() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;

    // Complete before Requested is illegal.
    assert!(matches!(
        db.update_status(id, RequestStatus::Complete).await.unwrap_err(),
        StoreError::IllegalTransition { .. }
    ));

    db.update_status(id, RequestStatus::Requested).await?;
    let req = db.fetch_request(id).await?;
    assert!(req.request_time.is_some(), "entering Requested must stamp request_time");

    db.update_status(id, RequestStatus::Complete).await?;

    // No way back, and no terminal-to-terminal hops.
    for status in [RequestStatus::Unrequested, RequestStatus::Requested, RequestStatus::Failed] {
        assert!(matches!(
            db.update_status(id, status).await.unwrap_err(),
            StoreError::IllegalTransition { .. }
        ));
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_request_transition_has_one_winner() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;

    let (first, second) = tokio::join!(
        db.update_status(id, RequestStatus::Requested),
        db.update_status(id, RequestStatus::Requested),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(StoreError::IllegalTransition { .. }))));
    Ok(())
}

#[tokio::test]
async fn prover_request_id_set_once_while_requested() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;

    // Not yet requested.
    assert!(db.set_prover_request_id(id, "proof-1").await.is_err());

    db.update_status(id, RequestStatus::Requested).await?;
    db.set_prover_request_id(id, "proof-1").await?;
    assert_eq!(db.fetch_request(id).await?.prover_request_id.as_deref(), Some("proof-1"));

    // Second assignment is rejected.
    assert!(db.set_prover_request_id(id, "proof-2").await.is_err());
    assert_eq!(db.fetch_request(id).await?.prover_request_id.as_deref(), Some("proof-1"));
    Ok(())
}

#[tokio::test]
async fn add_proof_stores_bytes_and_completes() -> Result<()> {
    let db = store().await;
    let id = db.new_entry(RequestType::Span, 1001, 1100).await?;
    db.update_status(id, RequestStatus::Requested).await?;

    db.add_proof(id, &[0xDE, 0xAD, 0xBE, 0xEF]).await?;
    let req = db.fetch_request(id).await?;
    assert_eq!(req.status, RequestStatus::Complete);
    assert_eq!(req.proof.as_deref(), Some(&[0xDE, 0xAD, 0xBE, 0xEF][..]));

    // Terminal; a second proof is rejected.
    assert!(db.add_proof(id, &[0x00]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn latest_end_block_ignores_failed_entries() -> Result<()> {
    let db = store().await;
    assert!(matches!(db.get_latest_end_block().await.unwrap_err(), StoreError::NotFound));

    db.new_entry(RequestType::Span, 1001, 1100).await?;
    let failed = db.new_entry(RequestType::Span, 1101, 1200).await?;
    assert_eq!(db.get_latest_end_block().await?, 1200);

    db.update_status(failed, RequestStatus::Requested).await?;
    db.update_status(failed, RequestStatus::Failed).await?;
    assert_eq!(db.get_latest_end_block().await?, 1100);
    Ok(())
}

async fn complete_span(db: &ProofStore, start: i64, end: i64, proof: &[u8]) -> Result<i64> {
    let id = db.new_entry(RequestType::Span, start, end).await?;
    db.update_status(id, RequestStatus::Requested).await?;
    db.add_proof(id, proof).await?;
    Ok(id)
}

#[tokio::test]
async fn subproofs_require_an_exact_partition() -> Result<()> {
    let db = store().await;
    complete_span(&db, 1001, 1100, b"a").await?;
    complete_span(&db, 1101, 1200, b"b").await?;
    complete_span(&db, 1301, 1400, b"d").await?; // gap before this one

    let proofs = db.get_subproofs(1001, 1200).await?;
    assert_eq!(proofs, vec![b"a".to_vec(), b"b".to_vec()]);

    // Gap inside the requested range.
    assert!(matches!(
        db.get_subproofs(1001, 1400).await.unwrap_err(),
        StoreError::MissingPartition { .. }
    ));
    // Range not starting on a span boundary.
    assert!(matches!(
        db.get_subproofs(1050, 1200).await.unwrap_err(),
        StoreError::MissingPartition { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn agg_created_when_chain_reaches_minimum() -> Result<()> {
    let db = store().await;
    complete_span(&db, 1001, 1100, b"a").await?;
    complete_span(&db, 1101, 1200, b"b").await?;
    complete_span(&db, 1201, 1300, b"c").await?;

    let created = db.try_create_agg_proof_from_span_proofs(1001, 1300).await?;
    assert_eq!(created, Some((1001, 1300)));

    let aggs: Vec<_> = db
        .get_all_unrequested()
        .await?
        .into_iter()
        .filter(|r| r.req_type == RequestType::Aggregation)
        .collect();
    assert_eq!(aggs.len(), 1);
    assert_eq!((aggs[0].start_block, aggs[0].end_block), (1001, 1300));
    Ok(())
}

#[tokio::test]
async fn agg_not_created_when_chain_too_short_or_gapped() -> Result<()> {
    let db = store().await;
    complete_span(&db, 1001, 1100, b"a").await?;
    complete_span(&db, 1201, 1300, b"c").await?; // gap at [1101, 1200]

    // Chain from 1001 stops at 1100 < 1300.
    assert_eq!(db.try_create_agg_proof_from_span_proofs(1001, 1300).await?, None);
    // No chain starts at 999.
    assert_eq!(db.try_create_agg_proof_from_span_proofs(999, 1100).await?, None);
    Ok(())
}

#[tokio::test]
async fn only_one_active_agg_per_start_block() -> Result<()> {
    let db = store().await;
    complete_span(&db, 1001, 1100, b"a").await?;

    assert_eq!(
        db.try_create_agg_proof_from_span_proofs(1001, 1100).await?,
        Some((1001, 1100))
    );
    assert_eq!(db.try_create_agg_proof_from_span_proofs(1001, 1100).await?, None);
    Ok(())
}

#[tokio::test]
async fn l1_checkpoint_attaches_to_unrequested_agg() -> Result<()> {
    let db = store().await;
    complete_span(&db, 1001, 1100, b"a").await?;
    db.try_create_agg_proof_from_span_proofs(1001, 1100).await?;

    db.add_l1_block_info(1001, 1100, 19_000_000, "0xabc123").await?;
    let agg = db
        .get_all_unrequested()
        .await?
        .into_iter()
        .find(|r| r.req_type == RequestType::Aggregation)
        .expect("agg entry");
    assert_eq!(agg.l1_block_number, Some(19_000_000));
    assert_eq!(agg.l1_block_hash.as_deref(), Some("0xabc123"));

    // No matching unrequested AGG entry.
    assert!(matches!(
        db.add_l1_block_info(2001, 2100, 1, "0x00").await.unwrap_err(),
        StoreError::NotFound
    ));
    Ok(())
}
