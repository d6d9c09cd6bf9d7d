//! Storage layer tests for the ticket ledger.

use super::db::TicketDatabase;
use super::models::Grant;
use super::queries::DebitOutcome;

const NOW: i64 = 1_714_564_800_000;
const DAY: i64 = 86_400_000;

async fn test_db() -> TicketDatabase {
    TicketDatabase::open_in_memory().await.unwrap()
}

fn grant(token: &str, bytes: i64, days: i64, pay_order: &str) -> Grant {
    Grant {
        token: token.to_string(),
        bytes,
        days,
        buy_order: format!("buy-{pay_order}"),
        pay_order: pay_order.to_string(),
    }
}

async fn balances(db: &TicketDatabase, token: &str) -> Vec<i64> {
    db.list_tickets(token, 10)
        .await
        .unwrap()
        .iter()
        .map(|t| t.bytes)
        .collect()
}

// === Create tests ===

#[tokio::test]
async fn create_and_list_ticket() {
    let db = test_db().await;
    assert!(db.create_ticket(&grant("foo", 100, 1, "p1"), NOW).await.unwrap());

    let tickets = db.list_tickets("foo", 10).await.unwrap();
    assert_eq!(tickets.len(), 1);
    let t = &tickets[0];
    assert_eq!(t.token, "foo");
    assert_eq!(t.bytes, 100);
    assert_eq!(t.total_bytes, 100);
    assert_eq!(t.pay_order, "p1");
    assert_eq!(t.buy_order, "buy-p1");
    assert_eq!(t.created, NOW);
    assert_eq!(t.updated, NOW);
    assert_eq!(t.expires, NOW + DAY);
}

#[tokio::test]
async fn duplicate_pay_order_is_idempotent() {
    let db = test_db().await;
    assert!(db.create_ticket(&grant("foo", 100, 1, "p1"), NOW).await.unwrap());
    db.debit("foo", 30, NOW).await.unwrap();

    assert!(!db.create_ticket(&grant("foo", 100, 1, "p1"), NOW).await.unwrap());
    assert_eq!(balances(&db, "foo").await, vec![70]);
}

#[tokio::test]
async fn pay_order_is_unique_across_tokens() {
    let db = test_db().await;
    assert!(db.create_ticket(&grant("foo", 100, 1, "p1"), NOW).await.unwrap());
    assert!(!db.create_ticket(&grant("bar", 100, 1, "p1"), NOW).await.unwrap());
    assert!(db.list_tickets("bar", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn renewal_chains_expiry() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 30, "p1"), NOW).await.unwrap();
    db.create_ticket(&grant("foo", 100, 10, "p2"), NOW + DAY).await.unwrap();

    let tickets = db.list_tickets("foo", 10).await.unwrap();
    assert_eq!(tickets[0].expires, NOW + 40 * DAY);
    assert_eq!(tickets[1].expires, NOW + 30 * DAY);
}

#[tokio::test]
async fn short_renewal_of_long_expired_ticket_is_born_expired() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "p1"), NOW - 10 * DAY).await.unwrap();
    db.create_ticket(&grant("foo", 100, 1, "p2"), NOW).await.unwrap();

    let tickets = db.list_tickets("foo", 1).await.unwrap();
    assert_eq!(tickets[0].expires, NOW - 8 * DAY);
    assert_eq!(
        db.debit("foo", 1, NOW).await.unwrap(),
        DebitOutcome::NoActiveTicket
    );
}

#[tokio::test]
async fn renewal_chains_off_expired_ticket() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "p1"), NOW - 10 * DAY).await.unwrap();
    db.create_ticket(&grant("foo", 100, 30, "p2"), NOW).await.unwrap();

    let tickets = db.list_tickets("foo", 1).await.unwrap();
    assert_eq!(tickets[0].pay_order, "p2");
    assert_eq!(tickets[0].expires, NOW - 9 * DAY + 30 * DAY);
    assert_eq!(tickets[0].expires, NOW + 21 * DAY);
}

#[tokio::test]
async fn list_is_newest_first_and_limited() {
    let db = test_db().await;
    for (i, bytes) in [10, 20, 30].into_iter().enumerate() {
        db.create_ticket(&grant("foo", bytes, 1, &format!("p{i}")), NOW)
            .await
            .unwrap();
    }
    db.create_ticket(&grant("bar", 99, 1, "other"), NOW).await.unwrap();

    assert_eq!(balances(&db, "foo").await, vec![30, 20, 10]);
    let limited = db.list_tickets("foo", 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].bytes, 30);
    assert!(db.list_tickets("nobody", 10).await.unwrap().is_empty());
}

// === Cost tests ===

#[tokio::test]
async fn cost_sequence() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "a"), NOW).await.unwrap();

    assert_eq!(db.debit("foo", 50, NOW).await.unwrap(), DebitOutcome::Fast);
    assert_eq!(balances(&db, "foo").await, vec![50]);

    db.create_ticket(&grant("foo", 30, 1, "b"), NOW).await.unwrap();
    db.create_ticket(&grant("foo", 40, 1, "c"), NOW).await.unwrap();

    assert_eq!(
        db.debit("foo", 110, NOW).await.unwrap(),
        DebitOutcome::Slow { touched: 3 }
    );
    assert_eq!(balances(&db, "foo").await, vec![10, 0, 0]);

    assert_eq!(
        db.debit("foo", 20, NOW).await.unwrap(),
        DebitOutcome::Slow { touched: 1 }
    );
    assert_eq!(balances(&db, "foo").await, vec![-10, 0, 0]);

    db.create_ticket(&grant("foo", 40, 1, "d"), NOW).await.unwrap();
    db.create_ticket(&grant("foo", 10, 1, "e"), NOW).await.unwrap();

    db.debit("foo", 65, NOW).await.unwrap();
    assert_eq!(balances(&db, "foo").await, vec![-15, 0, -10, 0, 0]);
}

#[tokio::test]
async fn cost_slow_drains_oldest_first() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 10, 1, "a"), NOW).await.unwrap();
    db.create_ticket(&grant("foo", 30, 1, "b"), NOW).await.unwrap();

    db.debit("foo", 20, NOW).await.unwrap();
    assert_eq!(balances(&db, "foo").await, vec![20, 0]);
}

#[tokio::test]
async fn single_ticket_overdraft() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "a"), NOW).await.unwrap();

    db.debit("foo", 150, NOW).await.unwrap();
    assert_eq!(balances(&db, "foo").await, vec![-50]);
}

#[tokio::test]
async fn cost_touches_updated() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "a"), NOW).await.unwrap();

    db.debit("foo", 1, NOW + 5).await.unwrap();
    let t = &db.list_tickets("foo", 1).await.unwrap()[0];
    assert_eq!(t.updated, NOW + 5);
    assert_eq!(t.created, NOW);
}

#[tokio::test]
async fn expired_tickets_are_not_debited() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "old"), NOW - 10 * DAY).await.unwrap();

    assert_eq!(
        db.debit("foo", 10, NOW).await.unwrap(),
        DebitOutcome::NoActiveTicket
    );
    assert_eq!(balances(&db, "foo").await, vec![100]);
}

#[tokio::test]
async fn expired_ticket_is_skipped_for_active_one() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 100, 1, "old"), NOW - 10 * DAY).await.unwrap();
    // Chains off the old expiry: NOW - 9d + 30d.
    db.create_ticket(&grant("foo", 50, 30, "new"), NOW).await.unwrap();

    assert_eq!(db.debit("foo", 10, NOW).await.unwrap(), DebitOutcome::Fast);
    assert_eq!(balances(&db, "foo").await, vec![40, 100]);
}

#[tokio::test]
async fn exhausted_token_has_nothing_to_debit() {
    let db = test_db().await;
    db.create_ticket(&grant("foo", 10, 1, "a"), NOW).await.unwrap();
    db.debit("foo", 10, NOW).await.unwrap();

    assert_eq!(
        db.debit("foo", 1, NOW).await.unwrap(),
        DebitOutcome::NoActiveTicket
    );
    assert_eq!(
        db.debit("unknown", 1, NOW).await.unwrap(),
        DebitOutcome::NoActiveTicket
    );
}

#[tokio::test]
async fn ticket_serializes_without_token() {
    let db = test_db().await;
    db.create_ticket(&grant("secret-token", 100, 1, "p1"), NOW).await.unwrap();
    let t = &db.list_tickets("secret-token", 1).await.unwrap()[0];

    let json = serde_json::to_value(t).unwrap();
    assert!(json.get("token").is_none());
    assert_eq!(json["bytes"], 100);
    assert_eq!(json["created"], "2024-05-01T12:00:00.000Z");
    assert_eq!(json["expires"], "2024-05-02T12:00:00.000Z");
}

#[tokio::test]
async fn open_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tickets.db");
    {
        let db = TicketDatabase::open(&path).await.unwrap();
        db.create_ticket(&grant("foo", 100, 1, "p1"), NOW).await.unwrap();
        db.pool().close().await;
    }
    let db = TicketDatabase::open(&path).await.unwrap();
    assert_eq!(balances(&db, "foo").await, vec![100]);
}
