use caseflow::db::Db;
use caseflow::engine::ClaimStrategy;
use caseflow::model::{NewWorkItem, Status};
use caseflow::store::{SubmitResult, WorkStore};
use chrono::Utc;
use serde_json::json;

#[tokio::test]
async fn connects_and_migrates() {
    let db = Db::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    assert!(db.health_check().await.is_ok());
    // Migrations are idempotent.
    db.migrate().await.unwrap();
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("caseflow.db").display());

    let id = {
        let db = Db::connect(&url).await.unwrap();
        db.migrate().await.unwrap();
        let item = match db
            .submit(
                NewWorkItem::new("webp")
                    .dedup_key("case-42")
                    .payload(json!({"html": "<img src=\"https://x.test/a.png\">"})),
            )
            .await
            .unwrap()
        {
            SubmitResult::Created(item) => *item,
            _ => panic!("expected Created"),
        };
        let claimed = db
            .claim_next(&ClaimStrategy::new("webp").require_field("html"), Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        item.id
    };

    let db = Db::connect(&url).await.unwrap();
    db.migrate().await.unwrap();
    let item = db.get(id).await.unwrap();
    assert_eq!(item.status, Status::Claimed);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.dedup_key.as_deref(), Some("case-42"));
    assert_eq!(item.payload["html"], "<img src=\"https://x.test/a.png\">");
}
