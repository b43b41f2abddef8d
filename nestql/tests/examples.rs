//! Runs every bundled example; each one asserts its own results.

#[tokio::test]
async fn example01_queries() {
    nestql::examples::example01_queries::run()
        .await
        .expect("example should succeed");
}

#[tokio::test]
async fn example02_nested_writes() {
    nestql::examples::example02_nested_writes::run()
        .await
        .expect("example should succeed");
}

#[tokio::test]
async fn example03_permissions() {
    nestql::examples::example03_permissions::run()
        .await
        .expect("example should succeed");
}

#[tokio::test]
async fn example04_router() {
    nestql::examples::example04_router::run()
        .await
        .expect("example should succeed");
}
