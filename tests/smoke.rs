//! Basic smoke test to verify the public API is wired together.

#[test]
fn crate_compiles() {
    // If this test runs, the crate skeleton is valid.
    let _ = std::any::type_name::<paywarden::EntitlementsConfig>();
    let _ = std::any::type_name::<paywarden::EntitlementsManager>();
    let _ = std::any::type_name::<paywarden::PaywardenError>();
}

#[tokio::test]
async fn manager_builds_with_default_collaborators() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage = paywarden::FileStorage::with_path(storage_dir.path().to_path_buf()).unwrap();
    let collaborators = paywarden::Collaborators::new(
        std::sync::Arc::new(paywarden::HttpFetcher::new("smoke-test").unwrap()),
        std::sync::Arc::new(storage),
    );
    let config = paywarden::EntitlementsConfig::new("news.example", "https://api.example/swg/v1")
        .with_product("news.example:basic");

    let manager = paywarden::EntitlementsManager::new(config, collaborators).unwrap();
    assert_eq!(manager.config().publication_id, "news.example");
    assert_eq!(manager.resolution_phase(), paywarden::ResolutionPhase::Idle);
}
