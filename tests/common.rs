use clusterlib::{Factory, MemoryStorage, NotifyableKind, RepositoryConfig, Storage};
use std::sync::Arc;

pub fn new_storage() -> Arc<MemoryStorage> {
    Arc::new(MemoryStorage::new())
}

pub async fn new_factory(storage: &Arc<MemoryStorage>) -> Factory {
    let storage: Arc<dyn Storage> = storage.clone();
    Factory::new(storage, RepositoryConfig::default())
        .await
        .expect("failed to build factory")
}

/// An application with a random name, created under the root.
pub async fn random_application(factory: &Factory) -> Arc<clusterlib::Notifyable> {
    let root = factory.get_root().await.expect("failed to get root");
    root.get_child(NotifyableKind::Application, &random_str(10), true)
        .await
        .expect("failed to create application")
        .expect("application missing after create")
}

/// The node `<app_name>/n` as seen by one factory, creating the chain on
/// demand.
pub async fn node_in_app(
    factory: &Factory,
    app_name: &str,
    create: bool,
) -> Arc<clusterlib::Notifyable> {
    factory
        .get_root()
        .await
        .expect("failed to get root")
        .get_application(app_name, create)
        .await
        .expect("failed to resolve application")
        .expect("application missing")
        .get_node("n", create)
        .await
        .expect("failed to resolve node")
        .expect("node missing")
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
