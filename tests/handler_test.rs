//! Integration tests for the deployment registry and handler.

use std::sync::Arc;

use reconcile_rs::error::Error;
use reconcile_rs::handler::{Deployment, DeploymentHandler, DeploymentRegistry, ReconcileHandler};
use reconcile_rs::model::Key;
use reconcile_rs::model::service::HttpService;

fn handler() -> (DeploymentHandler, Arc<DeploymentRegistry>) {
    let registry = Arc::new(DeploymentRegistry::new());
    (DeploymentHandler::new(Arc::clone(&registry)), registry)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn create_assigns_identity_and_rejects_duplicates() {
    let registry = DeploymentRegistry::new();
    let svc = HttpService::new("web", "nginx:1", 1);

    let created = registry.create(Deployment::for_service(&svc)).unwrap();
    assert_eq!(created.metadata.resource_version, 1);
    assert!(!created.uid.is_nil());

    let dup = registry.create(Deployment::for_service(&svc));
    assert!(matches!(dup, Err(Error::AlreadyExists(_))));
    assert_eq!(registry.len(), 1);
}

#[test]
fn update_with_stale_version_conflicts() {
    let registry = DeploymentRegistry::new();
    let svc = HttpService::new("web", "nginx:1", 1);
    let created = registry.create(Deployment::for_service(&svc)).unwrap();

    let mut first = created.clone();
    first.image = "nginx:2".to_string();
    let updated = registry.update(first).unwrap();
    assert_eq!(updated.metadata.resource_version, 2);
    assert_eq!(updated.uid, created.uid);

    let mut stale = created;
    stale.image = "nginx:3".to_string();
    let err = registry.update(stale).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(registry.get(&Key::from("web")).unwrap().image, "nginx:2");
}

#[test]
fn update_and_delete_of_missing_deployment_fail() {
    let registry = DeploymentRegistry::new();
    let ghost = Deployment::for_service(&HttpService::new("ghost", "img", 1));

    assert!(matches!(registry.update(ghost), Err(Error::NotFound(_))));
    assert!(matches!(
        registry.delete(&Key::from("ghost")),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn list_is_sorted_by_key() {
    let registry = DeploymentRegistry::new();
    for name in ["c", "a", "b"] {
        registry
            .create(Deployment::for_service(&HttpService::new(name, "img", 1)))
            .unwrap();
    }
    let keys: Vec<String> = registry.list().iter().map(|d| d.key().to_string()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_builds_deployment_from_service() {
    let (handler, registry) = handler();
    let svc = HttpService::new("api", "api:1", 2).in_namespace("prod");

    handler.init().await.unwrap();
    handler.created(&svc).await.unwrap();

    let d = registry.get(&Key::from("prod/api")).unwrap();
    assert_eq!(d.image, "api:1");
    assert!(!d.get_enabled());
    assert!(d.put_enabled());
}

#[tokio::test]
async fn created_twice_is_idempotent() {
    let (handler, registry) = handler();
    let svc = HttpService::new("api", "api:1", 1);

    handler.created(&svc).await.unwrap();
    handler.created(&svc).await.unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(
        registry.get(&Key::from("api")).unwrap().metadata.resource_version,
        1
    );
}

#[tokio::test]
async fn created_with_stale_deployment_converges_it() {
    let (handler, registry) = handler();
    handler
        .created(&HttpService::new("api", "api:1", 1))
        .await
        .unwrap();

    handler
        .created(&HttpService::new("api", "api:2", 4))
        .await
        .unwrap();

    let d = registry.get(&Key::from("api")).unwrap();
    assert_eq!(d.image, "api:2");
    assert!(!d.get_enabled() && !d.put_enabled());
    assert_eq!(d.metadata.resource_version, 2);
}

#[tokio::test]
async fn updated_applies_image_and_access_mode() {
    let (handler, registry) = handler();
    let old = HttpService::new("web", "nginx:1", 1);
    let new = HttpService::new("web", "nginx:2", 3);
    handler.created(&old).await.unwrap();

    handler.updated(&old, &new).await.unwrap();

    let d = registry.get(&Key::from("web")).unwrap();
    assert_eq!(d.image, "nginx:2");
    assert!(d.get_enabled() && d.put_enabled());
}

#[tokio::test]
async fn updated_recreates_missing_deployment() {
    let (handler, registry) = handler();
    let old = HttpService::new("web", "nginx:1", 1);
    let new = HttpService::new("web", "nginx:2", 1);

    handler.updated(&old, &new).await.unwrap();
    assert_eq!(registry.get(&Key::from("web")).unwrap().image, "nginx:2");
}

#[tokio::test]
async fn deleted_removes_and_tolerates_absence() {
    let (handler, registry) = handler();
    let svc = HttpService::new("web", "nginx:1", 1);
    handler.created(&svc).await.unwrap();

    handler.deleted(&svc).await.unwrap();
    assert!(registry.is_empty());

    // already gone
    handler.deleted(&svc).await.unwrap();
}
