//! Async store facade on a tokio runtime

use rustmetadb::meta::{MetalakeEntity, RoleEntity, UserEntity};
use rustmetadb::{AuditInfo, DbError, Entity, EntityType, MetaStore, NameIdentifier, Namespace};

fn audit() -> AuditInfo {
    AuditInfo::created_by("async")
}

#[tokio::test]
async fn test_crud_round_trip() {
    let meta = MetaStore::in_memory().unwrap();
    let store = meta.async_store();
    let lake: Entity = MetalakeEntity::new(1, "lake", audit()).unwrap().into();
    store.put(lake.clone(), false).await.unwrap();

    let ident = NameIdentifier::parse("lake").unwrap();
    assert_eq!(store.get(ident.clone(), EntityType::Metalake).await.unwrap(), lake);

    let renamed = store
        .update(ident.clone(), EntityType::Metalake, |mut entity| {
            entity.set_name("pond");
            Ok(entity)
        })
        .await
        .unwrap();
    assert_eq!(renamed.name(), "pond");
    assert!(!store.exists(ident, EntityType::Metalake).await.unwrap());

    let pond = NameIdentifier::parse("pond").unwrap();
    assert!(store.delete(pond.clone(), EntityType::Metalake, false).await.unwrap());
    let err = store.get(pond, EntityType::Metalake).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_puts_from_tasks() {
    let meta = MetaStore::in_memory().unwrap();
    let store = meta.async_store();
    store
        .put(MetalakeEntity::new(1, "lake", audit()).unwrap().into(), false)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16i64 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let user = UserEntity::new(100 + i, Namespace::of(["lake"]), format!("user{}", i), audit())
                .unwrap()
                .with_roles(vec![if i % 2 == 0 { "even" } else { "odd" }.to_string()]);
            store.put(user.into(), false).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let users = store
        .list(Namespace::of(["lake"]), EntityType::User)
        .await
        .unwrap();
    assert_eq!(users.len(), 16);

    let even = store
        .list_users_by_role("lake".to_string(), "even".to_string())
        .await
        .unwrap();
    assert_eq!(even.len(), 8);
}

#[tokio::test]
async fn test_sweep_through_async_facade() {
    let meta = MetaStore::in_memory().unwrap();
    let store = meta.async_store();
    store
        .put(MetalakeEntity::new(1, "lake", audit()).unwrap().into(), false)
        .await
        .unwrap();
    store
        .put(
            RoleEntity::new(2, Namespace::of(["lake"]), "reader", "lake", audit())
                .unwrap()
                .into(),
            false,
        )
        .await
        .unwrap();
    store
        .delete(NameIdentifier::parse("lake.reader").unwrap(), EntityType::Role, false)
        .await
        .unwrap();

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
    let deleted = store
        .list_deleted_before(EntityType::Role, cutoff)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].name, "reader");
    assert_eq!(store.purge_deleted_before(EntityType::Role, cutoff).await.unwrap(), 1);
}
