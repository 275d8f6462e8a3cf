mod common;

use common::{Call, MockFactory};
use std::sync::atomic::Ordering;
use tandem_coordinator::{TransactionError, XaResourceProducer};
use tandem_pool::HolderState;
use tandem_xa::flags::{TMJOIN, TMNOFLAGS, TMSUCCESS};
use tandem_xa::{ResourceConfig, Status};

#[tokio::test]
async fn test_connection_is_enlisted_and_released_after_completion() {
    let fx = common::start().await;
    let factory = MockFactory::default();
    let producer = common::pooling_producer(ResourceConfig::new("db"), factory.clone()).await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();

    let mut connection = producer.get_connection(Some(&tx)).await.unwrap();
    let id = connection.id();
    assert_eq!(tx.enlisted_resources(), vec!["db"]);
    let serial = connection.with_handle(Some(&tx), |handle| *handle).await.unwrap();
    connection.close(Some(&tx)).await.unwrap();
    assert_eq!(producer.pool().state_of(id), Some(HolderState::NotAccessible));

    // the same transaction gets its connection back
    let again = producer.get_connection(Some(&tx)).await.unwrap();
    assert_eq!(again.id(), id);
    again.close(Some(&tx)).await.unwrap();

    ctx.commit().await.unwrap();
    assert_eq!(tx.status(), Status::Committed);
    assert_eq!(producer.pool().state_of(id), Some(HolderState::InPool));

    let resource = factory.resources()[serial].clone();
    let xid = resource.started_xid().unwrap();
    let calls = resource.calls();
    assert_eq!(
        calls,
        vec![
            Call::Start(xid.clone(), TMNOFLAGS),
            Call::End(xid.clone(), TMSUCCESS),
            Call::Start(xid.clone(), TMJOIN),
            Call::End(xid.clone(), TMSUCCESS),
            Call::Commit(xid, true),
        ]
    );

    let stats = fx.manager.pool_statistics();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].unique_name, "db");
    assert_eq!(stats[0].in_pool, 1);
    assert_eq!(stats[0].not_accessible, 0);
}

#[tokio::test]
async fn test_connection_released_on_close_without_deferral() {
    let fx = common::start().await;
    let producer = common::pooling_producer(
        ResourceConfig::new("db").with_defer_connection_release(false),
        MockFactory::default(),
    )
    .await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();
    let connection = producer.get_connection(Some(&tx)).await.unwrap();
    let id = connection.id();
    connection.close(Some(&tx)).await.unwrap();
    assert_eq!(producer.pool().state_of(id), Some(HolderState::InPool));

    ctx.commit().await.unwrap();
    assert_eq!(tx.status(), Status::Committed);
}

#[tokio::test]
async fn test_two_connections_of_one_pool_join_a_single_branch() {
    let fx = common::start().await;
    let factory = MockFactory::default();
    let producer = common::pooling_producer(ResourceConfig::new("db"), factory.clone()).await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();
    let first = producer.get_connection(Some(&tx)).await.unwrap();
    first.close(Some(&tx)).await.unwrap();

    // the first one is reserved, so a second physical connection is created
    let second = producer.get_connection(None).await.unwrap();
    second.enlist(&tx).await.unwrap();
    second.close(Some(&tx)).await.unwrap();

    ctx.commit().await.unwrap();

    let commits: Vec<bool> = factory
        .resources()
        .iter()
        .flat_map(|resource| resource.commits())
        .collect();
    assert_eq!(commits, vec![true]);
}

#[tokio::test]
async fn test_connection_dropped_while_enlisted_returns_after_completion() {
    let fx = common::start().await;
    let producer = common::pooling_producer(ResourceConfig::new("db"), MockFactory::default()).await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();
    let connection = producer.get_connection(Some(&tx)).await.unwrap();
    let id = connection.id();
    drop(connection);
    assert_eq!(producer.pool().state_of(id), Some(HolderState::NotAccessible));

    ctx.commit().await.unwrap();
    assert_eq!(tx.status(), Status::Committed);
    assert_eq!(producer.pool().state_of(id), Some(HolderState::InPool));

    let stats = producer.statistics().unwrap();
    assert_eq!(stats.in_pool, stats.total);
}

#[tokio::test]
async fn test_local_use_depends_on_configuration() {
    let fx = common::start().await;
    let strict = common::pooling_producer(ResourceConfig::new("strict"), MockFactory::default()).await;
    let lenient = common::pooling_producer(
        ResourceConfig::new("lenient").with_allow_local_transactions(true),
        MockFactory::default(),
    )
    .await;
    fx.manager.register_resource(strict.clone()).await.unwrap();
    fx.manager.register_resource(lenient.clone()).await.unwrap();

    let mut connection = strict.get_connection(None).await.unwrap();
    let err = connection.with_handle(None, |_| ()).await.unwrap_err();
    assert!(matches!(err, TransactionError::IllegalState(_)));
    connection.close(None).await.unwrap();

    let mut connection = lenient.get_connection(None).await.unwrap();
    connection.with_handle(None, |_| ()).await.unwrap();
    let id = connection.id();
    connection.close(None).await.unwrap();
    assert_eq!(lenient.pool().state_of(id), Some(HolderState::InPool));
}

#[tokio::test]
async fn test_no_enlistment_without_automatic_enlisting() {
    let fx = common::start().await;
    let producer = common::pooling_producer(
        ResourceConfig::new("db").with_automatic_enlisting(false),
        MockFactory::default(),
    )
    .await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();
    let connection = producer.get_connection(Some(&tx)).await.unwrap();
    assert!(tx.enlisted_resources().is_empty());

    connection.enlist(&tx).await.unwrap();
    assert_eq!(tx.enlisted_resources(), vec!["db"]);
    connection.close(Some(&tx)).await.unwrap();
    ctx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_failed_pool_recovers_before_serving() {
    let fx = common::start().await;
    let factory = MockFactory::default();
    factory.fail_creation.store(true, Ordering::SeqCst);
    let producer = common::pooling_producer(ResourceConfig::new("db"), factory.clone()).await;

    let report = fx.manager.register_resource(producer.clone()).await.unwrap();
    assert!(report.failures.contains_key("db"));
    assert!(producer.pool().is_failed());
    assert!(producer.statistics().unwrap().failed);

    factory.fail_creation.store(false, Ordering::SeqCst);
    let mut ctx = fx.manager.context();
    let tx = ctx.begin().unwrap();
    let connection = producer.get_connection(Some(&tx)).await.unwrap();
    assert!(!producer.pool().is_failed());
    connection.close(Some(&tx)).await.unwrap();
    ctx.commit().await.unwrap();

    // one connection for the recovery scan, one for the transaction
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_closed_pool_refuses_connections() {
    let fx = common::start().await;
    let producer = common::pooling_producer(ResourceConfig::new("db"), MockFactory::default()).await;
    fx.manager.register_resource(producer.clone()).await.unwrap();

    fx.manager.shutdown().await;
    assert!(producer.pool().is_closed());
    assert!(matches!(
        producer.get_connection(None).await,
        Err(TransactionError::Pool(_))
    ));
}
