//! 规划器的集成测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use layercake::{keys, provide, Environment, Layer, LayerError, Planner, PlannerConfig, TypeKey};
use parking_lot::Mutex;
use tokio::time::{sleep, Duration};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

#[derive(Debug)]
struct AppConfig {
    url: String,
}

#[derive(Debug)]
struct DbConn {
    url: String,
}

#[derive(Debug)]
struct AppService {
    db_url: String,
}

struct Cache;
struct Metrics;

fn config_layer(log: Log) -> Layer {
    Layer::service("Config", keys![], move |_| {
        let log = log.clone();
        async move {
            log.lock().push("build Config".to_string());
            Ok(AppConfig {
                url: "postgres://localhost/app".to_string(),
            })
        }
    })
}

fn db_layer(log: Log) -> Layer {
    let release_log = log.clone();
    Layer::scoped(
        "Db",
        keys![AppConfig],
        move |env: Environment| {
            let log = log.clone();
            async move {
                let config = env.get_service::<AppConfig>()?;
                log.lock().push("build Db".to_string());
                Ok(DbConn {
                    url: config.url.clone(),
                })
            }
        },
        move |_conn: Arc<DbConn>| {
            let log = release_log.clone();
            async move {
                log.lock().push("closed".to_string());
                Ok(())
            }
        },
    )
}

fn app_layer(log: Log) -> Layer {
    Layer::from_fn("App", keys![DbConn], keys![AppService], move |env, scope| {
        let log = log.clone();
        async move {
            let db = env.get_service::<DbConn>()?;
            log.lock().push("build App".to_string());
            let teardown_log = log.clone();
            scope.add_finalizer("App", move || async move {
                teardown_log.lock().push("teardown App".to_string());
                Ok(())
            })?;
            Ok(Environment::empty().add(AppService {
                db_url: db.url.clone(),
            }))
        }
    })
}

#[tokio::test]
async fn test_config_db_app_scenario() {
    let log = new_log();
    let graph = config_layer(log.clone())
        .and_then(&db_layer(log.clone()))
        .and_then(&app_layer(log.clone()));

    let (env, handle) = provide(&keys![AppService], &graph).await.unwrap();

    assert_eq!(entries(&log), vec!["build Config", "build Db", "build App"]);
    assert_eq!(env.keys(), keys![AppService]);
    assert!(matches!(env.get_service::<DbConn>(), Err(LayerError::MissingService(_))));
    assert_eq!(env.get_service::<AppService>().unwrap().db_url, "postgres://localhost/app");

    handle.close().await.unwrap();
    handle.close().await.unwrap();

    let log = entries(&log);
    assert_eq!(&log[3..], ["teardown App", "closed"]);
    assert_eq!(log.iter().filter(|entry| *entry == "closed").count(), 1);
}

#[tokio::test]
async fn test_memoized_layer_is_built_once_across_branches() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let config = Layer::service("Config", keys![], move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            sleep(Duration::from_millis(10)).await;
            Ok(AppConfig { url: "shared".into() })
        }
    })
    .memo();

    let db = config.and_then(&Layer::service("Db", keys![AppConfig], |env: Environment| async move {
        let config = env.get_service::<AppConfig>()?;
        Ok(DbConn {
            url: config.url.clone(),
        })
    }));
    let cache = config.and_then(&Layer::service("Cache", keys![AppConfig], |_| async {
        Ok(Cache)
    }));
    let metrics = config.and_then(&Layer::service("Metrics", keys![AppConfig], |_| async {
        Ok(Metrics)
    }));
    let graph = Layer::zip_all([&db, &cache, &metrics]).unwrap();

    let planner = Planner::default();
    let (env, handle) = planner.provide(&keys![DbConn, Cache, Metrics], &graph).await.unwrap();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(env.get_service::<DbConn>().unwrap().url, "shared");
    let stats = planner.stats();
    assert_eq!(stats.memo_builds, 1);
    assert_eq!(stats.memo_hits, 2);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_memo_is_fresh_per_provide() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let config = Layer::service("Config", keys![], move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(AppConfig { url: String::new() }) }
    })
    .memo();

    provide(&keys![AppConfig], &config).await.unwrap();
    provide(&keys![AppConfig], &config).await.unwrap();

    assert_eq!(builds.load(Ordering::SeqCst), 2);
}

fn recording_resource(name: &'static str, log: Log) -> Layer {
    Layer::from_fn(name, keys![], keys![], move |_, scope| {
        let log = log.clone();
        async move {
            scope.add_finalizer(name, move || async move {
                log.lock().push(name.to_string());
                Ok(())
            })?;
            Ok(Environment::empty())
        }
    })
}

#[tokio::test]
async fn test_failure_unwinds_in_reverse_order() {
    let log = new_log();
    let failing = Layer::service("Broken", keys![], |_| async {
        Err::<AppService, _>(anyhow::anyhow!("boom"))
    });
    let graph = recording_resource("F1", log.clone())
        .and_then_keep(&recording_resource("F2", log.clone()))
        .and_then_keep(&failing);

    let err = provide(&keys![AppService], &graph).await.unwrap_err();

    assert!(matches!(err, LayerError::LayerBuild { ref layer, .. } if layer == "Broken"));
    assert_eq!(entries(&log), vec!["F2", "F1"]);
}

#[tokio::test]
async fn test_zip_rejects_duplicate_outputs_before_building() {
    let builds = Arc::new(AtomicUsize::new(0));
    let make = |name: &'static str| {
        let counter = builds.clone();
        Layer::service(name, keys![], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(AppConfig { url: String::new() }) }
        })
    };

    let err = make("left").zip(&make("right")).unwrap_err();

    assert!(matches!(err, LayerError::AmbiguousBinding(key) if key == TypeKey::of::<AppConfig>()));
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_zip_merges_disjoint_outputs() {
    let x = Layer::succeed(Cache);
    let y = Layer::succeed(Metrics);

    let both = x.zip(&y).unwrap();
    assert_eq!(both.outputs(), &keys![Cache, Metrics]);

    let (env, _handle) = provide(&keys![Cache, Metrics], &both).await.unwrap();
    assert_eq!(env.len(), 2);
}

#[tokio::test]
async fn test_zip_branches_run_concurrently() {
    let slow = |name: &'static str| {
        Layer::from_fn(name, keys![], keys![], |_, _| async {
            sleep(Duration::from_millis(100)).await;
            Ok(Environment::empty())
        })
    };
    let graph = slow("a").zip(&slow("b")).unwrap();

    let start = Instant::now();
    provide(&keys![], &graph).await.unwrap();

    assert!(start.elapsed() < Duration::from_millis(190));
}

#[tokio::test]
async fn test_max_concurrency_serializes_leaf_builds() {
    let slow = |name: &'static str| {
        Layer::from_fn(name, keys![], keys![], |_, _| async {
            sleep(Duration::from_millis(50)).await;
            Ok(Environment::empty())
        })
    };
    let graph = slow("a").zip(&slow("b")).unwrap();
    let planner = Planner::new(PlannerConfig::default().with_max_concurrency(1));

    let start = Instant::now();
    planner.provide(&keys![], &graph).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_failing_branch_cancels_sibling_and_releases_its_resources() {
    let log = new_log();
    let sibling_log = log.clone();
    let sibling = Layer::from_fn("Sibling", keys![], keys![Cache], move |_, scope| {
        let log = sibling_log.clone();
        async move {
            scope.add_finalizer("Sibling", move || async move {
                log.lock().push("released Sibling".to_string());
                Ok(())
            })?;
            sleep(Duration::from_secs(5)).await;
            Ok(Environment::empty().add(Cache))
        }
    });
    let failing = Layer::service("Failing", keys![], |_| async {
        sleep(Duration::from_millis(20)).await;
        Err::<Metrics, _>(anyhow::anyhow!("connection refused"))
    });
    let graph = sibling.zip(&failing).unwrap();

    let start = Instant::now();
    let err = provide(&keys![Cache, Metrics], &graph).await.unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, LayerError::LayerBuild { ref layer, .. } if layer == "Failing"));
    assert_eq!(entries(&log), vec!["released Sibling"]);
}

#[tokio::test]
async fn test_build_and_release_errors_are_reported_together() {
    let leaky = Layer::from_fn("Leaky", keys![], keys![], |_, scope| async move {
        scope.add_finalizer("Leaky", || async { Err(anyhow::anyhow!("socket already closed")) })?;
        Ok(Environment::empty())
    });
    let failing = Layer::service("Failing", keys![], |_| async {
        Err::<Cache, _>(anyhow::anyhow!("boom"))
    });
    let graph = leaky.and_then_keep(&failing);

    let err = provide(&keys![Cache], &graph).await.unwrap_err();

    match &err {
        LayerError::Aggregated { primary, releases } => {
            assert!(matches!(**primary, LayerError::LayerBuild { .. }));
            assert_eq!(releases.len(), 1);
        }
        other => panic!("expected aggregated error, got {other}"),
    }
    assert_eq!(err.release_errors().len(), 1);
}

#[tokio::test]
async fn test_release_failure_after_success_becomes_primary_error() {
    let leaky = Layer::scoped(
        "Leaky",
        keys![],
        |_| async { Ok(Cache) },
        |_cache: Arc<Cache>| async { Err(anyhow::anyhow!("flush failed")) },
    );
    let planner = Planner::default();

    let result = planner
        .run_with(&keys![Cache], &leaky, |env| async move {
            env.get_service::<Cache>()?;
            Ok(42)
        })
        .await;

    assert!(matches!(
        result,
        Err(LayerError::ResourceRelease(ref releases)) if releases.len() == 1
    ));
    assert_eq!(planner.stats().release_failures, 1);
}

#[tokio::test]
async fn test_run_with_releases_after_consumer() {
    let log = new_log();
    let graph = config_layer(log.clone()).and_then(&db_layer(log.clone()));

    let url = Planner::default()
        .run_with(&keys![DbConn], &graph, |env| async move {
            Ok(env.get_service::<DbConn>()?.url.clone())
        })
        .await
        .unwrap();

    assert_eq!(url, "postgres://localhost/app");
    assert_eq!(entries(&log).last().map(String::as_str), Some("closed"));
}

#[tokio::test]
async fn test_provide_in_binds_resources_to_parent_scope() {
    let log = new_log();
    let parent = layercake::Scope::new("request");
    let graph = config_layer(log.clone()).and_then(&db_layer(log.clone()));

    let env = Planner::default()
        .provide_in(&parent, Environment::empty(), &keys![DbConn], &graph)
        .await
        .unwrap();
    assert!(env.contains(&TypeKey::of::<DbConn>()));
    assert!(!entries(&log).contains(&"closed".to_string()));

    parent.close().await.unwrap();
    assert_eq!(entries(&log).last().map(String::as_str), Some("closed"));
}

#[tokio::test]
async fn test_key_cycle_is_rejected_before_building() {
    let builds = Arc::new(AtomicUsize::new(0));
    let cache_builds = builds.clone();
    let metrics_builds = builds.clone();
    let cache = Layer::service("Cache", keys![Metrics], move |_| {
        cache_builds.fetch_add(1, Ordering::SeqCst);
        async { Ok(Cache) }
    });
    let metrics = Layer::service("Metrics", keys![Cache], move |_| {
        metrics_builds.fetch_add(1, Ordering::SeqCst);
        async { Ok(Metrics) }
    });

    let side_by_side = cache.zip(&metrics).unwrap();
    let err = provide(&keys![Cache, Metrics], &side_by_side).await.unwrap_err();
    match err {
        LayerError::CyclicDependency(path) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&"Cache".to_string()));
            assert!(path.contains(&"Metrics".to_string()));
        }
        other => panic!("expected a cycle, got {other}"),
    }

    let sequenced = cache.and_then(&metrics);
    let err = provide(&keys![Metrics], &sequenced).await.unwrap_err();
    assert!(matches!(err, LayerError::CyclicDependency(_)));
    assert!(err.is_construction_error());

    assert_eq!(builds.load(Ordering::SeqCst), 0);
}
