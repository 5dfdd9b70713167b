use crawl_frontier::config::{QueueAssignment, QueueStoreKind, UniqFilterKind};
use crawl_frontier::journal::{JournalLine, JournalReader};
use crawl_frontier::models::{now_ms, status};
use crawl_frontier::*;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// No politeness waits and no retry delay, so tests never sleep.
fn quick_config() -> FrontierConfig {
    FrontierConfig {
        delay_factor: 0.0,
        min_delay_ms: 0,
        max_delay_ms: 0,
        retry_delay_secs: 0,
        journal: false,
        ..Default::default()
    }
}

fn persistent_config() -> FrontierConfig {
    FrontierConfig {
        queue_store: QueueStoreKind::Persistent,
        uniq_filter: UniqFilterKind::Persistent,
        ..quick_config()
    }
}

fn open(dir: &Path, config: FrontierConfig) -> Frontier {
    let ctx = CrawlContext::new(dir, &config).unwrap();
    Frontier::new(config, ctx).unwrap()
}

fn link(uri: &str) -> CrawlUri {
    CrawlUri::new(uri, "L", Some("http://seed.test/".to_string()))
}

/// Pull everything the frontier will hand out, finishing each with `code`.
fn drain(frontier: &Frontier, code: i32) -> Vec<String> {
    let mut fetched = Vec::new();
    while let Some(mut curi) = frontier.next().unwrap() {
        fetched.push(curi.uri.clone());
        curi.fetch_status = code;
        frontier.finished(curi).unwrap();
    }
    fetched
}

#[test]
fn test_same_uri_is_delivered_once() {
    let dir = TempDir::new().unwrap();
    let frontier = Arc::new(open(dir.path(), quick_config()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let frontier = Arc::clone(&frontier);
            thread::spawn(move || {
                for i in 0..50 {
                    frontier.schedule(link(&format!("http://h{}.test/page{}", i % 4, i)));
                    // Same URI, different spelling.
                    frontier.schedule(link(&format!("HTTP://H{}.test:80/page{}#top", i % 4, i)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    frontier.flush();

    assert_eq!(frontier.discovered_uri_count(), 50);
    assert_eq!(frontier.queued_uri_count(), 50);
    assert_eq!(
        frontier.queue_keys(),
        vec!["h0.test", "h1.test", "h2.test", "h3.test"]
    );

    let fetched = drain(&frontier, 200);
    assert_eq!(fetched.len(), 50);
    assert_eq!(frontier.succeeded_fetch_count(), 50);
    assert!(frontier.is_empty());
}

#[test]
fn test_high_priority_jumps_the_queue() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());

    frontier.schedule(link("http://a.test/1"));
    frontier.schedule(link("http://a.test/2"));
    frontier.schedule(link("http://a.test/3").with_directive(SchedulingDirective::High));

    assert_eq!(
        drain(&frontier, 200),
        vec!["http://a.test/3", "http://a.test/1", "http://a.test/2"]
    );
}

#[test]
fn test_connect_failure_retried_up_to_max_retries() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        max_retries: 3,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://down.test/"));

    let mut attempts = 0;
    let mut dispositions = Vec::new();
    while let Some(mut curi) = frontier.next().unwrap() {
        attempts += 1;
        assert_eq!(curi.fetch_attempts, attempts - 1);
        curi.fetch_status = status::CONNECT_FAILED;
        dispositions.push(frontier.finished(curi).unwrap());
    }

    assert_eq!(attempts, 3);
    assert_eq!(
        dispositions,
        vec![Disposition::Retried, Disposition::Retried, Disposition::Failed]
    );
    assert_eq!(frontier.failed_fetch_count(), 1);
    assert_eq!(frontier.queued_uri_count(), 0);
}

#[test]
fn test_deferred_uri_comes_back_at_once() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/needs-robots"));
    frontier.schedule(link("http://a.test/other"));

    let mut first = frontier.next().unwrap().unwrap();
    assert_eq!(first.uri, "http://a.test/needs-robots");
    first.fetch_status = status::DEFERRED;
    assert_eq!(frontier.finished(first).unwrap(), Disposition::Retried);

    // Back at MEDIUM, ahead of the NORMAL sibling.
    let again = frontier.next().unwrap().unwrap();
    assert_eq!(again.uri, "http://a.test/needs-robots");
    assert_eq!(again.directive, SchedulingDirective::Medium);
    assert_eq!(again.fetch_attempts, 1);
}

#[test]
fn test_total_budget_retires_queue() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        queue_total_budget: 100,
        ..quick_config()
    };
    let frontier = open(dir.path(), config.clone());
    for i in 0..150 {
        frontier.schedule(link(&format!("http://big.test/{}", i)));
    }

    assert_eq!(drain(&frontier, 200).len(), 100);
    assert!(frontier.next().unwrap().is_none());

    let stats = frontier.stats();
    assert_eq!(stats.retired_queues, 1);
    assert_eq!(stats.queued, 50);
    assert_eq!(stats.emitted, 100);

    // A raised budget brings the queue back.
    frontier
        .update_config(FrontierConfig {
            queue_total_budget: 1000,
            ..config
        })
        .unwrap();
    assert_eq!(drain(&frontier, 200).len(), 50);
    assert_eq!(frontier.stats().retired_queues, 0);
}

#[test]
fn test_finishing_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/"));

    let mut curi = frontier.next().unwrap().unwrap();
    curi.fetch_status = 200;
    let copy = curi.clone();
    assert_eq!(frontier.finished(curi).unwrap(), Disposition::Succeeded);

    let err = frontier.finished(copy).unwrap_err();
    assert!(matches!(err, FrontierError::NotInProcess(_)));
    assert_eq!(frontier.succeeded_fetch_count(), 1);
    assert_eq!(frontier.failed_fetch_count(), 0);
}

#[test]
fn test_politeness_snoozes_host() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        delay_factor: 1.0,
        min_delay_ms: 200,
        max_delay_ms: 200,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://slow.test/1"));
    frontier.schedule(link("http://slow.test/2"));

    let mut curi = frontier.next().unwrap().unwrap();
    let now = now_ms();
    curi.set_fetch_times(now - 10, now);
    curi.fetch_status = 200;
    frontier.finished(curi).unwrap();
    assert_eq!(frontier.stats().snoozed_queues, 1);

    let started = Instant::now();
    let second = frontier.next().unwrap().unwrap();
    assert_eq!(second.uri, "http://slow.test/2");
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_other_hosts_proceed_while_one_snoozes() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        delay_factor: 1.0,
        min_delay_ms: 60_000,
        max_delay_ms: 60_000,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://a.test/1"));
    frontier.schedule(link("http://a.test/2"));
    frontier.schedule(link("http://b.test/1"));

    let mut first = frontier.next().unwrap().unwrap();
    assert_eq!(first.uri, "http://a.test/1");
    let now = now_ms();
    first.set_fetch_times(now - 5, now);
    first.fetch_status = 200;
    frontier.finished(first).unwrap();

    let next = frontier.next().unwrap().unwrap();
    assert_eq!(next.uri, "http://b.test/1");
}

#[test]
fn test_valence_allows_overlap_but_keeps_politeness() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        delay_factor: 1.0,
        min_delay_ms: 300,
        max_delay_ms: 300,
        host_valence: 2,
        hold_queues: false,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    for i in 1..=3 {
        frontier.schedule(link(&format!("http://a.test/{}", i)));
    }

    let mut first = frontier.next().unwrap().unwrap();
    let now = now_ms();
    first.set_fetch_times(now - 10, now);
    first.fetch_status = 200;
    frontier.finished(first).unwrap();

    // The host still rests between fetches.
    let started = Instant::now();
    let second = frontier.next().unwrap().unwrap();
    assert_eq!(second.uri, "http://a.test/2");
    assert!(started.elapsed() >= Duration::from_millis(250));

    // With the second URI still out, a valence of 2 allows one more at once.
    let started = Instant::now();
    let third = frontier.next().unwrap().unwrap();
    assert_eq!(third.uri, "http://a.test/3");
    assert!(started.elapsed() < Duration::from_millis(250));
}

#[test]
fn test_long_rest_deactivates_when_others_are_ready() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        delay_factor: 1.0,
        min_delay_ms: 60_000,
        max_delay_ms: 60_000,
        snooze_deactivate_ms: 1_000,
        hold_queues: false,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    for uri in ["http://a.test/1", "http://a.test/2", "http://b.test/1", "http://b.test/2"] {
        frontier.schedule(link(uri));
    }

    let finish_ok = |mut curi: CrawlUri| {
        let now = now_ms();
        curi.set_fetch_times(now - 5, now);
        curi.fetch_status = 200;
        frontier.finished(curi).unwrap();
    };

    let a = frontier.next().unwrap().unwrap();
    assert_eq!(a.uri, "http://a.test/1");
    finish_ok(a);
    let stats = frontier.stats();
    assert_eq!(stats.inactive_queues, 1);
    assert_eq!(stats.snoozed_queues, 0);

    // Nothing else ready: the same rest is a snooze.
    let b = frontier.next().unwrap().unwrap();
    assert_eq!(b.uri, "http://b.test/1");
    finish_ok(b);
    let stats = frontier.stats();
    assert_eq!(stats.inactive_queues, 1);
    assert_eq!(stats.snoozed_queues, 1);
}

#[test]
fn test_spent_session_balance_rotates_hosts() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        hold_queues: true,
        balance_replenish_amount: 2,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    for host in ["a", "b"] {
        for i in 1..=4 {
            frontier.schedule(link(&format!("http://{}.test/{}", host, i)));
        }
    }

    assert_eq!(
        drain(&frontier, 200),
        vec![
            "http://a.test/1",
            "http://a.test/2",
            "http://b.test/1",
            "http://b.test/2",
            "http://a.test/3",
            "http://a.test/4",
            "http://b.test/3",
            "http://b.test/4",
        ]
    );
}

#[test]
fn test_terminate_wakes_paused_callers() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        pause_at_start: true,
        ..quick_config()
    };
    let frontier = Arc::new(open(dir.path(), config));
    frontier.schedule(link("http://a.test/"));
    assert!(frontier.is_paused());

    let waiter = {
        let frontier = Arc::clone(&frontier);
        thread::spawn(move || frontier.next())
    };
    thread::sleep(Duration::from_millis(50));
    frontier.terminate();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(FrontierError::Ended)));
    assert_eq!(frontier.queued_uri_count(), 1);
}

#[test]
fn test_unpause_releases_work() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        pause_at_start: true,
        ..quick_config()
    };
    let frontier = Arc::new(open(dir.path(), config));
    frontier.schedule(link("http://a.test/"));

    let waiter = {
        let frontier = Arc::clone(&frontier);
        thread::spawn(move || frontier.next())
    };
    thread::sleep(Duration::from_millis(50));
    frontier.unpause();

    let curi = waiter.join().unwrap().unwrap().unwrap();
    assert_eq!(curi.uri, "http://a.test/");
}

#[test]
fn test_replay_restores_pending_work() {
    let first_dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        journal: true,
        ..quick_config()
    };
    let first = open(first_dir.path(), config.clone());
    first.schedule(link("http://a.test/1"));
    first.schedule(link("http://a.test/2"));
    let mut curi = first.next().unwrap().unwrap();
    assert_eq!(curi.uri, "http://a.test/1");
    curi.fetch_status = 200;
    first.finished(curi).unwrap();
    first.close().unwrap();
    let old_journal = first.context().journal_path();
    drop(first);

    let second_dir = TempDir::new().unwrap();
    let second = Arc::new(open(second_dir.path(), config));
    let stats = replay(Arc::clone(&second), &old_journal, false)
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.scheduled, 2);

    assert_eq!(second.queued_uri_count(), 1);
    assert_eq!(second.discovered_uri_count(), 2);
    assert_eq!(drain(&second, 200), vec!["http://a.test/2"]);
}

#[test]
fn test_journal_records_lifecycle() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        journal: true,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://a.test/ok"));
    frontier.schedule(link("http://a.test/gone"));
    let mut ok = frontier.next().unwrap().unwrap();
    ok.fetch_status = 200;
    frontier.finished(ok).unwrap();
    let mut gone = frontier.next().unwrap().unwrap();
    gone.fetch_status = 404;
    frontier.finished(gone).unwrap();
    frontier.close().unwrap();

    let lines: Vec<JournalLine> = JournalReader::open(frontier.context().journal_path())
        .unwrap()
        .collect();
    assert_eq!(
        lines,
        vec![
            JournalLine::Added {
                uri: "http://a.test/ok".to_string(),
                path_from_seed: "L".to_string(),
                via: Some("http://seed.test/".to_string()),
            },
            JournalLine::Added {
                uri: "http://a.test/gone".to_string(),
                path_from_seed: "L".to_string(),
                via: Some("http://seed.test/".to_string()),
            },
            JournalLine::Emitted("http://a.test/ok".to_string()),
            JournalLine::Succeeded("http://a.test/ok".to_string()),
            JournalLine::Emitted("http://a.test/gone".to_string()),
            JournalLine::Failed("http://a.test/gone".to_string()),
        ]
    );
}

#[test]
fn test_checkpoint_and_resume() {
    let dir = TempDir::new().unwrap();
    {
        let frontier = open(dir.path(), persistent_config());
        frontier.schedule(link("http://a.test/1"));
        frontier.schedule(link("http://a.test/2"));
        frontier.schedule(link("http://b.test/1"));

        // Out with a worker when the checkpoint is taken.
        let out = frontier.next().unwrap().unwrap();
        assert_eq!(out.uri, "http://a.test/1");
        frontier.checkpoint().unwrap();
        frontier.close().unwrap();
    }

    let config = persistent_config();
    let ctx = CrawlContext::new(dir.path(), &config).unwrap();
    let frontier = Frontier::resume(config, ctx).unwrap();
    assert_eq!(frontier.queued_uri_count(), 3);
    assert_eq!(frontier.discovered_uri_count(), 3);

    // Already seen before the checkpoint.
    frontier.schedule(link("http://b.test/1"));
    assert_eq!(frontier.queued_uri_count(), 3);

    let mut fetched = drain(&frontier, 200);
    fetched.sort();
    assert_eq!(
        fetched,
        vec!["http://a.test/1", "http://a.test/2", "http://b.test/1"]
    );
}

#[test]
fn test_fresh_start_refuses_leftover_store() {
    let dir = TempDir::new().unwrap();
    {
        let frontier = open(dir.path(), persistent_config());
        frontier.schedule(link("http://a.test/1"));
        frontier.close().unwrap();
    }

    let config = persistent_config();
    let ctx = CrawlContext::new(dir.path(), &config).unwrap();
    assert!(matches!(
        Frontier::new(config, ctx),
        Err(FrontierError::StaleState(_))
    ));
}

#[test]
fn test_resume_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = persistent_config();
    let ctx = CrawlContext::new(dir.path(), &config).unwrap();
    assert!(matches!(
        Frontier::resume(config, ctx),
        Err(FrontierError::NoCheckpoint(_))
    ));
}

#[test]
fn test_delete_matching_skips_in_process() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/report.pdf"));
    frontier.schedule(link("http://a.test/page.html"));
    frontier.schedule(link("http://a.test/slides.pdf"));
    frontier.schedule(link("http://b.test/other.pdf"));

    let out = frontier.next().unwrap().unwrap();
    assert_eq!(out.uri, "http://a.test/report.pdf");

    assert_eq!(frontier.delete_matching(r"\.pdf$").unwrap(), 2);
    assert_eq!(frontier.disregarded_uri_count(), 2);
    assert_eq!(frontier.queued_uri_count(), 2);

    let mut out = out;
    out.fetch_status = 200;
    frontier.finished(out).unwrap();
    assert_eq!(drain(&frontier, 200), vec!["http://a.test/page.html"]);

    assert!(matches!(
        frontier.delete_matching("("),
        Err(FrontierError::Pattern(_))
    ));
}

#[test]
fn test_freeze_and_unfreeze() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        hold_queues: false,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://a.test/1"));

    assert!(frontier.freeze_queue("a.test"));
    assert!(!frontier.freeze_queue("missing.test"));
    assert!(frontier.next().unwrap().is_none());
    assert_eq!(frontier.stats().frozen_queues, 1);
    assert_eq!(frontier.queued_uri_count(), 1);

    assert!(frontier.unfreeze_queue("a.test"));
    assert_eq!(drain(&frontier, 200), vec!["http://a.test/1"]);
}

#[test]
fn test_discard_empty_queues() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/1"));
    frontier.schedule(link("http://b.test/1"));
    drain(&frontier, 200);

    assert_eq!(frontier.discard_empty_queues(), 2);
    assert!(frontier.queue_keys().is_empty());

    // A discarded host gets a fresh queue.
    frontier.schedule(link("http://a.test/2"));
    assert_eq!(drain(&frontier, 200), vec!["http://a.test/2"]);
}

#[test]
fn test_ip_assignment_reroutes_after_resolution() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        queue_assignment: QueueAssignment::Ip,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    frontier.schedule(link("http://a.test/1"));
    assert_eq!(frontier.queue_keys(), vec!["a.test"]);

    frontier.note_resolved("a.test", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 60_000);
    let curi = frontier.next().unwrap().unwrap();
    assert_eq!(curi.class_key.as_deref(), Some("10.0.0.1"));

    // Names resolving to one address share a queue.
    frontier.note_resolved("b.test", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 60_000);
    frontier.schedule(link("http://b.test/1"));
    assert_eq!(frontier.queue_keys(), vec!["10.0.0.1", "a.test"]);
}

#[test]
fn test_seed_redirect_is_promoted() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    let mut redirected = CrawlUri::new("http://www.a.test/", "R", Some("http://a.test/".to_string()));
    redirected.is_seed = true;
    frontier.schedule(redirected);

    assert_eq!(frontier.promoted_seeds(), vec!["http://www.a.test/"]);
    let curi = frontier.next().unwrap().unwrap();
    assert_eq!(curi.directive, SchedulingDirective::Medium);
}

#[test]
fn test_self_redirect_is_fetched_again() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/login"));
    assert_eq!(drain(&frontier, 302).len(), 1);

    frontier.schedule(link("http://a.test/login"));
    assert_eq!(frontier.queued_uri_count(), 0);

    frontier.schedule(CrawlUri::new("http://a.test/login", "LR", Some("http://a.test/login".to_string())));
    assert_eq!(drain(&frontier, 200), vec!["http://a.test/login"]);
}

#[test]
fn test_embed_preference() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/page"));
    frontier.schedule(CrawlUri::new("http://a.test/style.css", "LE", Some("http://a.test/".to_string())));

    let first = frontier.next().unwrap().unwrap();
    assert_eq!(first.uri, "http://a.test/style.css");
}

#[test]
fn test_load_seeds_from_file() {
    let dir = TempDir::new().unwrap();
    let seeds = dir.path().join("seeds.txt");
    std::fs::write(&seeds, "# start here\nhttp://a.test/\n\nhttp://b.test/ extra\n").unwrap();

    let frontier = open(&dir.path().join("data"), quick_config());
    assert_eq!(frontier.load_seeds(&FileSeedSource::new(&seeds)), 2);
    let mut fetched = drain(&frontier, 200);
    fetched.sort();
    assert_eq!(fetched, vec!["http://a.test/", "http://b.test/"]);
}

#[test]
fn test_memory_queue_spills_and_keeps_order() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        memory_head_capacity: 4,
        ..quick_config()
    };
    let frontier = open(dir.path(), config);
    let expected: Vec<String> = (0..20).map(|i| format!("http://a.test/{:02}", i)).collect();
    for uri in &expected {
        frontier.schedule(link(uri));
    }
    assert_eq!(drain(&frontier, 200), expected);
}

#[test]
fn test_fresh_memory_frontier_ignores_leftover_spill() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        memory_head_capacity: 2,
        ..quick_config()
    };
    {
        let crashed = open(dir.path(), config.clone());
        for i in 0..6 {
            crashed.schedule(link(&format!("http://a.test/old{}", i)));
        }
        for _ in 0..3 {
            let mut curi = crashed.next().unwrap().unwrap();
            curi.fetch_status = 200;
            crashed.finished(curi).unwrap();
        }
        // No cleanup runs, as after a crash.
        std::mem::forget(crashed);
    }

    let frontier = open(dir.path(), config);
    let expected: Vec<String> = (0..6).map(|i| format!("http://a.test/new{}", i)).collect();
    for uri in &expected {
        frontier.schedule(link(uri));
    }
    assert_eq!(drain(&frontier, 200), expected);
    assert_eq!(frontier.queued_uri_count(), 0);
}

/// Schedules two outlinks per page until depth 2.
struct Discovering {
    frontier: Arc<Frontier>,
    fetches: AtomicU64,
}

impl Fetcher for Discovering {
    fn fetch(&self, curi: &mut CrawlUri) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if curi.link_hops() < 2 {
            for i in 0..2 {
                let child = format!("{}/{}", curi.uri.trim_end_matches('/'), i);
                let path = format!("{}L", curi.path_from_seed);
                self.frontier.schedule(CrawlUri::new(child, path, Some(curi.uri.clone())));
            }
        }
        let now = now_ms();
        curi.set_fetch_times(now, now);
        curi.content_size = 1024;
        curi.fetch_status = 200;
    }
}

#[test]
fn test_worker_pool_crawls_to_exhaustion() {
    let dir = TempDir::new().unwrap();
    let config = FrontierConfig {
        host_valence: 2,
        ..quick_config()
    };
    let frontier = Arc::new(open(dir.path(), config));
    frontier.load_seeds(&StaticSeedSource::new([
        "http://h0.test/",
        "http://h1.test/",
        "http://h2.test/",
    ]));

    let fetcher = Arc::new(Discovering {
        frontier: Arc::clone(&frontier),
        fetches: AtomicU64::new(0),
    });
    let pool = WorkerPool::spawn(Arc::clone(&frontier), fetcher.clone(), 4).unwrap();
    let stats = pool.join();
    assert_eq!(fetcher.fetches.load(Ordering::Relaxed), 21);

    // 3 seeds, 6 at depth 1, 12 at depth 2.
    assert_eq!(frontier.discovered_uri_count(), 21);
    assert_eq!(stats.fetched, 21);
    assert_eq!(frontier.succeeded_fetch_count(), 21);
    assert_eq!(frontier.queued_uri_count(), 0);
    assert_eq!(frontier.stats().total_bytes, 21 * 1024);
}

#[test]
fn test_report_mentions_every_busy_queue() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), quick_config());
    frontier.schedule(link("http://a.test/1"));
    frontier.schedule(link("http://b.test/1"));

    let report = frontier.report();
    assert!(report.starts_with("2 queues:"));
    assert!(report.contains("a.test"));
    assert!(report.contains("b.test"));
}

#[test]
fn test_stats_track_store_entry_sizes() {
    let dir = TempDir::new().unwrap();
    let frontier = open(dir.path(), persistent_config());
    frontier.schedule(link("http://a.test/1"));
    frontier.schedule(link(&format!("http://a.test/{}", "x".repeat(200))));

    let stats = frontier.stats();
    assert!(stats.avg_entry_bytes > 0);
    assert!(stats.max_entry_bytes > stats.avg_entry_bytes);
    assert!(frontier.report().contains("bytes largest"));

    let memory_dir = TempDir::new().unwrap();
    let memory = open(memory_dir.path(), quick_config());
    memory.schedule(link("http://a.test/1"));
    assert_eq!(memory.stats().max_entry_bytes, 0);
}
