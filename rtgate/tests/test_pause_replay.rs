use std::sync::Arc;

use rtgate::buffered_log::{BufferedLog, IdentityCache, Record};
use rtgate::config::{ArenaConfig, DrainBackoff};
use rtgate::domain::TypeId;
use rtgate::event::Event;
use rtgate::gate::FireGate;
use rtgate::sink::RecordingSink;

fn object_reference(object: u64) -> Record<'static> {
    Record::GcObjectReference { object, type_id: TypeId(object % 7), size: 24, references: &[] }
}

#[test]
fn test_300_object_references_span_two_blocks_in_order() {
    let gate = FireGate::new(DrainBackoff::default());
    let log = BufferedLog::new(ArenaConfig { block_size: 8192, max_bytes: None });

    gate.pause();
    for object in 0..300 {
        let record = object_reference(object);
        assert_eq!(record.record_size(), 40);
        assert!(log.append(&gate, &record));
    }
    gate.resume();

    let blocks = log.blocks();
    assert_eq!(blocks.len(), 2);
    // 8192 - 64 byte header = 8128 usable, 203 records of 40 bytes
    assert_eq!(blocks[0].used, 203 * 40);
    assert_eq!(blocks[1].used, 97 * 40);
    assert!(blocks[0].sequence < blocks[1].sequence);

    let sink = RecordingSink::new();
    let mut cache = IdentityCache::new();
    let report = log.replay(&sink, &mut cache);
    assert_eq!(report.blocks, 2);
    assert_eq!(report.records, 300);
    assert_eq!(cache.len(), 7);

    let objects: Vec<u64> = sink
        .take()
        .into_iter()
        .map(|event| match event {
            Event::GcObjectReference { object, .. } => object,
            other => panic!("unexpected event {}", other.name()),
        })
        .collect();
    assert_eq!(objects, (0..300).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_gc_workers_keep_per_thread_order() {
    const WORKERS: u64 = 4;
    const PER_WORKER: u64 = 500;

    let gate = Arc::new(FireGate::new(DrainBackoff::default()));
    let log = Arc::new(BufferedLog::new(ArenaConfig { block_size: 4096, max_bytes: None }));

    gate.pause();
    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 0..PER_WORKER {
                    assert!(log.append(&gate, &Record::GcRootUnregister { root_id: (worker << 32) | i }));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    gate.resume();

    let sink = RecordingSink::new();
    let report = log.replay(&sink, &mut IdentityCache::new());
    assert_eq!(report.records, WORKERS * PER_WORKER);
    assert!(report.blocks > 1);

    let mut next = [0u64; WORKERS as usize];
    for event in sink.take() {
        let Event::GcRootUnregister { root_id } = event else {
            panic!("unexpected event {}", event.name());
        };
        let worker = (root_id >> 32) as usize;
        assert_eq!(root_id & 0xffff_ffff, next[worker], "worker {worker} out of order");
        next[worker] += 1;
    }
    assert!(next.iter().all(|n| *n == PER_WORKER));
}

#[test]
fn test_reset_log_is_reusable_next_pause() {
    let gate = FireGate::new(DrainBackoff::default());
    let log = BufferedLog::new(ArenaConfig { block_size: 8192, max_bytes: None });

    for round in 0..3u64 {
        gate.pause();
        for object in 0..250 {
            log.append(&gate, &object_reference(round * 1000 + object));
        }
        gate.resume();

        let sink = RecordingSink::new();
        let report = log.replay(&sink, &mut IdentityCache::new());
        assert_eq!(report.records, 250, "round {round}");
        log.reset();
    }

    let stats = log.stats();
    assert_eq!(stats.appended, 750);
    assert_eq!(stats.replayed, 750);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.arena.live_blocks, 1);
}
