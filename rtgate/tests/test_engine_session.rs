use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use rtgate::batch::{StaticTypeTable, TypeDescriptor};
use rtgate::config::EngineConfig;
use rtgate::domain::{Keywords, Level, ObjectAddr, TypeId};
use rtgate::event::Event;
use rtgate::hooks::{HookEvent, HookSlot};
use rtgate::simulation::{self, SimulationConfig};
use rtgate::sink::{JsonLinesSink, RecordingSink};
use rtgate::subscription::{FilterPayload, SessionChange, GC_SEQUENCE_KEY};
use rtgate::Engine;
use rtgate_common::keywords;

fn engine_with(config: EngineConfig) -> (Engine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(config, sink.clone(), Arc::new(simulation::type_table()));
    (engine, sink)
}

#[test]
fn test_keyword_changes_rewire_only_changed_slots() {
    let (engine, _sink) = engine_with(EngineConfig::default());

    let outcome = engine.apply_subscription_change(&SessionChange::enable(Level::Verbose, Keywords(0b0101)));
    assert_eq!(
        outcome.wired,
        vec![
            HookSlot::GcPhase,
            HookSlot::GcResize,
            HookSlot::GcMoves,
            HookSlot::ModuleLoad
        ]
    );

    let outcome = engine.apply_subscription_change(&SessionChange::enable(Level::Verbose, Keywords(0b0100)));
    assert!(outcome.wired.is_empty());
    assert_eq!(outcome.unwired, vec![HookSlot::GcPhase, HookSlot::GcResize, HookSlot::GcMoves]);

    let stats = engine.stats();
    assert_eq!(stats.wired_hooks, 1);
    assert_eq!(stats.hook_installs, 4);
    assert_eq!(stats.hook_removals, 3);
    assert!(engine.is_enabled(Keywords(keywords::LOADER), Level::Verbose));
    assert!(!engine.is_enabled(Keywords(keywords::GC), Level::Verbose));
}

#[test]
fn test_heap_dump_events_replayed_with_bulk_types() {
    let (engine, sink) = engine_with(EngineConfig::default());
    let mask = Keywords(keywords::GC | keywords::GC_HEAP_DUMP | keywords::GC_HEAP_COLLECT);
    let request = engine
        .apply_subscription_change(
            &SessionChange::enable(Level::Verbose, mask)
                .with_filter(FilterPayload::from_pairs(&[(GC_SEQUENCE_KEY, "3")])),
        )
        .request
        .unwrap();
    assert_eq!(request.sequence, Some(3));

    engine.gc_pre_pause();
    assert_eq!(engine.gc_paused(), Some(request));
    assert!(engine.heap_walk_requested());
    // Type 8 is generic over 7 and 6
    for (object, type_id) in [(0x100, 8), (0x200, 1), (0x300, 8)] {
        engine.dispatch(&HookEvent::GcObjectReference {
            object: ObjectAddr(object),
            type_id: TypeId(type_id),
            size: 32,
            references: &[0x200],
        });
    }
    engine.gc_pre_resume();
    let report = engine.gc_resumed();

    assert_eq!(report.replay.records, 3);
    assert_eq!(report.replay.identities, 2);
    assert_eq!(report.types.items, 4);
    assert_eq!(report.types.flushes, 1);
    assert_eq!(report.serviced_request, Some(request));

    let events = sink.take();
    assert_eq!(events.len(), 4);
    match &events[3] {
        Event::BulkType { count, payload, .. } => {
            assert_eq!(*count, 4);
            assert!(payload.len() <= engine.config().batch.ceiling);
        }
        other => panic!("expected bulk_type, got {}", other.name()),
    }
    assert_eq!(engine.stats().pending_requests, 0);
}

#[test]
fn test_exhausted_arena_drops_records_and_recovers() {
    let mut config = EngineConfig::default();
    config.arena.block_size = 4096;
    config.arena.max_bytes = Some(8192);
    config.validate().unwrap();
    let (engine, _sink) = engine_with(config);
    engine.apply_subscription_change(&SessionChange::enable(
        Level::Verbose,
        Keywords(keywords::GC | keywords::GC_HEAP_DUMP),
    ));

    let references = [0u64; 16];
    engine.gc_pre_pause();
    engine.gc_paused();
    for object in 0..200u64 {
        engine.dispatch(&HookEvent::GcObjectReference {
            object: ObjectAddr(object),
            type_id: TypeId(1),
            size: 24,
            references: &references,
        });
    }
    engine.gc_pre_resume();
    let report = engine.gc_resumed();

    let stats = engine.stats();
    assert!(stats.log.dropped > 0);
    assert_eq!(report.replay.records, stats.buffered);
    assert_eq!(report.replay.records + stats.log.dropped, 200);

    // The next pause starts from a single warm block
    engine.gc_pre_pause();
    engine.gc_paused();
    engine.dispatch(&HookEvent::GcResize { new_size: 1 << 20 });
    engine.gc_pre_resume();
    assert_eq!(engine.gc_resumed().replay.records, 1);
}

#[test]
fn test_simulation_export_is_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let sink = Arc::new(JsonLinesSink::new(File::create(&path).unwrap()));
    let engine = Arc::new(Engine::new(EngineConfig::default(), sink.clone(), Arc::new(simulation::type_table())));

    let config = SimulationConfig {
        producers: 2,
        cycles: 3,
        objects: 50,
        heap_dumps: 1,
        interval: Duration::from_millis(5),
        keywords: Keywords::ALL,
        level: Level::Verbose,
    };
    let report = simulation::run(&engine, &config);
    engine.shutdown();
    sink.flush().unwrap();

    assert_eq!(report.cycles, 3);
    assert_eq!(report.heap_dumps_serviced, 1);

    let mut object_references = 0;
    let mut gc_phases = 0;
    let mut lines = 0;
    for line in BufReader::new(File::open(&path).unwrap()).lines() {
        let value: serde_json::Value = serde_json::from_str(&line.unwrap()).unwrap();
        match value["event"].as_str().unwrap() {
            "gc_object_reference" => object_references += 1,
            "gc_phase" => gc_phases += 1,
            _ => {}
        }
        lines += 1;
    }
    assert_eq!(object_references, 50);
    assert_eq!(gc_phases, 3 * 4);
    assert_eq!(lines, sink.written());
}

#[test]
fn test_engine_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "arena": {{ "block_size": 8192 }}, "batch": {{ "ceiling": 200, "instance_id": 9 }} }}"#)
        .unwrap();
    let config = EngineConfig::from_file(file.path()).unwrap();

    let table: StaticTypeTable = (1..=10).map(|id| TypeDescriptor::simple(TypeId(id))).collect();
    let sink = Arc::new(RecordingSink::new());
    let engine = Engine::new(config, sink.clone(), Arc::new(table));
    engine.apply_subscription_change(&SessionChange::enable(Level::Verbose, Keywords(keywords::TYPE)));

    // 31-byte items, (200 - 6) / 31 = 6 per batch
    let ids: Vec<TypeId> = (1..=10).map(TypeId).collect();
    let stats = engine.log_types(&ids);
    assert_eq!(stats.items, 10);
    assert_eq!(stats.flushes, 2);

    let counts: Vec<(u32, u16)> = sink
        .take()
        .into_iter()
        .map(|event| match event {
            Event::BulkType { count, instance_id, .. } => (count, instance_id),
            other => panic!("unexpected event {}", other.name()),
        })
        .collect();
    assert_eq!(counts, vec![(6, 9), (4, 9)]);
}
