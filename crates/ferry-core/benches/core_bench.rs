//! Criterion benchmarks for ferry-core.
//!
//! Everything here runs against in-memory trackers and in-memory SQLite, so
//! the numbers reflect engine and ledger overhead rather than network time.
//!
//! ## Benchmark groups
//!
//! 1. **guards** — Input clamping / message truncation.
//! 2. **mapping** — Single-value resolution and whole-entity translation.
//! 3. **ledger** — Attempt upserts and outcome queries.
//! 4. **validate_helpers** — Sampling and whitespace-normalized comparison.
//! 5. **migrate** — Full dry-run and real project runs at several sizes.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/ferry-core/Cargo.toml
//! # Run only the ledger group:
//! cargo bench --manifest-path crates/ferry-core/Cargo.toml -- ledger
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use ferry_core::config::{BackoffConfig, FerryConfig};
use ferry_core::engine::{MigrateOptions, MigrationEngine};
use ferry_core::guards::{clamp_int, clamp_page_size, clamp_workers, truncate_message};
use ferry_core::mapping::{FieldCategory, MappingResolver, MappingTable};
use ferry_core::models::{AttemptError, EntityKind, ErrorKind, MigrationRecord, Outcome, SourceEntity};
use ferry_core::repository::{MemorySource, MemoryTarget};
use ferry_core::store::{Ledger, NewAttempt};
use ferry_core::validate::compare::{ContentEquivalence, NormalizedWhitespace};
use ferry_core::validate::sample::sample_records;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn resolver() -> MappingResolver {
    let mut table = MappingTable::default();
    for n in 0..200 {
        table
            .add_rule(FieldCategory::User, format!("user{n}@old.io"), format!("user{n}@new.io"))
            .unwrap();
    }
    for (from, to) in [("Open", "To Do"), ("In Progress", "Doing"), ("Closed", "Done")] {
        table.add_rule(FieldCategory::Status, from, to).unwrap();
    }
    table.rename("customfield_10010", "customfield_20010");
    table.append_values("labels", vec![json!("migrated")]);
    MappingResolver::new(table)
}

fn issue(n: usize) -> SourceEntity {
    SourceEntity::issue(format!("OLD-{n}"))
        .with_field("summary", format!("Issue number {n}"))
        .with_field("description", "Steps to reproduce:\n  1. open\n  2. close\n".repeat(4))
        .with_field("status", ["Open", "In Progress", "Closed"][n % 3])
        .with_field("reporter", format!("user{}@old.io", n % 200))
        .with_field("assignee", json!({"emailAddress": format!("user{}@old.io", (n + 1) % 200)}))
        .with_field("customfield_10010", "sprint 7")
}

fn seeded_source(issues: usize) -> MemorySource {
    let source = MemorySource::new();
    for n in 0..issues {
        source.add_issue(issue(n));
        for c in 0..3 {
            source.add_comment(
                SourceEntity::comment(format!("OLD-{n}"), format!("{}", n * 10 + c))
                    .with_field("body", format!("comment {c}"))
                    .with_field("author", format!("user{}@old.io", c)),
            );
        }
    }
    source
}

fn bench_config() -> FerryConfig {
    FerryConfig {
        source_project: "OLD".to_string(),
        target_project: "NEW".to_string(),
        workers: 4,
        backoff: BackoffConfig::immediate(1),
        ..FerryConfig::default()
    }
}

fn record(n: usize) -> MigrationRecord {
    MigrationRecord {
        kind: EntityKind::Issue,
        source_id: format!("OLD-{n}"),
        parent_id: None,
        target_id: Some(format!("NEW-{n}")),
        outcome: Outcome::Success,
        attempt_count: 1,
        last_error: None,
        first_attempt_at: None,
        last_attempt_at: None,
    }
}

// ---------------------------------------------------------------------------
// 1. guards
// ---------------------------------------------------------------------------

fn bench_guards(c: &mut Criterion) {
    let mut group = c.benchmark_group("guards");

    group.bench_function("clamp_int", |b| {
        b.iter(|| clamp_int(black_box(150), black_box(1), black_box(100)))
    });
    group.bench_function("clamp_workers", |b| b.iter(|| clamp_workers(black_box(500))));
    group.bench_function("clamp_page_size", |b| b.iter(|| clamp_page_size(black_box(-3))));

    let long = "upstream returned 502 Bad Gateway ".repeat(40);
    group.bench_function("truncate_message", |b| b.iter(|| truncate_message(black_box(&long))));

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. mapping
// ---------------------------------------------------------------------------

fn bench_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapping");
    let resolver = resolver();

    group.bench_function("resolve_hit", |b| {
        b.iter(|| resolver.resolve(FieldCategory::User, black_box("user150@old.io")))
    });
    group.bench_function("resolve_literal", |b| {
        b.iter(|| resolver.resolve(FieldCategory::Priority, black_box("High")))
    });

    let entity = issue(42);
    group.bench_function("translate_issue", |b| b.iter(|| resolver.translate(black_box(&entity))));

    group.finish();
}

// ---------------------------------------------------------------------------
// 3. ledger
// ---------------------------------------------------------------------------

fn bench_ledger(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger");

    group.bench_function("record_success", |b| {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            let id = format!("OLD-{n}");
            ledger
                .record_attempt(&NewAttempt::success(EntityKind::Issue, &id, format!("NEW-{n}")))
                .unwrap()
        })
    });

    group.bench_function("record_failure_upsert", |b| {
        let ledger = Ledger::open_in_memory().unwrap();
        b.iter(|| {
            ledger
                .record_attempt(&NewAttempt::failed(
                    EntityKind::Issue,
                    black_box("OLD-1"),
                    AttemptError::new(ErrorKind::TransientRepository, "503"),
                ))
                .unwrap()
        })
    });

    let ledger = Ledger::open_in_memory().unwrap();
    for n in 0..2_000 {
        let id = format!("OLD-{n}");
        let attempt = if n % 10 == 0 {
            NewAttempt::failed(EntityKind::Issue, &id, AttemptError::new(ErrorKind::UnmappedValue, "x"))
        } else {
            NewAttempt::success(EntityKind::Issue, &id, format!("NEW-{n}"))
        };
        ledger.record_attempt(&attempt).unwrap();
    }
    group.bench_function("list_failed_2000", |b| {
        b.iter(|| ledger.list_by_outcome(EntityKind::Issue, Outcome::Failed).unwrap())
    });
    group.bench_function("lookup", |b| {
        b.iter(|| ledger.lookup(EntityKind::Issue, black_box("OLD-1234")).unwrap())
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 4. validate_helpers
// ---------------------------------------------------------------------------

fn bench_validate_helpers(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate_helpers");

    let records: Vec<MigrationRecord> = (0..5_000).map(record).collect();
    group.bench_function("sample_5_of_5000", |b| {
        b.iter(|| sample_records(black_box(records.clone()), Some(5)))
    });

    let expected = json!("Line one\r\n\tline   two\n\nline three ".repeat(20));
    let observed = json!("Line one line two line three ".repeat(20).trim_end());
    group.bench_function("normalized_whitespace", |b| {
        b.iter(|| NormalizedWhitespace.equivalent(black_box(&expected), black_box(&observed)))
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 5. migrate
// ---------------------------------------------------------------------------

fn bench_migrate(c: &mut Criterion) {
    let mut group = c.benchmark_group("migrate");
    group.sample_size(10);
    let config = bench_config();
    let resolver = resolver();

    for issues in [50usize, 200] {
        let source = seeded_source(issues);

        group.bench_with_input(BenchmarkId::new("dry_run", issues), &issues, |b, _| {
            b.iter(|| {
                let ledger = Ledger::open_in_memory().unwrap();
                let target = MemoryTarget::new("NEW");
                MigrationEngine::new(&config, &ledger, &resolver, &source, &target)
                    .migrate_project(&MigrateOptions::dry_run())
                    .unwrap()
            })
        });

        group.bench_with_input(BenchmarkId::new("full", issues), &issues, |b, _| {
            b.iter(|| {
                let ledger = Ledger::open_in_memory().unwrap();
                let target = MemoryTarget::new("NEW");
                MigrationEngine::new(&config, &ledger, &resolver, &source, &target)
                    .migrate_project(&MigrateOptions::default())
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_guards,
    bench_mapping,
    bench_ledger,
    bench_validate_helpers,
    bench_migrate,
);
criterion_main!(benches);
