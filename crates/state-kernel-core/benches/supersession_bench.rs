use criterion::{criterion_group, criterion_main, Criterion};
use state_kernel_core::{
    assemble_context, AuthorityLevel, ContextQuery, Environment, FactKey, FactStore, IdentityRole,
    WriteRequest,
};
use time::{Duration, OffsetDateTime};

fn at(offset_seconds: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset_seconds)
}

fn chain_store(links: usize) -> FactStore {
    let mut store = FactStore::new();
    if let Err(err) = store.write(WriteRequest::new("fact_0", "value 0", "decision", at(0))) {
        panic!("chain seed write failed: {err}");
    }
    for index in 1..links {
        let offset = i64::try_from(index).unwrap_or(0);
        let write = WriteRequest::new(
            format!("fact_{index}"),
            format!("value {index}"),
            "decision",
            at(offset),
        )
        .superseding(format!("fact_{}", index - 1));
        if let Err(err) = store.write(write) {
            panic!("chain write {index} failed: {err}");
        }
    }
    store
}

fn wide_store(count: usize) -> FactStore {
    let mut store = FactStore::new();
    for index in 0..count {
        let offset = i64::try_from(index).unwrap_or(0);
        let source = match index % 4 {
            0 => "finance_system",
            1 => "policy",
            2 => "observation",
            _ => "decision",
        };
        let value = if index % 5 == 0 {
            format!("Spend for line {index} cannot exceed $40k")
        } else {
            format!("Vendor note number {index}")
        };
        let write = WriteRequest::new(format!("fact_{index}"), value, source, at(offset));
        if let Err(err) = store.write(write) {
            panic!("wide write {index} failed: {err}");
        }
    }
    store
}

fn bench_resolve(c: &mut Criterion) {
    let store = chain_store(1_000);
    let root = FactKey::from("fact_0");

    c.bench_function("resolve_current_1000_link_chain", |b| {
        b.iter(|| {
            if store.resolve_current(&root).is_none() {
                panic!("chain should resolve to a valid head");
            }
        });
    });
}

fn bench_assemble(c: &mut Criterion) {
    let store = wide_store(1_000);
    let identity = IdentityRole {
        user_name: "Bench Manager".to_string(),
        authority: AuthorityLevel::Manager,
        ..IdentityRole::default()
    };
    let environment = Environment::new(at(10_000));
    let query = ContextQuery::new("vendor spend", 64_000);

    c.bench_function("assemble_context_1000_facts", |b| {
        b.iter(|| assemble_context(&store, &identity, &environment, &[], &[], &query));
    });
}

criterion_group!(supersession_benches, bench_resolve, bench_assemble);
criterion_main!(supersession_benches);
