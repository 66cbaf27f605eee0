//! 规则编译与排序性能基准
//!
//! 覆盖发布路径上的纯计算部分：维度规范化 + ID 派生、特异度排序、规则集序列化。

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rule_sync::compiler;
use rule_sync::publisher::render_rule_set;
use rule_sync::ranker;
use rule_sync::{DimensionTuple, RuleFamily, TargetingRule};
use std::hint::black_box;

const COUNTRIES: [&str; 6] = ["us", "il", "de", "fr", "gb", "jp"];
const OSES: [&str; 3] = ["ios", "android", "windows"];

/// 构造特异度各不相同的规则
fn create_rules(count: usize) -> Vec<TargetingRule> {
    (0..count)
        .map(|i| {
            let mut dims = DimensionTuple::new("20814", "stream-together.org").with_device("mobile");
            if i % 2 == 0 {
                dims.country = Some(COUNTRIES[i % COUNTRIES.len()].to_string());
            }
            if i % 3 == 0 {
                dims.os = Some(OSES[i % OSES.len()].to_string());
            }
            if i % 5 == 0 {
                dims.placement_type = Some(format!("slot-{}", i));
            }

            let compiled = compiler::compile(&dims, None);
            TargetingRule {
                rule_id: compiled.rule_id,
                dimensions: compiled.dimensions,
                value: 1.0 + (i % 10) as f64,
                active: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }
        })
        .collect()
}

fn bench_compile(c: &mut Criterion) {
    let dims = DimensionTuple::new(" 20814 ", "Stream-Together.ORG")
        .with_country("IL")
        .with_device("Mobile");

    c.bench_function("compile_rule_identity", |b| {
        b.iter(|| compiler::compile(black_box(&dims), None))
    });
}

fn bench_rank(c: &mut Criterion) {
    let mut group = c.benchmark_group("rank_rules");

    for size in [10, 100, 1000] {
        let rules = create_rules(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rules, |b, rules| {
            b.iter_batched(
                || rules.clone(),
                |mut batch| ranker::rank(black_box(&mut batch)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut rules = create_rules(500);
    ranker::rank(&mut rules);

    c.bench_function("render_rule_set_500", |b| {
        b.iter(|| render_rule_set(RuleFamily::PriceFactor, black_box(&rules)))
    });
}

criterion_group!(benches, bench_compile, bench_rank, bench_render);
criterion_main!(benches);
