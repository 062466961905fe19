//! Performance benchmarks for a3s-gate
//!
//! Run with: cargo bench

use a3s_gate::{
    AuditChain, ExecutionContext, ExecutionMode, FnExecutor, GateConfig, Orchestrator,
    SensitivityAnalyzer,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn request(input: &str) -> ExecutionContext {
    ExecutionContext::new("bench-session", input)
        .with_user("bench")
        .with_metadata("auth_token", "tok")
        .with_permission("ai:use")
        .with_permission("ai:local")
        .with_permission("ai:cloud")
}

fn bench_analyze(c: &mut Criterion) {
    let analyzer = SensitivityAnalyzer::with_default_rules().unwrap();

    let mut group = c.benchmark_group("analyze");
    for (name, input) in [
        ("benign_zh", "今天天氣如何？"),
        ("credential_zh", "我的密碼是 123456"),
        (
            "mixed",
            "Please 轉帳 to account number 6222020200112233 and update the contract",
        ),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| analyzer.analyze(input));
        });
    }
    group.finish();
}

fn bench_audit_append(c: &mut Criterion) {
    let payload = serde_json::json!({
        "request_id": "req-bench",
        "session_id": "bench-session",
        "mode": "hybrid",
        "matched_categories": ["business", "financial"],
    });

    c.bench_function("AuditChain append", |b| {
        let chain = AuditChain::new();
        b.iter(|| chain.append("mode_decision", payload.clone()).unwrap());
    });

    let mut group = c.benchmark_group("audit_verify");
    for count in [100, 1000] {
        let chain = AuditChain::new();
        for _ in 0..count {
            chain.append("mode_decision", payload.clone()).unwrap();
        }
        group.bench_with_input(BenchmarkId::from_parameter(count), &chain, |b, chain| {
            b.iter(|| assert!(chain.verify().valid));
        });
    }
    group.finish();
}

fn bench_process(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let gate = Orchestrator::from_config(&GateConfig::default(), Arc::new(AuditChain::new()))
        .unwrap();
    for mode in [
        ExecutionMode::LocalOnly,
        ExecutionMode::Hybrid,
        ExecutionMode::CloudSandbox,
    ] {
        gate.register_executor(
            mode,
            Arc::new(FnExecutor::new(|_ctx, _d| async { Ok("done".to_string()) })),
        )
        .unwrap();
    }

    c.bench_function("Orchestrator process", |b| {
        b.to_async(&rt)
            .iter(|| async { gate.process(request("review the contract")).await.unwrap() });
    });
}

criterion_group!(benches, bench_analyze, bench_audit_append, bench_process);
criterion_main!(benches);
