use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dvm_engine::jit::{Classifier, CompilerContext, JitConfig, JitDriver, SegmentFinder};
use dvm_engine::vm::{Instruction, Interpreter, Namespace, Opcode, Routine, Value, ValueTag, ValueType};

const INT: i32 = ValueTag::Int as i32;

fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
    Instruction::new(op, a, b, c)
}

fn config() -> JitConfig {
    JitConfig {
        min_segment_len: 1,
        ..JitConfig::default()
    }
}

fn types() -> Vec<ValueType> {
    vec![ValueType::Int, ValueType::Int, ValueType::Int, ValueType::Bool, ValueType::Int]
}

/// Sum of 1..=n
fn sum_loop(n: i32) -> Vec<Instruction> {
    vec![
        ins(Opcode::Data, INT, 0, 0),
        ins(Opcode::Data, INT, 1, 1),
        ins(Opcode::Data, INT, n, 2),
        ins(Opcode::Data, INT, 1, 4),
        ins(Opcode::LeBII, 1, 2, 3),
        ins(Opcode::TestB, 3, 9, 0),
        ins(Opcode::AddIII, 0, 1, 0),
        ins(Opcode::AddIII, 1, 4, 1),
        ins(Opcode::Goto, 0, 4, 0),
        ins(Opcode::Return, 0, 1, 0),
    ]
}

/// `blocks` copies of a short arithmetic run, separated by prints
fn striped(blocks: usize) -> Vec<Instruction> {
    let mut code = Vec::with_capacity(blocks * 5);
    for _ in 0..blocks {
        code.extend([
            ins(Opcode::Data, INT, 3, 0),
            ins(Opcode::AddIII, 0, 0, 1),
            ins(Opcode::MulIII, 1, 0, 2),
            ins(Opcode::SubIII, 2, 1, 4),
            ins(Opcode::Print, 4, 0, 0),
        ]);
    }
    code
}

fn bench_segment_finding(c: &mut Criterion) {
    let classifier = Classifier::new();
    let finder = SegmentFinder::new(&classifier, 1);
    let mut group = c.benchmark_group("segment_finding");

    for blocks in [10, 100, 1000] {
        let code = striped(blocks);
        group.throughput(Throughput::Elements(code.len() as u64));
        group.bench_with_input(BenchmarkId::new("striped", blocks), &code, |b, code| {
            let types = types();
            b.iter(|| finder.find_in(black_box(code), &types));
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let ctx = CompilerContext::new(config()).unwrap();
    let mut group = c.benchmark_group("compile");

    for blocks in [1, 10, 50] {
        let code = striped(blocks);
        group.bench_with_input(BenchmarkId::new("striped", blocks), &code, |b, code| {
            b.iter(|| {
                let routine = Routine::new("striped", code.clone(), types(), vec![]).unwrap();
                JitDriver::new(&ctx).compile(black_box(&routine)).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let ctx = CompilerContext::new(config()).unwrap();
    let mut group = c.benchmark_group("sum_loop");

    let interpreted = Routine::new("sum", sum_loop(10_000), types(), vec![]).unwrap();
    group.bench_function("interpreted", |b| {
        let mut interp = Interpreter::new(Namespace::default());
        b.iter(|| {
            let result = interp.run(black_box(&interpreted)).unwrap();
            assert_eq!(result, Value::int(50_005_000));
        });
    });

    let compiled = Routine::new("sum", sum_loop(10_000), types(), vec![]).unwrap();
    JitDriver::new(&ctx).compile(&compiled).unwrap();
    group.bench_function("compiled", |b| {
        let mut interp = Interpreter::new(Namespace::default());
        b.iter(|| {
            let result = interp.run(black_box(&compiled)).unwrap();
            assert_eq!(result, Value::int(50_005_000));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_segment_finding, bench_compile, bench_execution);
criterion_main!(benches);
