//! Benchmark the canonical pipelines on a synthetic module

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use viper_ir::build::IRBuilder;
use viper_ir::{Module, Opcode, Type, Value};
use viper_opt::PassManager;

/// A module with the shapes the optimizer cares about: a diamond, a counted
/// loop over stack memory, and a small callee worth inlining.
fn build_workload() -> Module {
    let mut module = Module::new();
    let mut b = IRBuilder::new(&mut module);

    b.start_function("helper", Type::I64, &[("x", Type::I64)]);
    let entry = b.add_block("entry");
    b.set_insert_point(entry);
    let sq = b.binary(Opcode::Mul, Type::I64, Value::temp(0), Value::temp(0));
    b.ret(Some(sq));

    b.start_function("main", Type::I64, &[]);
    let entry = b.add_block("entry");
    let header = b.create_block("header", &[("i", Type::I64), ("acc", Type::I64)]);
    let body = b.add_block("body");
    let exit = b.create_block("exit", &[("r", Type::I64)]);

    b.set_insert_point(entry);
    let p = b.alloca(8);
    b.store(Type::I64, p.clone(), Value::const_int(3));
    b.br("header", vec![Value::const_int(0), Value::const_int(0)]);

    b.set_insert_point(header);
    let i = b.block_param(header, 0);
    let acc = b.block_param(header, 1);
    let c = b.binary(Opcode::SCmpLt, Type::I1, i.clone(), Value::const_int(6));
    b.cbr(c, "body", vec![], "exit", vec![acc.clone()]);

    b.set_insert_point(body);
    let base = b.load(Type::I64, p.clone());
    let scaled = b.binary(Opcode::Mul, Type::I64, i.clone(), Value::const_int(8));
    let addr = b.binary(Opcode::Add, Type::I64, base.clone(), scaled);
    let step = b.binary(
        Opcode::Add,
        Type::I64,
        acc,
        addr,
    );
    let i2 = b.binary(Opcode::Add, Type::I64, i, Value::const_int(1));
    b.br("header", vec![i2, step]);

    b.set_insert_point(exit);
    let r = b.block_param(exit, 0);
    let h = b
        .call("helper", Type::I64, vec![r], viper_ir::CallAttrs::default())
        .unwrap();
    b.ret(Some(h));

    module
}

fn bench_pipelines(c: &mut Criterion) {
    let module = build_workload();
    let pm = PassManager::new();

    let mut group = c.benchmark_group("pipeline");
    for id in ["O0", "O1", "O2"] {
        group.bench_function(id, |bench| {
            bench.iter(|| {
                let mut m = module.clone();
                pm.run_pipeline(black_box(&mut m), id);
                black_box(m)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipelines);
criterion_main!(benches);
