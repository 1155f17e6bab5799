//! Benchmarks for field mapping.

use chainflow::mapping::{FieldMapper, FieldMapperConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value};

fn mapper() -> FieldMapper {
    let config: FieldMapperConfig = serde_json::from_value(json!({
        "dict_mappers": [
            {
                "event_name": "Transfer",
                "mapping_rules": [
                    {"source_key": "from", "target_key": "sender", "transformer": "format_address"},
                    {"source_key": "to", "target_key": "recipient", "transformer": "format_address"},
                    {"source_key": "value", "target_key": "amount", "transformer": "to_int"}
                ]
            },
            {
                "mapping_rules": [
                    {"source_key": "blockNumber", "target_key": "block_number"},
                    {"source_key": "transactionHash", "target_key": "tx_hash", "required": true}
                ]
            }
        ]
    }))
    .expect("valid mapper config");
    FieldMapper::from_config(config).expect("mapper compiles")
}

fn record() -> Map<String, Value> {
    match json!({
        "event_name": "Transfer",
        "from": "0x00000000000000000000000000000000000000aa",
        "to": "0x00000000000000000000000000000000000000bb",
        "value": "1000000000000000000",
        "blockNumber": 19_000_000,
        "transactionHash": "0x1234"
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn mapping_benchmark(c: &mut Criterion) {
    let mapper = mapper();
    let payload = record();

    c.bench_function("field_mapper_transfer", |b| {
        b.iter(|| black_box(mapper.map(black_box(&payload))));
    });
}

criterion_group!(benches, mapping_benchmark);
criterion_main!(benches);
