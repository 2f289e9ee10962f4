use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mitmock::message::{trim_message, Body, Fixture, Headers, MessageRecord, RecordedExchange};

fn json_response(items: usize) -> MessageRecord {
    let body: Vec<String> = (0..items).map(|i| format!("{{\"id\":{i},\"name\":\"item-{i}\"}}")).collect();
    let mut headers = Headers::new();
    headers.append("Content-Type", "application/json");
    headers.append("Content-Length", "0");
    headers.append("Date", "Mon, 01 Jan 2024 00:00:00 GMT");

    MessageRecord {
        status_code: Some(200),
        headers,
        body: Some(Body::Bytes(Bytes::from(format!("[{}]", body.join(","))))),
        ..MessageRecord::default()
    }
}

fn request() -> MessageRecord {
    let mut headers = Headers::new();
    headers.append("Host", "api.example.com");
    MessageRecord {
        method: Some("GET".to_string()),
        url: Some("/items".to_string()),
        headers,
        ..MessageRecord::default()
    }
}

fn bench_trim_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("trim");

    for items in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(items), &items, |b, &items| {
            let response = json_response(items);
            b.iter(|| trim_message(black_box(response.clone())));
        });
    }

    group.finish();
}

fn bench_fixture_rendering(c: &mut Criterion) {
    let exchanges: Vec<RecordedExchange> = (0..20)
        .map(|_| RecordedExchange {
            request: request(),
            response: json_response(50),
        })
        .collect();
    let fixture = Fixture::from_recorded(exchanges);

    c.bench_function("fixture_to_pretty_json", |b| {
        b.iter(|| black_box(&fixture).to_pretty_json(4));
    });
}

criterion_group!(benches, bench_trim_sizes, bench_fixture_rendering);
criterion_main!(benches);
