use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use http::HeaderMap;
use micro_core::codec::RequestParser;
use micro_core::handler::make_parser_handler;
use micro_core::protocol::{HeaderField, RequestLine};

const SIMPLE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

fn bench_simple_request(c: &mut Criterion) {
    c.bench_function("parse_simple_request", |b| {
        let mut parser = RequestParser::new();
        let mut handler = make_parser_handler(
            |line: &RequestLine<'_>| {
                black_box(line.path());
                Ok(())
            },
            |field: &HeaderField<'_>| {
                black_box(field.value());
                Ok(())
            },
            || Ok(()),
        );

        b.iter(|| parser.execute(black_box(SIMPLE_REQUEST), &mut handler).unwrap());
    });
}

fn bench_pipelined_requests(c: &mut Criterion) {
    let pipelined = SIMPLE_REQUEST.repeat(16);

    c.bench_function("parse_16_pipelined_requests", |b| {
        let mut parser = RequestParser::new();
        let mut messages = 0usize;
        let mut handler = make_parser_handler(
            |_line: &RequestLine<'_>| Ok(()),
            |_field: &HeaderField<'_>| Ok(()),
            || {
                messages += 1;
                Ok(())
            },
        );

        b.iter(|| parser.execute(black_box(&pipelined), &mut handler).unwrap());
        drop(handler);
        black_box(messages);
    });
}

fn bench_copy_out_headers(c: &mut Criterion) {
    let request = b"GET /search?q=rust HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\nUser-Agent: bench\r\n\r\n";

    c.bench_function("parse_into_header_map", |b| {
        let mut parser = RequestParser::new();

        b.iter(|| {
            let mut headers = HeaderMap::new();
            let mut method = None;
            let mut handler = make_parser_handler(
                |line: &RequestLine<'_>| {
                    method = Some(line.to_method()?);
                    Ok(())
                },
                |field: &HeaderField<'_>| {
                    let (name, value) = field.to_header_pair()?;
                    headers.append(name, value);
                    Ok(())
                },
                || Ok(()),
            );
            parser.execute(black_box(request), &mut handler).unwrap();
            drop(handler);
            black_box((method, headers));
        });
    });
}

criterion_group!(benches, bench_simple_request, bench_pipelined_requests, bench_copy_out_headers);
criterion_main!(benches);
