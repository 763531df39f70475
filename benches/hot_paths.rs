use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memsniff::analysis::Shard;
use memsniff::assembly::ConnectionKey;
use memsniff::protocol::redis::RespLimits;
use memsniff::protocol::{self, Conversation, ConversationId, Event, EventSink, EventType, SubmitError};
use memsniff::stream::StreamReader;

const EXCHANGES: usize = 256;

struct NullSink;

impl EventSink for NullSink {
    fn submit_events(&self, _: ConversationId, events: Vec<Event>) -> Result<(), SubmitError> {
        black_box(events);
        Ok(())
    }
}

fn key() -> ConnectionKey {
    ConnectionKey::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        11211,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        40000,
    )
}

fn memcache_script() -> (Bytes, Bytes) {
    let mut client = Vec::new();
    let mut server = Vec::new();
    for i in 0..EXCHANGES {
        client.extend_from_slice(format!("get user:{i}\r\n").as_bytes());
        server.extend_from_slice(format!("VALUE user:{i} 0 16\r\n0123456789abcdef\r\nEND\r\n").as_bytes());
    }
    (Bytes::from(client), Bytes::from(server))
}

fn redis_script() -> (Bytes, Bytes) {
    let mut client = Vec::new();
    let mut server = Vec::new();
    for i in 0..EXCHANGES {
        let k = format!("user:{i}");
        client.extend_from_slice(format!("*2\r\n$3\r\nGET\r\n${}\r\n{k}\r\n", k.len()).as_bytes());
        server.extend_from_slice(b"$16\r\n0123456789abcdef\r\n");
    }
    (Bytes::from(client), Bytes::from(server))
}

/// Builds a conversation whose directions hold the whole script.
fn conversation(client_bytes: &Bytes, server_bytes: &Bytes) -> Conversation {
    let now = SystemTime::now();
    let mut client = StreamReader::new(64 * 1024);
    let mut server = StreamReader::new(64 * 1024);
    let mut cw = client.attach(4);
    let mut sw = server.attach(4);
    cw.reassembled(client_bytes.clone(), now, 0);
    cw.complete();
    sw.reassembled(server_bytes.clone(), now, 0);
    sw.complete();

    Conversation::new(key(), client, server, Arc::new(NullSink), 128)
}

fn bench_protocols(c: &mut Criterion) {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(_) => return,
    };

    let (mc_client, mc_server) = memcache_script();
    c.bench_function("memcache_text_256_gets", |b| {
        b.iter(|| {
            let conv = conversation(&mc_client, &mc_server);
            rt.block_on(protocol::run(conv, RespLimits::default()));
        });
    });

    let (redis_client, redis_server) = redis_script();
    c.bench_function("redis_256_gets", |b| {
        b.iter(|| {
            let conv = conversation(&redis_client, &redis_server);
            rt.block_on(protocol::run(conv, RespLimits::default()));
        });
    });
}

fn bench_shard_apply(c: &mut Criterion) {
    let now = SystemTime::now();
    let events: Vec<Event> = (0..1024)
        .map(|i| Event::new(EventType::GetHit, format!("user:{}", i % 64), 16 + (i % 3), now, now))
        .collect();

    c.bench_function("shard_apply_1024", |b| {
        let mut shard = Shard::new();
        b.iter(|| {
            shard.apply(black_box(&events));
        });
    });
}

criterion_group!(benches, bench_protocols, bench_shard_apply);
criterion_main!(benches);
