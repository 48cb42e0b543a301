use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use holdfast::{AdmissionConfig, AdmissionGuard, AdmissionLayer, ClientKey};
use std::net::IpAddr;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// A service that returns its input untouched, so only the layer is measured.
#[derive(Clone)]
struct EchoService;

impl Service<IpAddr> for EchoService {
    type Response = IpAddr;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: IpAddr) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn populated_guard(blocked: usize) -> AdmissionGuard {
    let config =
        AdmissionConfig::new(1, Duration::from_secs(6000), blocked * 2, Duration::from_secs(60))
            .unwrap();
    let guard = AdmissionGuard::new(config);
    for n in 0..blocked {
        guard.record_failed_attempt(&format!("10.{}.{}.{}", n >> 16, (n >> 8) & 0xff, n & 0xff));
    }
    guard
}

fn is_blocked_lookups(c: &mut Criterion) {
    let guard = populated_guard(1000);

    c.bench_function("is_blocked_miss_1k_blocked", |b| {
        b.iter(|| black_box(guard.is_blocked(black_box("192.0.2.1"))));
    });
    c.bench_function("is_blocked_hit_1k_blocked", |b| {
        b.iter(|| black_box(guard.is_blocked(black_box("10.0.1.44"))));
    });
}

fn failure_recording(c: &mut Criterion) {
    let config =
        AdmissionConfig::new(u32::MAX, Duration::from_secs(6000), 1000, Duration::from_secs(60))
            .unwrap();
    let guard = AdmissionGuard::new(config);
    let keys: Vec<String> = (0..256).map(|n| format!("198.51.100.{n}")).collect();
    let mut idx = 0usize;

    c.bench_function("record_failed_attempt_256_keys", |b| {
        b.iter(|| {
            idx = (idx + 1) % keys.len();
            black_box(guard.record_failed_attempt(&keys[idx]))
        });
    });
}

fn full_sweep(c: &mut Criterion) {
    c.bench_function("cleanup_expired_1k_blocked", |b| {
        let guard = populated_guard(1000);
        b.iter(|| black_box(guard.cleanup_expired()));
    });
}

fn layer_pass_through(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let guard = populated_guard(1000);
    let layer = AdmissionLayer::new(guard, |ip: &IpAddr| ClientKey::from(*ip));
    let svc = ServiceBuilder::new().layer(layer).service(EchoService);
    let peer: IpAddr = [192, 0, 2, 1].into();

    c.bench_function("admission_layer_pass_through", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box(peer))).await;
        });
    });
}

criterion_group!(benches, is_blocked_lookups, failure_recording, full_sweep, layer_pass_through);
criterion_main!(benches);
