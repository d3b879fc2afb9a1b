//! Performance benchmarks for ride_core using Criterion.rs.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ride_core::geo::DistanceMetric;
use ride_core::ports::NearbyDrivers;
use ride_core::pricing::{PricingConfig, PricingEngine, QuoteContext, TripFacts, VehicleType};
use ride_core::registry::{DriverId, DriverProfile, DriverRegistry, LinearScanNearby};
use ride_core::spatial::GeoIndex;
use ride_core::test_helpers::{central_zone, point_near, test_start, CITY_CENTER};

fn fleet(size: usize) -> Arc<DriverRegistry> {
    let registry = Arc::new(DriverRegistry::new(GeoIndex::default(), DistanceMetric::Haversine));
    let side = (size as f64).sqrt().ceil() as usize;
    for i in 0..size {
        let id = DriverId::new(format!("d{i}"));
        registry.register(id.clone(), DriverProfile::default()).unwrap();
        // Spread over a 20 km square centred on the city.
        let north = (i / side) as f64 / side as f64 * 20.0 - 10.0;
        let east = (i % side) as f64 / side as f64 * 20.0 - 10.0;
        registry
            .go_online(&id, point_near(CITY_CENTER, north, east), None, test_start())
            .unwrap();
    }
    registry
}

fn bench_quote(c: &mut Criterion) {
    let engine = PricingEngine::new(PricingConfig::default());
    let zone = central_zone();
    let facts = TripFacts {
        distance_km: 12.5,
        duration_min: 31.0,
        waiting_min: 6.0,
        vehicle_type: VehicleType::Comfort,
    };
    let ctx = QuoteContext {
        pickup_zone: &zone,
        drop_zone: &zone,
        pair_rate: None,
        use_pickup_zone_rates: true,
        surge_multiplier: 1.7,
        now: test_start(),
    };
    c.bench_function("pricing_quote", |b| {
        b.iter(|| black_box(engine.quote(black_box(&facts), black_box(&ctx))));
    });
}

fn bench_nearby(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("nearby_drivers");
    for size in [100usize, 1_000, 10_000] {
        let registry = fleet(size);
        let linear = LinearScanNearby::new(registry.clone(), DistanceMetric::Haversine);
        group.bench_with_input(BenchmarkId::new("h3_grid", size), &registry, |b, registry| {
            b.to_async(&runtime)
                .iter(|| async { black_box(registry.nearby(CITY_CENTER, 3.0).await.unwrap()) });
        });
        group.bench_with_input(BenchmarkId::new("linear_scan", size), &linear, |b, linear| {
            b.to_async(&runtime)
                .iter(|| async { black_box(linear.nearby(CITY_CENTER, 3.0).await.unwrap()) });
        });
    }
    group.finish();
}

fn bench_reservation(c: &mut Criterion) {
    let registry = fleet(10);
    let driver = DriverId::from("d3");
    c.bench_function("reserve_release", |b| {
        b.iter(|| {
            assert!(registry.try_reserve(black_box(&driver)));
            registry.release(&driver);
        });
    });
}

criterion_group!(benches, bench_quote, bench_nearby, bench_reservation);
criterion_main!(benches);
