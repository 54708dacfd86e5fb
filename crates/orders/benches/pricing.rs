use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use trailmark_core::{Currency, Money};
use trailmark_orders::{
    CartItem, Discount, GeoBounds, GeoPoint, MapGeometry, Promotion, reconcile,
};

fn sample_cart(items: usize) -> Vec<CartItem> {
    (0..items)
        .map(|i| CartItem::MapPoster {
            quantity: 1 + (i as u32 % 3),
            unit_price: Money::new(1500 + (i as i64 * 37) % 900, Currency::Eur),
            geometry: MapGeometry {
                center: GeoPoint { lat: 52.5, lng: 13.4 },
                bounds: GeoBounds {
                    north: 53.0,
                    south: 52.0,
                    east: 14.0,
                    west: 13.0,
                },
            },
            labels: vec![],
        })
        .collect()
}

fn bench_reconcile(c: &mut Criterion) {
    let cart = sample_cart(8);
    let promotion = Promotion {
        code: "PERCENTAGE20".to_string(),
        discount: Discount::Percentage { percent: 20 },
        expires_at: None,
        gift_card: false,
    };
    let now = Utc::now();

    c.bench_function("reconcile_8_items_with_promotion", |b| {
        b.iter(|| {
            reconcile(
                black_box(&cart),
                Currency::Eur,
                black_box(Some(&promotion)),
                now,
            )
        })
    });
}

criterion_group!(benches, bench_reconcile);
criterion_main!(benches);
