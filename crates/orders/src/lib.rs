//! `trailmark-orders` — pure order domain.
//!
//! Order identifiers, the cart item union, addresses, promotions, and the
//! authoritative price reconciler. No persistence or I/O here; the stores in
//! `trailmark-infra` consume these types.

pub mod cart;
pub mod event;
pub mod id;
pub mod order;
pub mod pricing;
pub mod promotion;

pub use cart::{CartItem, GeoBounds, GeoPoint, MapGeometry, MapLabel, ProductionClass, ShippingClass};
pub use event::{EventSource, NewOrderEvent, OrderEvent};
pub use id::OrderId;
pub use order::{Address, AddressKind, Order, OrderDetails};
pub use pricing::{PriceAnomaly, PricingError, ReconciledPrice, reconcile};
pub use promotion::{Discount, Promotion};
