//! Cart line items.
//!
//! A cart is a list of tagged line items owned exclusively by one order.
//! Items are inserted once, in input order, at order creation and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};

use trailmark_core::{Currency, DomainError, DomainResult, Money};

/// Point on the map (WGS84 degrees).
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Bounding box of the printed map area.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl GeoBounds {
    /// Longitude handling wraps across the antimeridian when `west > east`.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        let lat_ok = point.lat >= self.south && point.lat <= self.north;
        let lng_ok = if self.west <= self.east {
            point.lng >= self.west && point.lng <= self.east
        } else {
            point.lng >= self.west || point.lng <= self.east
        };
        lat_ok && lng_ok
    }
}

/// Free-text label pinned onto the poster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapLabel {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<GeoPoint>,
}

/// Declared print geometry of a map poster.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapGeometry {
    pub center: GeoPoint,
    pub bounds: GeoBounds,
}

impl MapGeometry {
    /// The dispatch pass rejects (never auto-corrects) geometry whose center
    /// lies outside its own bounding box or outside valid coordinate ranges.
    pub fn validate(&self) -> DomainResult<()> {
        if !(-90.0..=90.0).contains(&self.center.lat)
            || !(-180.0..=180.0).contains(&self.center.lng)
        {
            return Err(DomainError::validation(format!(
                "map center out of coordinate range: ({}, {})",
                self.center.lat, self.center.lng
            )));
        }
        if self.bounds.north <= self.bounds.south {
            return Err(DomainError::validation(
                "map bounds: north must be greater than south",
            ));
        }
        if !self.bounds.contains(&self.center) {
            return Err(DomainError::validation(format!(
                "map center ({}, {}) outside declared bounds",
                self.center.lat, self.center.lng
            )));
        }
        Ok(())
    }
}

/// Shipping service level marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShippingClass {
    Standard,
    Express,
    Priority,
}

/// Production service level marker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductionClass {
    Standard,
    Express,
}

/// One cart line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CartItem {
    MapPoster {
        quantity: u32,
        unit_price: Money,
        geometry: MapGeometry,
        #[serde(default)]
        labels: Vec<MapLabel>,
    },
    GiftCardValue {
        quantity: u32,
        unit_price: Money,
        /// Redeemable value in cents; may differ from the purchase price.
        value: i64,
    },
    PhysicalGiftCard {
        quantity: u32,
        unit_price: Money,
    },
    Shipping {
        quantity: u32,
        unit_price: Money,
        class: ShippingClass,
    },
    Production {
        quantity: u32,
        unit_price: Money,
        class: ProductionClass,
    },
}

impl CartItem {
    pub fn quantity(&self) -> u32 {
        match self {
            CartItem::MapPoster { quantity, .. }
            | CartItem::GiftCardValue { quantity, .. }
            | CartItem::PhysicalGiftCard { quantity, .. }
            | CartItem::Shipping { quantity, .. }
            | CartItem::Production { quantity, .. } => *quantity,
        }
    }

    pub fn unit_price(&self) -> Money {
        match self {
            CartItem::MapPoster { unit_price, .. }
            | CartItem::GiftCardValue { unit_price, .. }
            | CartItem::PhysicalGiftCard { unit_price, .. }
            | CartItem::Shipping { unit_price, .. }
            | CartItem::Production { unit_price, .. } => *unit_price,
        }
    }

    pub fn currency(&self) -> Currency {
        self.unit_price().currency
    }

    /// `quantity * unit_price`, saturating; the pricing hard ceiling catches
    /// any saturated value long before it could be accepted.
    pub fn line_total(&self) -> i64 {
        self.unit_price()
            .amount
            .saturating_mul(i64::from(self.quantity()))
    }

    pub fn geometry(&self) -> Option<&MapGeometry> {
        match self {
            CartItem::MapPoster { geometry, .. } => Some(geometry),
            _ => None,
        }
    }
}
