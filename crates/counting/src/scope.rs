//! Scope Resolver: declarative scope → concrete, de-duplicated countable items.
//!
//! Validation is pure (`CountingScope::from_request`). Resolution reads the
//! catalog and the stock ledger through two collaborator ports; it is a plain
//! read, not a lock, so later ledger movements never alter the snapshot.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use stocktake_core::{TenantId, ValueObject};

use crate::Quantity;
use crate::error::CountingError;
use crate::ids::{CategoryId, LocationId, ProductId, VariantId, WarehouseId};
use crate::item::ItemDescriptor;

/// Requested scope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    ProductLocation,
    Product,
    Location,
    Category,
    FullInventory,
}

/// Raw filter criteria as supplied with a counting request.
///
/// Which fields are meaningful depends on the [`ScopeType`]; the combination
/// is checked by [`CountingScope::from_request`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilters {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub product_ids: Vec<ProductId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<LocationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_ids: Vec<LocationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_ids: Vec<CategoryId>,
}

/// A validated scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope_type", rename_all = "snake_case")]
pub enum CountingScope {
    ProductLocation {
        product_ids: BTreeSet<ProductId>,
        location_id: LocationId,
    },
    Product {
        product_ids: BTreeSet<ProductId>,
    },
    Location {
        location_ids: BTreeSet<LocationId>,
    },
    Category {
        category_ids: BTreeSet<CategoryId>,
    },
    FullInventory,
}

impl ValueObject for CountingScope {}

impl CountingScope {
    /// Validate `scope_filters` against `scope_type`.
    ///
    /// Filters that do not belong to the requested type are rejected rather
    /// than ignored, so a request never silently counts more than intended.
    pub fn from_request(scope_type: ScopeType, filters: &ScopeFilters) -> Result<Self, CountingError> {
        let products: BTreeSet<ProductId> = filters.product_ids.iter().copied().collect();
        let mut locations: BTreeSet<LocationId> = filters.location_ids.iter().copied().collect();
        if let Some(l) = filters.location_id {
            locations.insert(l);
        }
        let categories: BTreeSet<CategoryId> = filters.category_ids.iter().copied().collect();

        let reject_extra = |name: &str, present: bool| {
            if present {
                Err(CountingError::invalid_scope(format!(
                    "{name} is not applicable to {scope_type:?} scope"
                )))
            } else {
                Ok(())
            }
        };

        match scope_type {
            ScopeType::ProductLocation => {
                reject_extra("category_ids", !categories.is_empty())?;
                if products.is_empty() {
                    return Err(CountingError::invalid_scope(
                        "product_location scope requires at least one product id",
                    ));
                }
                let mut iter = locations.into_iter();
                match (iter.next(), iter.next()) {
                    (Some(location_id), None) => Ok(CountingScope::ProductLocation {
                        product_ids: products,
                        location_id,
                    }),
                    _ => Err(CountingError::invalid_scope(
                        "product_location scope requires exactly one location id",
                    )),
                }
            }
            ScopeType::Product => {
                reject_extra("location filters", !locations.is_empty())?;
                reject_extra("category_ids", !categories.is_empty())?;
                if products.is_empty() {
                    return Err(CountingError::invalid_scope(
                        "product scope requires at least one product id",
                    ));
                }
                Ok(CountingScope::Product { product_ids: products })
            }
            ScopeType::Location => {
                reject_extra("product_ids", !products.is_empty())?;
                reject_extra("category_ids", !categories.is_empty())?;
                if locations.is_empty() {
                    return Err(CountingError::invalid_scope(
                        "location scope requires at least one location id",
                    ));
                }
                Ok(CountingScope::Location { location_ids: locations })
            }
            ScopeType::Category => {
                reject_extra("product_ids", !products.is_empty())?;
                reject_extra("location filters", !locations.is_empty())?;
                if categories.is_empty() {
                    return Err(CountingError::invalid_scope(
                        "category scope requires at least one category id",
                    ));
                }
                Ok(CountingScope::Category { category_ids: categories })
            }
            ScopeType::FullInventory => {
                reject_extra("product_ids", !products.is_empty())?;
                reject_extra("location filters", !locations.is_empty())?;
                reject_extra("category_ids", !categories.is_empty())?;
                Ok(CountingScope::FullInventory)
            }
        }
    }

    pub fn scope_type(&self) -> ScopeType {
        match self {
            CountingScope::ProductLocation { .. } => ScopeType::ProductLocation,
            CountingScope::Product { .. } => ScopeType::Product,
            CountingScope::Location { .. } => ScopeType::Location,
            CountingScope::Category { .. } => ScopeType::Category,
            CountingScope::FullInventory => ScopeType::FullInventory,
        }
    }

    /// Re-check the non-empty filter rules for a scope that was built directly.
    pub fn validate(&self) -> Result<(), CountingError> {
        let empty = match self {
            CountingScope::ProductLocation { product_ids, .. }
            | CountingScope::Product { product_ids } => product_ids.is_empty(),
            CountingScope::Location { location_ids } => location_ids.is_empty(),
            CountingScope::Category { category_ids } => category_ids.is_empty(),
            CountingScope::FullInventory => false,
        };
        if empty {
            return Err(CountingError::invalid_scope(format!(
                "{:?} scope requires a non-empty filter",
                self.scope_type()
            )));
        }
        Ok(())
    }
}

// -------------------------
// Reference data ports
// -------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantInfo {
    pub id: VariantId,
    pub name: String,
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub barcode: Option<String>,
    pub category_id: Option<CategoryId>,
    pub unit_of_measure: String,
    pub variants: Vec<VariantInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: LocationId,
    pub name: String,
    pub warehouse_id: WarehouseId,
    pub warehouse_name: String,
}

/// One on-hand balance in the stock ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPosition {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub quantity: Quantity,
}

/// Read-only product/location catalog.
pub trait CatalogReader: Send + Sync {
    fn product(&self, tenant_id: TenantId, product_id: ProductId) -> Option<ProductInfo>;

    fn products_in_categories(
        &self,
        tenant_id: TenantId,
        category_ids: &BTreeSet<CategoryId>,
    ) -> Vec<ProductId>;

    fn location(&self, tenant_id: TenantId, location_id: LocationId) -> Option<LocationInfo>;
}

/// Read-only stock ledger (the running quantities a count is measured against).
pub trait StockLedgerReader: Send + Sync {
    fn positions(&self, tenant_id: TenantId) -> Vec<StockPosition>;
}

/// One resolved (product, variant, location, warehouse) tuple with its
/// theoretical quantity snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedItem {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: LocationId,
    pub warehouse_id: WarehouseId,
    pub theoretical_qty: Quantity,
    pub descriptor: ItemDescriptor,
}

type ItemKey = (ProductId, Option<VariantId>, LocationId);

/// Expand a validated scope into the concrete item list.
///
/// The output is ordered by (product, variant, location) and contains each
/// tuple once; duplicate ledger rows for one tuple are summed. Ledger rows
/// that reference products or locations missing from the catalog are skipped
/// with a warning.
pub fn resolve_scope(
    tenant_id: TenantId,
    scope: &CountingScope,
    catalog: &(impl CatalogReader + ?Sized),
    ledger: &(impl StockLedgerReader + ?Sized),
) -> Result<Vec<ResolvedItem>, CountingError> {
    let mut wanted: BTreeMap<ItemKey, Quantity> = BTreeMap::new();

    match scope {
        CountingScope::ProductLocation {
            product_ids,
            location_id,
        } => {
            if catalog.location(tenant_id, *location_id).is_none() {
                return Err(CountingError::invalid_scope(format!(
                    "unknown location {location_id}"
                )));
            }
            // Every requested product is counted at the location, even without a ledger row.
            for product_id in product_ids {
                let product = catalog.product(tenant_id, *product_id).ok_or_else(|| {
                    CountingError::invalid_scope(format!("unknown product {product_id}"))
                })?;
                if product.variants.is_empty() {
                    wanted.insert((product.id, None, *location_id), Quantity::ZERO);
                } else {
                    for v in &product.variants {
                        wanted.insert((product.id, Some(v.id), *location_id), Quantity::ZERO);
                    }
                }
            }
            for pos in ledger.positions(tenant_id) {
                let key = (pos.product_id, pos.variant_id, pos.location_id);
                if let Some(qty) = wanted.get_mut(&key) {
                    *qty += pos.quantity;
                }
            }
        }
        other => {
            let categories_products: Option<BTreeSet<ProductId>> = match other {
                CountingScope::Category { category_ids } => Some(
                    catalog
                        .products_in_categories(tenant_id, category_ids)
                        .into_iter()
                        .collect(),
                ),
                _ => None,
            };

            for pos in ledger.positions(tenant_id) {
                let included = match other {
                    CountingScope::Product { product_ids } => product_ids.contains(&pos.product_id),
                    CountingScope::Location { location_ids } => {
                        location_ids.contains(&pos.location_id)
                    }
                    CountingScope::Category { .. } => categories_products
                        .as_ref()
                        .is_some_and(|set| set.contains(&pos.product_id)),
                    CountingScope::FullInventory => true,
                    CountingScope::ProductLocation { .. } => false,
                };
                if included {
                    *wanted
                        .entry((pos.product_id, pos.variant_id, pos.location_id))
                        .or_insert(Quantity::ZERO) += pos.quantity;
                }
            }
        }
    }

    let mut items = Vec::with_capacity(wanted.len());
    for ((product_id, variant_id, location_id), theoretical_qty) in wanted {
        let Some(product) = catalog.product(tenant_id, product_id) else {
            tracing::warn!(%product_id, "ledger references a product missing from the catalog; skipped");
            continue;
        };
        let Some(location) = catalog.location(tenant_id, location_id) else {
            tracing::warn!(%location_id, "ledger references a location missing from the catalog; skipped");
            continue;
        };
        items.push(ResolvedItem {
            product_id,
            variant_id,
            location_id,
            warehouse_id: location.warehouse_id,
            theoretical_qty,
            descriptor: ItemDescriptor::from_catalog(&product, variant_id, &location),
        });
    }

    if items.is_empty() {
        return Err(CountingError::invalid_scope(
            "scope resolved to no countable items",
        ));
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Fixture {
        products: HashMap<ProductId, ProductInfo>,
        locations: HashMap<LocationId, LocationInfo>,
        positions: Vec<StockPosition>,
    }

    impl CatalogReader for Fixture {
        fn product(&self, _: TenantId, id: ProductId) -> Option<ProductInfo> {
            self.products.get(&id).cloned()
        }

        fn products_in_categories(&self, _: TenantId, cats: &BTreeSet<CategoryId>) -> Vec<ProductId> {
            self.products
                .values()
                .filter(|p| p.category_id.is_some_and(|c| cats.contains(&c)))
                .map(|p| p.id)
                .collect()
        }

        fn location(&self, _: TenantId, id: LocationId) -> Option<LocationInfo> {
            self.locations.get(&id).cloned()
        }
    }

    impl StockLedgerReader for Fixture {
        fn positions(&self, _: TenantId) -> Vec<StockPosition> {
            self.positions.clone()
        }
    }

    impl Fixture {
        fn add_product(&mut self, category: Option<CategoryId>) -> ProductId {
            let id = ProductId::new();
            self.products.insert(
                id,
                ProductInfo {
                    id,
                    sku: format!("SKU-{}", self.products.len()),
                    name: "Widget".to_string(),
                    barcode: None,
                    category_id: category,
                    unit_of_measure: "pcs".to_string(),
                    variants: vec![],
                },
            );
            id
        }

        fn add_location(&mut self) -> LocationId {
            let id = LocationId::new();
            self.locations.insert(
                id,
                LocationInfo {
                    id,
                    name: "A-01".to_string(),
                    warehouse_id: WarehouseId::new(),
                    warehouse_name: "Main".to_string(),
                },
            );
            id
        }

        fn stock(&mut self, product_id: ProductId, location_id: LocationId, qty: Quantity) {
            self.positions.push(StockPosition {
                product_id,
                variant_id: None,
                location_id,
                quantity: qty,
            });
        }
    }

    #[test]
    fn product_location_requires_products_and_a_single_location() {
        let p = ProductId::new();
        let err = CountingScope::from_request(
            ScopeType::ProductLocation,
            &ScopeFilters {
                product_ids: vec![p],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CountingError::InvalidScope(_)));

        let err = CountingScope::from_request(
            ScopeType::ProductLocation,
            &ScopeFilters {
                product_ids: vec![p],
                location_ids: vec![LocationId::new(), LocationId::new()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CountingError::InvalidScope(_)));

        let loc = LocationId::new();
        let scope = CountingScope::from_request(
            ScopeType::ProductLocation,
            &ScopeFilters {
                product_ids: vec![p, p],
                location_id: Some(loc),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(scope.scope_type(), ScopeType::ProductLocation);
    }

    #[test]
    fn empty_filter_sets_are_rejected_per_type() {
        for t in [ScopeType::Product, ScopeType::Location, ScopeType::Category] {
            let err = CountingScope::from_request(t, &ScopeFilters::default()).unwrap_err();
            assert!(matches!(err, CountingError::InvalidScope(_)), "{t:?}");
        }
        assert_eq!(
            CountingScope::from_request(ScopeType::FullInventory, &ScopeFilters::default()).unwrap(),
            CountingScope::FullInventory
        );
    }

    #[test]
    fn foreign_filters_are_rejected() {
        let err = CountingScope::from_request(
            ScopeType::FullInventory,
            &ScopeFilters {
                category_ids: vec![CategoryId::new()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CountingError::InvalidScope(_)));
    }

    #[test]
    fn product_location_snapshots_ledger_and_defaults_missing_rows_to_zero() {
        let mut fx = Fixture::default();
        let stocked = fx.add_product(None);
        let unstocked = fx.add_product(None);
        let loc = fx.add_location();
        fx.stock(stocked, loc, dec!(50));

        let scope = CountingScope::ProductLocation {
            product_ids: [stocked, unstocked].into_iter().collect(),
            location_id: loc,
        };
        let items = resolve_scope(TenantId::new(), &scope, &fx, &fx).unwrap();

        assert_eq!(items.len(), 2);
        let qty = |p| items.iter().find(|i| i.product_id == p).unwrap().theoretical_qty;
        assert_eq!(qty(stocked), dec!(50));
        assert_eq!(qty(unstocked), dec!(0));
    }

    #[test]
    fn duplicate_ledger_rows_collapse_into_one_item() {
        let mut fx = Fixture::default();
        let p = fx.add_product(None);
        let loc = fx.add_location();
        fx.stock(p, loc, dec!(3));
        fx.stock(p, loc, dec!(4));

        let items = resolve_scope(TenantId::new(), &CountingScope::FullInventory, &fx, &fx).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].theoretical_qty, dec!(7));
    }

    #[test]
    fn category_scope_only_picks_products_in_category() {
        let mut fx = Fixture::default();
        let cat = CategoryId::new();
        let inside = fx.add_product(Some(cat));
        let outside = fx.add_product(None);
        let loc = fx.add_location();
        fx.stock(inside, loc, dec!(1));
        fx.stock(outside, loc, dec!(1));

        let scope = CountingScope::Category {
            category_ids: [cat].into_iter().collect(),
        };
        let items = resolve_scope(TenantId::new(), &scope, &fx, &fx).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_id, inside);
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut fx = Fixture::default();
        let loc_a = fx.add_location();
        let loc_b = fx.add_location();
        for _ in 0..5 {
            let p = fx.add_product(None);
            fx.stock(p, loc_b, dec!(2));
            fx.stock(p, loc_a, dec!(1));
        }
        let scope = CountingScope::Location {
            location_ids: [loc_a, loc_b].into_iter().collect(),
        };
        let first = resolve_scope(TenantId::new(), &scope, &fx, &fx).unwrap();
        fx.positions.reverse();
        let second = resolve_scope(TenantId::new(), &scope, &fx, &fx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_resolution_is_an_invalid_scope() {
        let mut fx = Fixture::default();
        let loc = fx.add_location();
        let scope = CountingScope::Location {
            location_ids: [loc].into_iter().collect(),
        };
        let err = resolve_scope(TenantId::new(), &scope, &fx, &fx).unwrap_err();
        assert!(matches!(err, CountingError::InvalidScope(_)));
    }
}
