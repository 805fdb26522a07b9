//! In-memory catalog and stock ledger.
//!
//! The real product catalog and the stock ledger belong to other systems;
//! these implementations back dev runs and tests behind the same ports the
//! scope resolver reads through.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use stocktake_core::TenantId;
use stocktake_counting::{
    CatalogReader, CategoryId, LocationId, LocationInfo, ProductId, ProductInfo, Quantity,
    StockLedgerReader, StockPosition, VariantId,
};

#[derive(Debug, Default)]
struct TenantCatalog {
    products: HashMap<ProductId, ProductInfo>,
    locations: HashMap<LocationId, LocationInfo>,
}

/// Products (with variants, barcodes, categories, units) and locations per tenant.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tenants: RwLock<HashMap<TenantId, TenantCatalog>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_product(&self, tenant_id: TenantId, product: ProductInfo) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants
                .entry(tenant_id)
                .or_default()
                .products
                .insert(product.id, product);
        }
    }

    pub fn upsert_location(&self, tenant_id: TenantId, location: LocationInfo) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants
                .entry(tenant_id)
                .or_default()
                .locations
                .insert(location.id, location);
        }
    }
}

impl CatalogReader for InMemoryCatalog {
    fn product(&self, tenant_id: TenantId, product_id: ProductId) -> Option<ProductInfo> {
        let tenants = self.tenants.read().ok()?;
        tenants.get(&tenant_id)?.products.get(&product_id).cloned()
    }

    fn products_in_categories(
        &self,
        tenant_id: TenantId,
        category_ids: &BTreeSet<CategoryId>,
    ) -> Vec<ProductId> {
        let Ok(tenants) = self.tenants.read() else {
            return vec![];
        };
        let Some(catalog) = tenants.get(&tenant_id) else {
            return vec![];
        };
        let mut ids: Vec<ProductId> = catalog
            .products
            .values()
            .filter(|p| p.category_id.is_some_and(|c| category_ids.contains(&c)))
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    fn location(&self, tenant_id: TenantId, location_id: LocationId) -> Option<LocationInfo> {
        let tenants = self.tenants.read().ok()?;
        tenants.get(&tenant_id)?.locations.get(&location_id).cloned()
    }
}

type PositionKey = (ProductId, Option<VariantId>, LocationId);

/// On-hand balances per tenant.
///
/// Movements applied after a session activated do not reach that session:
/// the session holds its own snapshot.
#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    balances: RwLock<HashMap<TenantId, HashMap<PositionKey, Quantity>>>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        quantity: Quantity,
    ) {
        if let Ok(mut balances) = self.balances.write() {
            balances
                .entry(tenant_id)
                .or_default()
                .insert((product_id, variant_id, location_id), quantity);
        }
    }

    /// Apply a signed movement (receipt, issue, transfer leg).
    pub fn record_movement(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: LocationId,
        delta: Quantity,
    ) {
        if let Ok(mut balances) = self.balances.write() {
            *balances
                .entry(tenant_id)
                .or_default()
                .entry((product_id, variant_id, location_id))
                .or_insert(Quantity::ZERO) += delta;
        }
    }
}

impl StockLedgerReader for InMemoryStockLedger {
    fn positions(&self, tenant_id: TenantId) -> Vec<StockPosition> {
        let Ok(balances) = self.balances.read() else {
            return vec![];
        };
        let mut out: Vec<StockPosition> = balances
            .get(&tenant_id)
            .map(|m| {
                m.iter()
                    .map(|(&(product_id, variant_id, location_id), &quantity)| StockPosition {
                        product_id,
                        variant_id,
                        location_id,
                        quantity,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|p| (p.product_id, p.variant_id, p.location_id));
        out
    }
}
