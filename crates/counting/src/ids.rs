use serde::{Deserialize, Serialize};

use stocktake_core::{AggregateId, uuid_newtype};

/// Counting session identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub AggregateId);

impl SessionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

uuid_newtype!(
    /// A countable item inside one session.
    CountableItemId,
    "CountableItemId"
);
uuid_newtype!(ProductId, "ProductId");
uuid_newtype!(VariantId, "VariantId");
uuid_newtype!(LocationId, "LocationId");
uuid_newtype!(WarehouseId, "WarehouseId");
uuid_newtype!(CategoryId, "CategoryId");

/// Which of the (up to three) independent counts an entry belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CountNumber {
    First,
    Second,
    Third,
}

impl CountNumber {
    pub const ALL: [CountNumber; 3] = [CountNumber::First, CountNumber::Second, CountNumber::Third];

    pub fn as_u8(self) -> u8 {
        match self {
            CountNumber::First => 1,
            CountNumber::Second => 2,
            CountNumber::Third => 3,
        }
    }
}

impl From<CountNumber> for u8 {
    fn from(value: CountNumber) -> Self {
        value.as_u8()
    }
}

impl TryFrom<u8> for CountNumber {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CountNumber::First),
            2 => Ok(CountNumber::Second),
            3 => Ok(CountNumber::Third),
            other => Err(format!("count number must be 1, 2 or 3 (got {other})")),
        }
    }
}

impl core::fmt::Display for CountNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "count_{}", self.as_u8())
    }
}
