//! Change-feed events.
//!
//! The backend pushes `{eventType, new, old}` payloads. They are validated
//! once here into [`ChangeEvent`], so the bridge never re-checks shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::application::repos::{OWNER_COLUMN, PARTITION_COLUMN};
use crate::domain::types::{BusinessType, EntityType};

use super::error::SubscriptionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Wire shape of one change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: Value, new: Value) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(row: Value) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(row),
        }
    }
}

/// The parts of a row image the bridge routes on, plus the raw row.
///
/// `owner` and `partition` are `None` when the image does not carry the
/// column, e.g. a delete that only reports the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub id: Option<Uuid>,
    pub owner: Option<Uuid>,
    pub partition: Option<BusinessType>,
    pub data: Map<String, Value>,
}

impl RowImage {
    fn parse(value: Value) -> Result<Option<Self>, SubscriptionError> {
        let data = match value {
            Value::Null => return Ok(None),
            Value::Object(map) if map.is_empty() => return Ok(None),
            Value::Object(map) => map,
            other => {
                return Err(SubscriptionError::payload(format!(
                    "row image must be an object, got `{other}`"
                )));
            }
        };

        let id = uuid_column(&data, "id")?;
        let owner = uuid_column(&data, OWNER_COLUMN)?;
        let partition = match data.get(PARTITION_COLUMN) {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                raw.parse::<BusinessType>()
                    .map_err(|err| SubscriptionError::payload(err.to_string()))?,
            ),
            Some(other) => {
                return Err(SubscriptionError::payload(format!(
                    "`{PARTITION_COLUMN}` must be a string, got `{other}`"
                )));
            }
        };

        Ok(Some(Self {
            id,
            owner,
            partition,
            data,
        }))
    }
}

fn uuid_column(data: &Map<String, Value>, column: &str) -> Result<Option<Uuid>, SubscriptionError> {
    match data.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|err| SubscriptionError::payload(format!("`{column}`: {err}"))),
        Some(other) => Err(SubscriptionError::payload(format!(
            "`{column}` must be a uuid string, got `{other}`"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert { row: RowImage },
    Update { old: Option<RowImage>, new: RowImage },
    Delete { row: RowImage },
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = SubscriptionError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        let new = raw.new.map(RowImage::parse).transpose()?.flatten();
        let old = raw.old.map(RowImage::parse).transpose()?.flatten();

        match raw.event_type {
            ChangeKind::Insert => new
                .map(|row| ChangeEvent::Insert { row })
                .ok_or_else(|| SubscriptionError::payload("insert without a new row")),
            ChangeKind::Update => new
                .map(|new| ChangeEvent::Update { old, new })
                .ok_or_else(|| SubscriptionError::payload("update without a new row")),
            ChangeKind::Delete => old
                .map(|row| ChangeEvent::Delete { row })
                .ok_or_else(|| SubscriptionError::payload("delete without an old row")),
        }
    }
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    fn images(&self) -> impl Iterator<Item = &RowImage> {
        let (first, second) = match self {
            ChangeEvent::Insert { row } | ChangeEvent::Delete { row } => (Some(row), None),
            ChangeEvent::Update { old, new } => (Some(new), old.as_ref()),
        };
        first.into_iter().chain(second)
    }

    /// Whether this change can affect a collection scoped by `filter`.
    ///
    /// Both images of an update are checked because an update can move a row
    /// into or out of the partition. An image without owner or partition
    /// columns cannot rule the change out, so it counts as a match.
    pub fn is_relevant(&self, filter: &ChangeFilter) -> bool {
        self.images().any(|image| {
            let owner_matches = image.owner.is_none_or(|owner| owner == filter.owner);
            let partition_matches = match (filter.partition, image.partition) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(wanted), Some(actual)) => wanted == actual,
            };
            owner_matches && partition_matches
        })
    }
}

/// What one subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeFilter {
    pub entity: EntityType,
    pub owner: Uuid,
    pub partition: Option<BusinessType>,
}

impl ChangeFilter {
    pub fn new(entity: EntityType, owner: Uuid, partition: Option<BusinessType>) -> Self {
        let partition = if entity.is_partitioned() {
            partition
        } else {
            None
        };
        Self {
            entity,
            owner,
            partition,
        }
    }

    pub fn table(&self) -> &'static str {
        self.entity.table()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn owner() -> Uuid {
        Uuid::from_u128(7)
    }

    fn row(partition: &str) -> Value {
        json!({
            "id": Uuid::from_u128(100).to_string(),
            "user_id": owner().to_string(),
            "business_type": partition,
        })
    }

    fn filter(partition: Option<BusinessType>) -> ChangeFilter {
        ChangeFilter::new(EntityType::Orders, owner(), partition)
    }

    #[test]
    fn parses_wire_payload() {
        let raw: RawChange = serde_json::from_value(json!({
            "eventType": "INSERT",
            "new": row("laundry"),
            "old": {}
        }))
        .expect("wire payload parses");

        let event = ChangeEvent::try_from(raw).expect("valid event");
        match event {
            ChangeEvent::Insert { row } => {
                assert_eq!(row.owner, Some(owner()));
                assert_eq!(row.partition, Some(BusinessType::Laundry));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_rows() {
        let missing_new = RawChange {
            event_type: ChangeKind::Insert,
            new: None,
            old: None,
        };
        assert!(ChangeEvent::try_from(missing_new).is_err());

        let bad_owner = RawChange::insert(json!({ "user_id": 12 }));
        assert!(ChangeEvent::try_from(bad_owner).is_err());

        let bad_partition = RawChange::insert(json!({ "business_type": "bengkel" }));
        assert!(ChangeEvent::try_from(bad_partition).is_err());

        let not_object = RawChange::delete(json!([1, 2]));
        assert!(ChangeEvent::try_from(not_object).is_err());
    }

    #[test]
    fn other_partition_is_ignored() {
        let event = ChangeEvent::try_from(RawChange::insert(row("warung"))).unwrap();
        assert!(!event.is_relevant(&filter(Some(BusinessType::Laundry))));
        assert!(event.is_relevant(&filter(Some(BusinessType::Warung))));
        assert!(event.is_relevant(&filter(None)));
    }

    #[test]
    fn update_moving_between_partitions_matches_both_sides() {
        let event =
            ChangeEvent::try_from(RawChange::update(row("laundry"), row("warung"))).unwrap();
        assert!(event.is_relevant(&filter(Some(BusinessType::Laundry))));
        assert!(event.is_relevant(&filter(Some(BusinessType::Warung))));
        assert!(!event.is_relevant(&filter(Some(BusinessType::CuciMotor))));
    }

    #[test]
    fn delete_with_only_primary_key_is_relevant() {
        let event = ChangeEvent::try_from(RawChange::delete(json!({
            "id": Uuid::from_u128(100).to_string()
        })))
        .unwrap();
        assert_eq!(event.kind(), ChangeKind::Delete);
        assert!(event.is_relevant(&filter(Some(BusinessType::Laundry))));
    }

    #[test]
    fn other_owner_is_ignored() {
        let event = ChangeEvent::try_from(RawChange::insert(json!({
            "user_id": Uuid::from_u128(8).to_string(),
            "business_type": "laundry"
        })))
        .unwrap();
        assert!(!event.is_relevant(&filter(Some(BusinessType::Laundry))));
    }

    #[test]
    fn products_filter_drops_partition() {
        let filter = ChangeFilter::new(EntityType::Products, owner(), Some(BusinessType::Warung));
        assert_eq!(filter.partition, None);
        assert_eq!(filter.table(), "products");
    }
}
