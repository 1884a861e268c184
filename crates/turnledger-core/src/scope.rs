//! Scope resolution: which customers, and which of their channels
//!
//! A batch names either a partner (resolved through a [`PartnerDirectory`])
//! or explicit customer/channel lists. Channels per customer come from the
//! chat collection's distinct channel values in the requested range, unless
//! the caller pinned them.

use crate::error::CoreError;
use crate::models::{ChannelId, CustomerId, DateRange, IdValue};
use crate::schema::{LogSchema, LogType, SchemaCatalog, CREATOR_FIELD};
use crate::store::{Filter, Reader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Concurrent distinct-channel lookups while resolving a scope
const MAX_CONCURRENT_LOOKUPS: usize = 4;

/// Partner membership lookup
#[async_trait]
pub trait PartnerDirectory: Send + Sync {
    async fn resolve_partner_members(&self, partner_id: &str)
        -> Result<Vec<CustomerId>, CoreError>;
}

/// Fixed partner → members map
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    members: HashMap<String, Vec<CustomerId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partner<I, C>(mut self, partner_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CustomerId>,
    {
        self.members.insert(
            partner_id.into(),
            members.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[async_trait]
impl PartnerDirectory for StaticDirectory {
    async fn resolve_partner_members(
        &self,
        partner_id: &str,
    ) -> Result<Vec<CustomerId>, CoreError> {
        Ok(self.members.get(partner_id).cloned().unwrap_or_default())
    }
}

/// Members read from the customers collection by their `partner` field
#[derive(Clone)]
pub struct CollectionDirectory {
    reader: Reader,
    collection: String,
    partner_field: String,
}

impl CollectionDirectory {
    pub fn new(reader: Reader, collection: impl Into<String>) -> Self {
        Self {
            reader,
            collection: collection.into(),
            partner_field: "partner".to_string(),
        }
    }

    pub fn with_partner_field(mut self, field: impl Into<String>) -> Self {
        self.partner_field = field.into();
        self
    }
}

#[async_trait]
impl PartnerDirectory for CollectionDirectory {
    async fn resolve_partner_members(
        &self,
        partner_id: &str,
    ) -> Result<Vec<CustomerId>, CoreError> {
        let filter = Filter::new().ids(self.partner_field.as_str(), &IdValue::expand(partner_id));
        let ids = self.reader.distinct(&self.collection, "_id", &filter).await?;
        Ok(ids
            .iter()
            .filter_map(IdValue::from_value)
            .map(|id| CustomerId::from(&id))
            .collect())
    }
}

/// What a batch covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeSelector {
    Partner(String),
    Explicit {
        customers: Vec<CustomerId>,
        #[serde(default)]
        channels: Vec<ChannelId>,
    },
}

/// One customer and the channels to query for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerScope {
    pub customer_id: CustomerId,
    /// Empty means "no channel filter"
    pub channel_ids: Vec<ChannelId>,
}

/// Flat, resolved scope of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub customers: Vec<CustomerScope>,
}

impl Scope {
    pub fn member_count(&self) -> usize {
        self.customers.len()
    }

    pub fn channel_count(&self) -> usize {
        self.customers.iter().map(|c| c.channel_ids.len()).sum()
    }
}

/// Resolves a [`ScopeSelector`] against the directory and chat collection
#[derive(Clone)]
pub struct ScopeResolver {
    reader: Reader,
    directory: Arc<dyn PartnerDirectory>,
    chats: String,
    schema: LogSchema,
}

impl ScopeResolver {
    pub fn new(
        reader: Reader,
        directory: Arc<dyn PartnerDirectory>,
        chats: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            directory,
            chats: chats.into(),
            schema: SchemaCatalog::default().get(LogType::Chat).clone(),
        }
    }

    pub async fn resolve(
        &self,
        selector: &ScopeSelector,
        range: &DateRange,
    ) -> Result<Scope, CoreError> {
        let (customers, pinned_channels) = match selector {
            ScopeSelector::Partner(partner_id) => {
                let members = self.directory.resolve_partner_members(partner_id).await?;
                let members = dedup_customers(members);
                if members.is_empty() {
                    return Err(CoreError::PartnerNotFound {
                        partner_id: partner_id.clone(),
                    });
                }
                info!(partner = %partner_id, members = members.len(), "Partner resolved");
                (members, Vec::new())
            }
            ScopeSelector::Explicit {
                customers,
                channels,
            } => {
                let customers = dedup_customers(customers.clone());
                if customers.is_empty() {
                    return Err(CoreError::invalid_request(
                        "Either a partnerId or at least one customer id is required",
                    ));
                }
                let channels: BTreeSet<ChannelId> = channels
                    .iter()
                    .filter(|c| !c.as_str().trim().is_empty())
                    .cloned()
                    .collect();
                (customers, channels.into_iter().collect())
            }
        };

        if !pinned_channels.is_empty() {
            return Ok(Scope {
                customers: customers
                    .into_iter()
                    .map(|customer_id| CustomerScope {
                        customer_id,
                        channel_ids: pinned_channels.clone(),
                    })
                    .collect(),
            });
        }

        self.lookup_channels(customers, range).await
    }

    /// Distinct channels per customer, bounded concurrency
    async fn lookup_channels(
        &self,
        customers: Vec<CustomerId>,
        range: &DateRange,
    ) -> Result<Scope, CoreError> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_LOOKUPS));
        let mut handles = Vec::with_capacity(customers.len());

        for customer_id in customers {
            let sem = semaphore.clone();
            let reader = self.reader.clone();
            let chats = self.chats.clone();
            let customer_field = self.schema.customer_field.unwrap_or(CREATOR_FIELD);
            let time_field = self.schema.timestamp_field;
            let channel_field = self.schema.channel_field;
            let range = *range;

            let handle = tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| CoreError::upstream("resolve channels", e.to_string()))?;
                let filter = Filter::new()
                    .ids(customer_field, &customer_id.forms())
                    .time_range(time_field, range);
                let values = reader.distinct(&chats, channel_field, &filter).await?;
                let channels: BTreeSet<ChannelId> = values
                    .iter()
                    .filter_map(IdValue::from_value)
                    .map(|id| ChannelId::from(&id))
                    .collect();
                Ok::<_, CoreError>(CustomerScope {
                    customer_id,
                    channel_ids: channels.into_iter().collect(),
                })
            });
            handles.push(handle);
        }

        let mut scope = Scope::default();
        for handle in handles {
            let customer = handle
                .await
                .map_err(|e| CoreError::upstream("resolve channels", format!("Task panic: {}", e)))??;
            scope.customers.push(customer);
        }

        debug!(
            customers = scope.member_count(),
            channels = scope.channel_count(),
            "Scope resolved"
        );
        Ok(scope)
    }
}

fn dedup_customers(customers: Vec<CustomerId>) -> Vec<CustomerId> {
    let mut seen = BTreeSet::new();
    customers
        .into_iter()
        .filter(|c| !c.as_str().trim().is_empty())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ReadOptions};
    use serde_json::json;

    fn range() -> DateRange {
        DateRange::parse("2024-01-01", "2024-01-31").unwrap()
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (creator, channel, day) in [
            ("c1", "ch-a", "2024-01-05"),
            ("c1", "ch-b", "2024-01-06"),
            ("c1", "ch-a", "2024-01-07"),
            ("c1", "ch-old", "2023-12-01"),
            ("c2", "ch-c", "2024-01-10"),
        ] {
            store.insert_value(
                "chats",
                json!({"creator": creator, "channel": channel, "session": "s",
                       "createdAt": format!("{}T10:00:00Z", day)}),
            );
        }
        store.insert_value("customers", json!({"_id": "c1", "partner": "p1"}));
        store.insert_value("customers", json!({"_id": "c2", "partner": "p1"}));
        store.insert_value("customers", json!({"_id": "c3", "partner": "p2"}));
        store
    }

    fn resolver(store: Arc<MemoryStore>, directory: Arc<dyn PartnerDirectory>) -> ScopeResolver {
        ScopeResolver::new(Reader::new(store, ReadOptions::default()), directory, "chats")
    }

    #[tokio::test]
    async fn test_partner_scope_with_channel_lookup() {
        let store = seeded();
        let reader = Reader::new(store.clone(), ReadOptions::default());
        let directory = Arc::new(CollectionDirectory::new(reader, "customers"));
        let scope = resolver(store, directory)
            .resolve(&ScopeSelector::Partner("p1".to_string()), &range())
            .await
            .unwrap();

        assert_eq!(scope.member_count(), 2);
        let c1 = scope
            .customers
            .iter()
            .find(|c| c.customer_id == "c1")
            .unwrap();
        assert_eq!(c1.channel_ids, vec![ChannelId::from("ch-a"), ChannelId::from("ch-b")]);
    }

    #[tokio::test]
    async fn test_unknown_partner_not_found() {
        let store = seeded();
        let directory = Arc::new(StaticDirectory::new().with_partner("p1", ["c1"]));
        let err = resolver(store, directory)
            .resolve(&ScopeSelector::Partner("nobody".to_string()), &range())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PartnerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_explicit_channels_skip_lookup() {
        let store = seeded();
        let directory = Arc::new(StaticDirectory::new());
        let selector = ScopeSelector::Explicit {
            customers: vec!["c1".into(), "c2".into(), "c1".into()],
            channels: vec!["x".into()],
        };
        let scope = resolver(store.clone(), directory)
            .resolve(&selector, &range())
            .await
            .unwrap();

        assert_eq!(scope.member_count(), 2);
        assert!(scope.customers.iter().all(|c| c.channel_ids == vec![ChannelId::from("x")]));
        assert_eq!(store.distinct_calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_without_customers_rejected() {
        let selector = ScopeSelector::Explicit {
            customers: Vec::new(),
            channels: Vec::new(),
        };
        let err = resolver(seeded(), Arc::new(StaticDirectory::new()))
            .resolve(&selector, &range())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_customer_without_activity_has_no_channels() {
        let selector = ScopeSelector::Explicit {
            customers: vec!["c9".into()],
            channels: Vec::new(),
        };
        let scope = resolver(seeded(), Arc::new(StaticDirectory::new()))
            .resolve(&selector, &range())
            .await
            .unwrap();
        assert!(scope.customers[0].channel_ids.is_empty());
    }
}
