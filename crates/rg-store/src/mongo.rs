//! MongoDB message store
//!
//! Messages live in `connectionsMsgs` / `applicationsMsgs` depending on
//! direction. Ids come from a shared `counters` document so they stay unique
//! across both collections. Properties are stored as a nested document and
//! filtered with `properties.<key>` matches.

use std::collections::HashMap;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use rg_common::{
    DestinationType, Direction, Message, MessageCriteria, MessageStatus, OrderField, OrderType,
    SourceType,
};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::repository::MessageStore;

const CONNECTIONS_COLLECTION: &str = "connectionsMsgs";
const APPLICATIONS_COLLECTION: &str = "applicationsMsgs";
const COUNTERS_COLLECTION: &str = "counters";
const MESSAGE_SEQUENCE: &str = "messages";

pub struct MongoMessageStore {
    db: Database,
}

impl MongoMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn connect(url: &str, database: &str) -> Result<Self> {
        let client = mongodb::Client::with_uri_str(url).await?;
        Ok(Self::new(client.database(database)))
    }

    fn collection(&self, direction: Direction) -> Option<Collection<Document>> {
        let name = match direction {
            Direction::ToConnections => CONNECTIONS_COLLECTION,
            Direction::ToApplications => APPLICATIONS_COLLECTION,
            Direction::Unknown => return None,
        };
        Some(self.db.collection(name))
    }

    fn collections_for(&self, criteria: &MessageCriteria) -> Vec<Collection<Document>> {
        match criteria.direction {
            Some(direction) => self.collection(direction).into_iter().collect(),
            None => vec![
                self.db.collection(CONNECTIONS_COLLECTION),
                self.db.collection(APPLICATIONS_COLLECTION),
            ],
        }
    }

    async fn next_id(&self) -> Result<i64> {
        let counters: Collection<Document> = self.db.collection(COUNTERS_COLLECTION);
        let counter = counters
            .find_one_and_update(doc! { "_id": MESSAGE_SEQUENCE }, doc! { "$inc": { "seq": 1_i64 } })
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await?
            .ok_or_else(|| StoreError::invalid_data("message id counter missing after upsert"))?;
        counter
            .get_i64("seq")
            .map_err(|e| StoreError::invalid_data(format!("message id counter: {}", e)))
    }

    async fn list_collection(
        &self,
        collection: &Collection<Document>,
        criteria: &MessageCriteria,
    ) -> Result<Vec<Message>> {
        let mut cursor = collection
            .find(build_filter(criteria)?)
            .sort(build_sort(criteria))
            .skip(criteria.offset)
            .limit(criteria.effective_limit() as i64)
            .await?;

        let mut messages = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            messages.push(document_to_message(&document)?);
        }
        Ok(messages)
    }
}

/// Query document for `criteria`, ignoring direction, ordering and paging
pub fn build_filter(criteria: &MessageCriteria) -> Result<Document> {
    let mut filter = Document::new();

    if !criteria.statuses.is_empty() {
        let codes: Vec<i32> = criteria.statuses.iter().map(|s| s.code()).collect();
        filter.insert("status", doc! { "$in": codes });
    }
    if let Some(ref message_type) = criteria.message_type {
        filter.insert("type", message_type.as_str());
    }
    if let Some(ref destination) = criteria.destination {
        filter.insert("destination", destination.as_str());
    }
    if let Some(destination_type) = criteria.destination_type {
        filter.insert("destination_type", destination_type.code());
    }
    for (key, value) in &criteria.properties {
        filter.insert(format!("properties.{}", key), bson::to_bson(value)?);
    }
    Ok(filter)
}

pub fn build_sort(criteria: &MessageCriteria) -> Document {
    let field = match criteria.order_by {
        None | Some(OrderField::Id) => "_id",
        Some(OrderField::CreationTime) => "creation_time",
        Some(OrderField::ModificationTime) => "modification_time",
        Some(OrderField::Status) => "status",
    };
    let order = match criteria.order_type {
        OrderType::Upwards => 1,
        OrderType::Downwards => -1,
    };
    let mut sort = Document::new();
    sort.insert(field, order);
    if field != "_id" {
        sort.insert("_id", order);
    }
    sort
}

fn message_to_document(message: &Message, id: i64) -> Result<Document> {
    let properties: serde_json::Map<String, Value> = message
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(doc! {
        "_id": id,
        "reference": &message.reference,
        "account_id": &message.account_id,
        "type": &message.message_type,
        "direction": message.direction.code(),
        "source": message.source.as_deref(),
        "source_type": message.source_type.code(),
        "destination": message.destination.as_deref(),
        "destination_type": message.destination_type.code(),
        "status": message.status.code(),
        "properties": bson::to_bson(&Value::Object(properties))?,
        "creation_time": bson::DateTime::from_chrono(message.creation_time),
        "modification_time": message.modification_time.map(bson::DateTime::from_chrono),
    })
}

fn int_field(document: &Document, key: &str) -> Result<i32> {
    match document.get(key) {
        Some(Bson::Int32(v)) => Ok(*v),
        Some(Bson::Int64(v)) => Ok(*v as i32),
        _ => Err(StoreError::invalid_data(format!("missing integer field '{}'", key))),
    }
}

fn string_field(document: &Document, key: &str) -> Result<String> {
    document
        .get_str(key)
        .map(str::to_string)
        .map_err(|_| StoreError::invalid_data(format!("missing string field '{}'", key)))
}

fn optional_string(document: &Document, key: &str) -> Option<String> {
    document.get_str(key).ok().map(str::to_string)
}

fn document_to_message(document: &Document) -> Result<Message> {
    let id = match document.get("_id") {
        Some(Bson::Int64(v)) => *v,
        Some(Bson::Int32(v)) => *v as i64,
        _ => return Err(StoreError::invalid_data("message document without numeric _id")),
    };
    let status_code = int_field(document, "status")?;
    let status = MessageStatus::from_code(status_code)
        .ok_or_else(|| StoreError::invalid_data(format!("unknown status code {}", status_code)))?;

    let properties: HashMap<String, Value> = match document.get_document("properties") {
        Ok(props) => props
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into_relaxed_extjson()))
            .collect(),
        Err(_) => HashMap::new(),
    };

    let creation_time = document
        .get_datetime("creation_time")
        .map(|dt| dt.to_chrono())
        .map_err(|_| StoreError::invalid_data("missing or invalid datetime field 'creation_time'"))?;
    let modification_time = document
        .get_datetime("modification_time")
        .ok()
        .map(|dt| dt.to_chrono());

    Ok(Message {
        id: Some(id),
        reference: string_field(document, "reference")?,
        account_id: string_field(document, "account_id")?,
        message_type: string_field(document, "type")?,
        direction: Direction::from_code(int_field(document, "direction")?),
        source: optional_string(document, "source"),
        source_type: SourceType::from_code(int_field(document, "source_type")?),
        destination: optional_string(document, "destination"),
        destination_type: DestinationType::from_code(int_field(document, "destination_type")?),
        status,
        properties,
        creation_time,
        modification_time,
    })
}

#[async_trait]
impl MessageStore for MongoMessageStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<()> {
        let collection = self.collection(message.direction).ok_or_else(|| {
            StoreError::rejected(format!(
                "direction {:?} of message {} is not supported",
                message.direction, message.reference
            ))
        })?;

        match message.id {
            None => {
                let id = self.next_id().await?;
                collection.insert_one(message_to_document(message, id)?).await?;
                message.id = Some(id);
                debug!(message_id = id, "Inserted message document");
            }
            Some(id) => {
                let result = collection
                    .replace_one(doc! { "_id": id }, message_to_document(message, id)?)
                    .await?;
                if result.matched_count == 0 {
                    return Err(StoreError::NotFound { id });
                }
                debug!(message_id = id, status = %message.status, "Updated message document");
            }
        }
        Ok(())
    }

    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64> {
        let filter = build_filter(criteria)?;
        let update = doc! {
            "$set": {
                "status": status.code(),
                "modification_time": bson::DateTime::from_chrono(Utc::now()),
            }
        };

        let mut updated = 0;
        for collection in self.collections_for(criteria) {
            let result = collection.update_many(filter.clone(), update.clone()).await?;
            updated += result.modified_count;
        }
        Ok(updated)
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        let collections = self.collections_for(criteria);
        if collections.len() == 1 {
            return self.list_collection(&collections[0], criteria).await;
        }

        let wide = criteria.widened();
        let mut merged = Vec::new();
        for collection in &collections {
            merged.extend(self.list_collection(collection, &wide).await?);
        }
        Ok(criteria.sort_and_page(merged))
    }
}
